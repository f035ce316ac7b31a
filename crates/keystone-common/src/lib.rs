//! # Keystone Common
//!
//! Shared types, errors, and constants used across Keystone components.
//!
//! ## Modules
//! - `types` - Field maps, listing options, stored key/value records
//! - `error` - The library error type
//! - `constants` - Shared defaults and key layouts

pub mod constants;
pub mod error;
pub mod types;

pub use error::{KeystoneError, Result};
pub use types::*;
