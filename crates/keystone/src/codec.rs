//! Stored value encoding.
//!
//! Values are JSON text. Reads fall back to the raw string when the bytes
//! are not JSON, so keys written by other tools stay readable.

use keystone_common::Result;
use serde::Serialize;
use serde_json::Value;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode(raw: &[u8]) -> Value {
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}
