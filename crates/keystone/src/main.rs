//! # Keystone operator CLI
//!
//! Inspect and drive Keystone entities stored in Redis.
//!
//! ```text
//! keystone --template '/discovery/{serviceName}/{instanceId}' ls serviceName=svc-A
//! keystone --template '/jobs/tasks/{jobId}/{taskId}' watch --single jobId=j1
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use keystone::codec;
use keystone::{
    AppConfig, EntityEvent, EntityService, FieldSchema, Fields, LeaseOutcome, ListOptions,
    PathTemplate, RedisStore, WatchOptions,
};
use keystone_common::constants::templates;
use keystone_common::{Registration, SortOrder, SortTarget};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Keystone - coordination substrate operator CLI
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/keystone.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Entity key template
    #[arg(short, long, default_value = templates::DISCOVERY)]
    template: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one record
    Get {
        /// Fields as name=value
        fields: Vec<String>,
    },
    /// Write one record
    Put {
        /// JSON value (plain text is stored as a string)
        #[arg(short, long)]
        value: String,
        fields: Vec<String>,
    },
    /// Delete one record, or a subtree with --all
    Del {
        #[arg(long)]
        all: bool,
        fields: Vec<String>,
    },
    /// List records under a subtree
    Ls {
        #[arg(long, default_value = "mod")]
        order: SortTarget,
        #[arg(long, default_value = "desc")]
        sort: SortOrder,
        /// Maximum records (defaults to the configured cap)
        #[arg(long)]
        limit: Option<usize>,
        fields: Vec<String>,
    },
    /// Stream changes under a subtree until interrupted
    Watch {
        /// Only print notifications this process wins the lock for
        #[arg(long)]
        single: bool,
        fields: Vec<String>,
    },
    /// Register a record under a lease and keep it alive until interrupted
    Announce {
        #[arg(short, long)]
        value: String,
        /// Lease TTL in seconds (defaults to the configured TTL)
        #[arg(long)]
        ttl: Option<u64>,
        fields: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    let mut config = AppConfig::load(&args.config)?;
    if let Some(ref redis_url) = args.redis_url {
        config.redis_url = redis_url.clone();
    }

    let store = RedisStore::connect(&config.redis_url, &config.key_prefix, config.watch.buffer)
        .await
        .context("Failed to connect to Redis")?;
    info!(redis = %config.redis_url, node = %config.node_id, "Connected");

    let template = PathTemplate::compile(&args.template).context("Invalid template")?;
    let schema = FieldSchema::from_template(&template);
    let service = EntityService::with_settings(
        Arc::new(store),
        template,
        schema,
        config.service_settings(),
    );

    match args.command {
        Command::Get { fields } => {
            let fields = parse_fields(&fields)?;
            match service.get(&fields).await? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("{} not found", service.path(&fields)?),
            }
        }
        Command::Put { value, fields } => {
            let fields = parse_fields(&fields)?;
            let revision = service.set(&fields, &parse_value(&value)).await?;
            println!("{} @ {}", service.path(&fields)?, revision);
        }
        Command::Del { all, fields } => {
            let fields = parse_fields(&fields)?;
            if all {
                println!("deleted {}", service.delete_all(&fields).await?);
            } else if !service.delete(&fields).await? {
                bail!("{} not found", service.path(&fields)?);
            }
        }
        Command::Ls {
            order,
            sort,
            limit,
            fields,
        } => {
            let fields = parse_fields(&fields)?;
            let options = ListOptions { order, sort, limit };
            for entry in service.list(&fields, options).await? {
                println!("{}\t{}", entry.key, entry.value);
            }
        }
        Command::Watch { single, fields } => {
            let fields = parse_fields(&fields)?;
            let mut subscription = service
                .watch(&fields, WatchOptions { lock: single })
                .await?;
            info!(path = %subscription.path(), single, "Watching");

            loop {
                tokio::select! {
                    event = subscription.recv() => match event {
                        Some(EntityEvent::Change(entry)) => println!("PUT\t{}\t{}", entry.key, entry.value),
                        Some(EntityEvent::Delete(entry)) => println!("DELETE\t{}", entry.key),
                        Some(EntityEvent::Error { path, error }) => {
                            tracing::warn!(path = %path, error = %error, "Watch error");
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            service.unwatch(&fields).await?;
        }
        Command::Announce { value, ttl, fields } => {
            let fields = parse_fields(&fields)?;
            let ttl = ttl.map(Duration::from_secs).unwrap_or_else(|| config.lease_ttl());
            let record = Registration::new(config.node_id.clone(), parse_value(&value));

            match service.register(&fields, &record, ttl).await? {
                LeaseOutcome::Created(lease) => {
                    println!("{} registered (lease {})", service.path(&fields)?, lease);
                }
                LeaseOutcome::Conflict => bail!("already registered"),
            }

            tokio::signal::ctrl_c()
                .await
                .context("Failed to install Ctrl+C handler")?;
            info!("Shutdown signal received");
            service.revoke_registration().await?;
        }
    }

    Ok(())
}

/// Parse `name=value` arguments
fn parse_fields(raw: &[String]) -> Result<Fields> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("expected name=value, got '{}'", pair))
        })
        .collect()
}

fn parse_value(raw: &str) -> Value {
    codec::decode(raw.as_bytes())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
