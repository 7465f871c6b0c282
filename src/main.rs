//! discovery-guard CLI
//!
//! Discovers company pages for the given names through the guard and prints
//! one JSON line per result.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use discovery_guard::{
    clock::{SharedClock, SystemClock},
    config::Args,
    provider::{HttpProvider, SharedProvider},
    store::{JsonFileStore, MemoryStore, SharedStore},
    DiscoveryGuard,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("discovery_guard={},warn", args.log_level).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    let config = args.to_config();
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let store: SharedStore = match &args.store_path {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .await
                .with_context(|| format!("opening store at {}", path.display()))?,
        ),
        None => {
            info!("No --store-path given, state is in-memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let provider: SharedProvider =
        Arc::new(HttpProvider::new(args.to_provider_config()).context("building HTTP provider")?);
    let clock: SharedClock = Arc::new(SystemClock);

    let guard = DiscoveryGuard::new(config, provider, store, clock)?;
    if let Err(e) = guard.restore().await {
        warn!("Failed to restore persisted state, starting fresh: {}", e);
    }
    guard.start();

    for name in &args.names {
        let line = match guard.discover(name, args.priority).await {
            Ok(discovery) => serde_json::to_value(&discovery)?,
            Err(e) => json!({
                "name": name,
                "error": e.to_string(),
                "kind": e.kind().as_str(),
                "retryAfterSeconds": e.retry_after_seconds(),
            }),
        };
        println!("{}", line);
    }

    if args.status {
        let status = guard.status().await;
        println!("{}", serde_json::to_string(&status)?);
    }

    guard.shutdown().await;
    Ok(())
}
