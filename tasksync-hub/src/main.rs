//! `TaskSync` hub -- real-time task synchronization server.
//!
//! An axum WebSocket server that authenticates client connections,
//! groups them by owning user, and fans task mutation events out to
//! every connection in the owner's group.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100
//! cargo run --bin tasksync-hub
//!
//! # Run on custom address
//! cargo run --bin tasksync-hub -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! HUB_ADDR=127.0.0.1:8080 cargo run --bin tasksync-hub
//! ```

use std::sync::Arc;

use clap::Parser;
use tasksync_hub::auth::TokenRegistry;
use tasksync_hub::config::{HubCliArgs, HubConfig};
use tasksync_hub::hub::{self, HubState};

#[tokio::main]
async fn main() {
    let cli = HubCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match HubConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting tasksync hub");

    let registry = Arc::new(TokenRegistry::new());
    for (token, user_id) in &config.tokens {
        registry.insert(token, *user_id);
    }
    if config.tokens.is_empty() {
        tracing::warn!("no tokens configured, every connection will be refused");
    }

    let state = Arc::new(HubState::with_config(registry, config.max_frame_size));

    match hub::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "hub listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "hub server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start hub");
            std::process::exit(1);
        }
    }
}
