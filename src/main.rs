//! Helmsman - fleet control plane for tenant container hosting
//!
//! "A steady hand on the tiller"

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use helmsman::{config::Args, db::Db, server, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("helmsman={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Helmsman - fleet control plane");
    info!("  \"A steady hand on the tiller\"");
    info!("======================================");
    info!("Instance: {}", args.instance_id);
    info!("Listen: {}", args.listen);
    info!("Database: {}", args.database_path.display());
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!(
        "Heartbeat thresholds: soft {}ms / hard {}ms",
        args.heartbeat_soft_ms, args.heartbeat_hard_ms
    );
    info!(
        "Object store: {}",
        args.storage_url
            .clone()
            .unwrap_or_else(|| args.storage_dir.display().to_string())
    );
    info!("======================================");

    let db = match Db::open(&args.database_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Database open failed: {}", e);
            std::process::exit(1);
        }
    };

    // The payment processor integration is deployment-specific; without one
    // configured, auto-topup stays off and webhook credits still apply
    // through the ledger's idempotent references
    let services = Arc::new(Services::build(args, db, None)?);

    let handles = services.start_background().await?;
    info!("Background sweepers started ({})", handles.len());

    let server_services = Arc::clone(&services);
    tokio::select! {
        result = server::run(server_services) => {
            if let Err(e) = result {
                error!("Server error: {:?}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    for handle in handles {
        handle.abort();
    }
    info!("Helmsman stopped");
    Ok(())
}
