// SPDX-License-Identifier: MIT OR Apache-2.0
#![warn(missing_docs)]
//! ReceiptGate daemon entry point: loads configuration from the environment,
//! selects a store backend from the database URL scheme, and serves the
//! REST + JSON-RPC surface.

use anyhow::{Context, Result, bail};
use clap::Parser;
use rg_daemon::{AppState, build_app};
use rg_ledger::{Ledger, LedgerOptions};
use rg_store::LedgerStore;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "receiptgate", version, about = "ReceiptGate receipt ledger daemon")]
struct Args {
    /// Enable verbose (debug-level) logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("rg_daemon=debug,rg_ledger=debug,rg_store=debug,info")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = rg_config::Config::from_env().context("loading configuration from environment")?;
    for warning in rg_config::validate(&config).context("validating configuration")? {
        warn!(%warning, "configuration warning");
    }

    let store = connect_store(&config.database_url).await?;

    let options = LedgerOptions {
        validate_limits: rg_validate::ValidateLimits {
            receipt_body_max_bytes: config.receipt_body_max_bytes,
        },
        receipt_chain_max_depth: config.receipt_chain_max_depth,
        search_default_limit: config.search_default_limit,
        search_max_limit: config.search_max_limit,
        enforce_cause_exists: config.enforce_cause_exists,
    };
    let ledger = Arc::new(Ledger::new(store, options));
    let state = Arc::new(AppState {
        ledger,
        config: Arc::new(config),
    });

    let app = build_app(state.clone());
    let bind = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("bind {bind}"))?;
    info!(%bind, service = %state.config.service_name, "receiptgate listening");

    axum::serve(listener, app).await.context("serve")
}

async fn connect_store(database_url: &str) -> Result<Arc<dyn LedgerStore>> {
    if let Some(scheme) = database_url.split("://").next() {
        match scheme {
            "sqlite" => return Ok(Arc::new(rg_store::sqlite::SqliteStore::connect(database_url).await?)),
            "postgres" | "postgresql" => return Ok(Arc::new(rg_store::postgres::PostgresStore::connect(database_url).await?)),
            "memory" => return Ok(Arc::new(rg_store::memory::MemoryStore::new())),
            _ => {}
        }
    }
    bail!("unsupported database URL scheme in '{database_url}' (expected sqlite://, postgres://, postgresql://, or memory://)")
}
