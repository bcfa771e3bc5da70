//! # TBot — Strategy Scanning Backend
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────┐  /api/v1/strategies   ┌───────────────┐
//!  │  Dashboard   │ ─────────────────────▶│ StrategyStore │
//!  │  (browser)   │  /api/v1/scans/:id/*  └───────┬───────┘
//!  │              │ ──────────┐                   │ Arc<Strategy>
//!  └──────────────┘           ▼                   ▼
//!         ▲            ┌─────────────┐    ┌──────────────┐
//!         │            │ ScanManager │◀───│  Scheduler   │ (cron)
//!         │            └──────┬──────┘    └──────────────┘
//!         │                   │ one task per strategy
//!         │                   ▼
//!         │       ┌────────────────────────┐    ┌──────────────┐
//!         │       │ scan loop: phase 1 → 2 │───▶│ MarketData   │ upbit / mock
//!         │       └───────────┬────────────┘    └──────────────┘
//!         │                   │ ScanEvent
//!         └── /ws/v1/updates ─┘ (broadcast)
//! ```
//!
//! ## Environment Variables
//!
//! See [`config`] for the full table.  The most common ones:
//!
//! | Variable        | Default          | Description                     |
//! |-----------------|------------------|---------------------------------|
//! | `BIND_ADDR`     | `0.0.0.0:8000`   | Address Axum listens on         |
//! | `DATABASE_URL`  | unset            | PostgreSQL (feature `postgres`) |
//! | `RUST_LOG`      | `tbot=debug`     | Tracing filter                  |

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod broker;
mod config;
#[cfg(feature = "postgres")]
mod db;
mod engine;
mod error;
mod events;
mod models;
mod routes;
mod state;
mod store;

use broker::DefaultBrokers;
use config::AppConfig;
use state::build_state;
use store::{MemoryStore, StrategyStore};

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("tbot=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║          TBOT — Strategy Scanner              ║
  ║   Rule trees · Two-phase scans · Live feed    ║
  ╚═══════════════════════════════════════════════╝"#
    );

    // ── 3. Config ─────────────────────────────────────────────────────────────
    let config = AppConfig::from_env()?;

    // ── 4. Store ──────────────────────────────────────────────────────────────
    let store = open_store(&config).await?;

    // ── 5. Shared state ───────────────────────────────────────────────────────
    let state = build_state(
        store,
        Arc::new(DefaultBrokers::new(&config.upbit)),
        config.scan.clone(),
        config.broadcast_capacity,
    );

    // ── 6. Cron jobs for active strategies ────────────────────────────────────
    schedule_active(&state).await?;

    // ── 7. Router ─────────────────────────────────────────────────────────────
    let app = routes::router(state.clone());

    // ── 8. Bind & Serve ───────────────────────────────────────────────────────
    info!(addr = ?config.bind_addr, "🚀 TBot server starting");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 9. Wind down ──────────────────────────────────────────────────────────
    state.scheduler.shutdown();
    state.scans.stop_all().await;
    info!("👋 TBot stopped");

    Ok(())
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn StrategyStore>> {
    #[cfg(feature = "postgres")]
    {
        if let Some(url) = &config.database_url {
            return Ok(Arc::new(db::PgStore::connect(url).await?));
        }
    }

    #[cfg(not(feature = "postgres"))]
    {
        if config.database_url.is_some() {
            warn!("DATABASE_URL is set but the `postgres` feature is off, using in-memory store");
        }
    }

    info!("Using in-memory strategy store");
    Ok(Arc::new(MemoryStore::new()))
}

async fn schedule_active(state: &state::AppState) -> anyhow::Result<()> {
    const PAGE: usize = 500;
    let mut skip = 0;
    let mut scheduled = 0;
    loop {
        let page = state.store.list(skip, PAGE).await?;
        for strategy in &page {
            match state.scheduler.schedule(Arc::new(strategy.clone())) {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(e) => warn!(strategy_id = strategy.id, error = %e, "strategy not scheduled"),
            }
        }
        if page.len() < PAGE {
            break;
        }
        skip += PAGE;
    }
    info!(scheduled, "⏰ Cron jobs registered");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
