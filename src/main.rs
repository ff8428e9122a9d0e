//! # fleetcore: Multi-Account Trading Execution Core
//!
//! ```text
//!  accounts.json ──▶ AccountRegistry ──▶ TradingLoopScheduler
//!                                          │  one task per (account, exchange)
//!                                          ▼
//!   EMERGENCY_STOP ─┐            ┌─ ConnectionGateway ─▶ BrokerCapability
//!   POST /control ──┼─▶ Safety ◀─┤      │ timeout · breaker · nonce ticket
//!                   │ Controller │      ▼
//!                   │    │       └─ PositionCapEnforcer (per account)
//!                   │    ▼
//!                   │  SafetyEvent ──▶ audit · log · alert relay
//!                   │
//!   GET /api/health ┘   NonceSequencer ──▶ state/nonces/<exchange>.nonce.json
//! ```
//!
//! ## Environment Variables
//!
//! | Variable          | Default               | Description                      |
//! |-------------------|-----------------------|----------------------------------|
//! | `BIND_ADDR`       | `0.0.0.0:3000`        | Control/health surface           |
//! | `ACCOUNTS_FILE`   | `accounts.json`       | Account definitions              |
//! | `NONCE_DIR`       | `state/nonces`        | Persisted nonce per exchange     |
//! | `STATE_FILE`      | `state/snapshot.json` | Kill switches + unwind progress  |
//! | `CONTROL_API_KEY` | unset                 | `X-API-Key` for control routes   |
//! | `RUST_LOG`        | `fleetcore=debug`     | Tracing filter                   |

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod auth;
mod broker;
mod config;
mod decision;
mod engine;
mod error;
mod events;
mod models;
mod nonce;
mod registry;
mod routes;
mod safety;
mod scheduler;
mod snapshot;
mod state;

use broker::paper::PaperBrokerFactory;
use config::AppConfig;
use decision::HoldEngine;
use engine::PositionCapEnforcer;
use nonce::{FileNonceStore, NonceSequencer};
use registry::AccountRegistry;
use safety::SafetyController;
use scheduler::TradingLoopScheduler;
use snapshot::StateSnapshot;
use state::build_state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("fleetcore=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║           FLEETCORE · Trading Execution Core          ║
  ║   Accounts · Nonces · Safety · Caps · Trading Loops   ║
  ╚═══════════════════════════════════════════════════════╝"#);

    let config = AppConfig::from_env()?;

    // ── 3. Accounts ───────────────────────────────────────────────────────────
    let registry = Arc::new(AccountRegistry::new(config.scheduler.broker_timeout));
    let report = registry
        .load_file(&config.accounts_file)
        .with_context(|| format!("loading {}", config.accounts_file.display()))?;
    info!(
        registered = report.registered.len(),
        rejected = report.rejected.len(),
        "accounts loaded"
    );

    // ── 4. Nonces · Safety · Snapshot ─────────────────────────────────────────
    let nonces = Arc::new(NonceSequencer::new(
        Arc::new(FileNonceStore::new(&config.nonce_dir)),
        config.nonce.clone(),
    ));
    let persister = nonces.spawn_persister();

    let safety = Arc::new(SafetyController::new(config.safety.clone()));
    safety.poll_sentinel();

    let restored = match StateSnapshot::load(&config.state_file) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(path = %config.state_file.display(), error = %e, "ignoring unreadable state snapshot");
            None
        }
    };

    // ── 5. Trading loops ──────────────────────────────────────────────────────
    let scheduler = Arc::new(TradingLoopScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&safety),
        Arc::clone(&nonces),
        Arc::new(PaperBrokerFactory::from_env()),
        Arc::new(HoldEngine),
        PositionCapEnforcer::new(config.enforcer.clone()),
    ));
    if let Some(snapshot) = &restored {
        scheduler.restore_unwinds(snapshot.unwinds.clone());
    }
    for account in registry.accounts() {
        if let Err(e) = scheduler.add_account(Arc::clone(&account)) {
            error!(account = %account.id, error = %e, "account not scheduled");
        }
    }
    if let Some(snapshot) = &restored {
        snapshot.apply_kills(&safety);
    }

    // ── 6. Background relays ──────────────────────────────────────────────────
    let alerts = tokio::spawn(relay_alerts(Arc::clone(&safety)));
    let snapshots = {
        let signal = scheduler.snapshot_signal();
        let (path, safety, scheduler) = (config.state_file.clone(), Arc::clone(&safety), Arc::clone(&scheduler));
        tokio::spawn(async move {
            loop {
                signal.notified().await;
                snapshot::persist(&path, &safety, &scheduler).await;
            }
        })
    };

    // ── 7. Control / health surface ───────────────────────────────────────────
    let state = build_state(Arc::clone(&registry), Arc::clone(&safety), Arc::clone(&scheduler));
    let app = routes::router(state);

    info!(addr = ?config.bind_addr, "🚀 fleetcore control surface starting");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 8. Drain ──────────────────────────────────────────────────────────────
    scheduler.shutdown().await;
    nonces.persist_all();
    snapshot::persist(&config.state_file, &safety, &scheduler).await;
    snapshots.abort();
    alerts.abort();
    if let Some(persister) = persister {
        persister.abort();
    }
    info!("👋 fleetcore stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    info!("🛑 shutdown requested, stopping at cycle boundaries");
}

/// Forward alert-level safety events to the alerting log target.
async fn relay_alerts(safety: Arc<SafetyController>) {
    let mut events = safety.subscribe();
    loop {
        match events.recv().await {
            Ok(event) if event.is_alert() => {
                error!(target: "fleetcore::alerts", alert = %event.to_json(), "🚨 ALERT");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "alert relay lagged; see the audit trail for missed events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
