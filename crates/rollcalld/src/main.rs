use anyhow::{Context, Result};
use rollcall_ledger::Ledger;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use zbus::connection;

mod config;
mod dbus_interface;
mod engine;
mod jobs;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        threshold = config.distance_threshold,
        policy = ?config.conflict_policy,
        "configuration loaded"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let ledger = Ledger::open(&config.db_path)
        .with_context(|| format!("opening attendance database {}", config.db_path.display()))?;

    let engine = engine::spawn_engine(&config).context("starting recognition engine")?;

    let service = AttendanceService::new(
        Arc::new(Mutex::new(ledger)),
        engine,
        config.recognize_timeout(),
        config.conflict_policy,
        config.distance_threshold,
    );

    let builder = match config.bus {
        BusKind::Session => connection::Builder::session()?,
        BusKind::System => connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
