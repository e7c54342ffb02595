use anyhow::{Context, Result};
use presence_core::{Config, FaceGallery, LedgerStore};
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    let ledger = LedgerStore::new(&config.ledger_path);
    ledger.initialize().context("failed to initialize attendance ledger")?;

    let engine = engine::spawn_engine(&config).context("failed to start engine")?;
    let service = AttendanceService::new(
        engine,
        FaceGallery::new(&config.gallery_dir),
        ledger,
        config.camera_device.clone(),
    );

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
