use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod locks;
mod rate_limiter;
mod scan;
mod store;

const BUS_NAME: &str = "org.presence.Attendance1";
const OBJECT_PATH: &str = "/org/presence/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = config::Config::from_env().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        match_threshold = config.pipeline.match_threshold,
        live_threshold = config.pipeline.quality.live_threshold,
        session_timeout_secs = config.session_timeout_secs,
        "configuration loaded"
    );

    let store = store::AttendanceStore::open(&config.db_path)
        .await
        .context("opening attendance store")?;

    let engine = engine::spawn_engine(
        config.pipeline.clone(),
        Duration::from_secs(config.session_timeout_secs),
        config.max_sessions,
    )?;

    let service = scan::AttendanceService::new(
        store,
        engine.clone(),
        presence_core::ScanPipeline::new(config.pipeline.clone()),
        config.default_shift,
        scan::system_clock(),
    );

    let session_bus = config.session_bus;
    let iface = dbus_interface::PresenceService { service, config };

    let builder = if session_bus {
        tracing::info!("using session bus");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");
    engine.shutdown().await;

    Ok(())
}
