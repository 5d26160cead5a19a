use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_core::{AttendanceSession, CosineMatcher};
use rollcall_store::Database;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod extractor;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use extractor::CommandExtractor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    let db = Database::open(&config.db_path, config.profile(), config.busy_timeout())
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    let session = AttendanceSession::new(
        Arc::new(db.identities()),
        Arc::new(db.ledger()),
        config.profile(),
        CosineMatcher::new(config.distance_threshold),
    );
    tracing::info!(
        threshold = config.distance_threshold,
        dimension = config.embedding_dim,
        model_version = %config.model_version,
        "attendance session ready"
    );

    let extractor = config
        .extractor_command
        .as_deref()
        .map(CommandExtractor::from_command_line)
        .transpose()?;
    match &extractor {
        Some(e) => tracing::info!(program = e.program(), "extractor configured"),
        None => tracing::warn!("no extractor configured; CaptureAttendance disabled"),
    }

    let service = AttendanceService::new(session, extractor, config.submit_timeout());

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, session_bus = config.session_bus, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
