// main.rs

mod buttons;
mod compass;
mod config;
mod display;
mod gnss;
mod menu;
mod render;
mod state;
mod store;
mod supervisor;
mod sync;
mod telemetry;
mod wifi;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use elcano_mbtiles::{ManagerConfig, MbtilesManager};

use crate::compass::CompassReader;
use crate::config::Config;
use crate::display::Epd;
use crate::gnss::GnssReader;
use crate::render::Renderer;
use crate::state::AppState;
use crate::store::{DeviceInfo, Store};
use crate::supervisor::Supervisor;
use crate::sync::SyncEngine;
use crate::telemetry::TelemetryCore;

const DEFAULT_CONFIG_PATH: &str = "/opt/elcano/navigation_config.json";

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    info!("shutdown requested");
    state.request_shutdown();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path);

    // --- Store ---
    let store = Store::open(&config.database_path)
        .await
        .context("store initialization failed")?;
    let report = store
        .reconcile_startup()
        .await
        .context("store reconciliation failed")?;
    if report.trips_deactivated > 0 || report.orphan_waypoints > 0 {
        warn!(
            deactivated = report.trips_deactivated,
            orphans = report.orphan_waypoints,
            "startup reconciliation repaired state"
        );
    }
    if let Some(trip) = store.get_active_trip().await? {
        info!(trip = %trip.id, title = %trip.title, "resuming active trip");
    }

    // --- Sync ---
    let sync_key = sync::read_sync_key(&config.settings_path);
    if sync::is_valid_sync_key(sync_key.as_deref()) && store.get_device_info().await?.is_none() {
        // Provisional identity carrying the configured key; the first
        // successful pull replaces it with the backend's record.
        store
            .upsert_device_info(&DeviceInfo {
                id: "unprovisioned".to_string(),
                name: "Elcano One".to_string(),
                sync_key: sync_key.clone().unwrap_or_default(),
                fetched_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                ..DeviceInfo::default()
            })
            .await?;
    }
    let sync_engine = SyncEngine::new(&config.api_base_url, sync_key)?;

    // --- Tiles ---
    let manager_cfg = ManagerConfig {
        max_open: config.mbtiles_settings.max_open_files,
        cache_timeout: Duration::from_secs(config.mbtiles_settings.cache_timeout),
    };
    let manager = Arc::new(
        MbtilesManager::discover(&config.assets_folder, manager_cfg)
            .await
            .context("tile archive discovery failed")?,
    );

    // --- Display (fatal when absent) ---
    let renderer = Renderer::new(config.display_width, config.display_height);
    let mut epd = Epd::new(config.display_width, config.display_height)
        .context("display initialization failed")?;
    epd.init().context("display initialization failed")?;

    // --- Sensors ---
    let telemetry = Arc::new(TelemetryCore::new(Duration::from_secs(
        config.logbook_interval,
    )));
    let gnss = GnssReader::start(&config.gnss_port, config.gnss_baud, telemetry.clone())
        .context("GNSS startup failed")?;
    let compass = match CompassReader::start(telemetry.clone()) {
        Ok(compass) => Some(compass),
        Err(err) => {
            warn!(error = %err, "compass unavailable, continuing with GNSS heading only");
            None
        }
    };

    // --- Buttons ---
    let state = AppState::new(config, store, telemetry, sync_engine);
    let (panel, button_rx) = match buttons::wire(&state.config.button_pins) {
        Ok(wired) => {
            let (panel, rx) = wired;
            (Some(panel), rx)
        }
        Err(err) => {
            warn!(error = %err, "button panel unavailable, running without input");
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            (None, rx)
        }
    };

    tokio::spawn(shutdown_signal(state.clone()));

    // --- Main loop ---
    let supervisor = Supervisor::new(
        state.clone(),
        manager.clone(),
        renderer,
        epd,
        button_rx,
        compass,
    );
    let run_result = supervisor.run().await;

    // Tear everything down even when the loop errored out.
    state.request_shutdown();
    gnss.stop();
    manager.close_all().await;
    state.store.close().await;
    drop(panel);

    run_result.context("supervisor failed")?;
    info!("navigator stopped");
    Ok(())
}
