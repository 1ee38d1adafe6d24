use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;

use crate::config::Config;
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::telemetry::TelemetryCore;
use crate::wifi::WifiStatus;

/// Shared application state. Everything long-lived that more than one task
/// touches hangs off this, behind its own lock.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub telemetry: Arc<TelemetryCore>,

    /// Swapped wholesale when the operator reconfigures the sync key.
    sync: RwLock<Arc<SyncEngine>>,

    /// Latest Wi-Fi probe result.
    wifi: Mutex<WifiStatus>,

    /// Set by button handlers; the next tick renders immediately.
    force_refresh: AtomicBool,

    /// True while a detached pull/drain task is in flight.
    syncing: AtomicBool,

    /// Broadcast shutdown to long-running tasks.
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Store,
        telemetry: Arc<TelemetryCore>,
        sync: SyncEngine,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(8);
        Arc::new(Self {
            config,
            store,
            telemetry,
            sync: RwLock::new(Arc::new(sync)),
            wifi: Mutex::new(WifiStatus::default()),
            force_refresh: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn shutdown_subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn sync_engine(&self) -> Arc<SyncEngine> {
        self.sync.read().unwrap().clone()
    }

    pub fn replace_sync_engine(&self, engine: SyncEngine) {
        *self.sync.write().unwrap() = Arc::new(engine);
    }

    pub fn set_wifi(&self, status: WifiStatus) {
        *self.wifi.lock().unwrap() = status;
    }

    pub fn wifi_snapshot(&self) -> WifiStatus {
        self.wifi.lock().unwrap().clone()
    }

    pub fn request_refresh(&self) {
        self.force_refresh.store(true, Ordering::Relaxed);
    }

    /// Consume the force-refresh flag.
    pub fn take_refresh_request(&self) -> bool {
        self.force_refresh.swap(false, Ordering::Relaxed)
    }

    pub fn set_syncing(&self, value: bool) {
        self.syncing.store(value, Ordering::Relaxed);
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Relaxed)
    }
}
