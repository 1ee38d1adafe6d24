use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use elcano_mbtiles::{MbtilesManager, compose};

use crate::buttons::ButtonEvent;
use crate::compass::CompassReader;
use crate::display::Epd;
use crate::gnss::Fix;
use crate::menu::{MenuAction, MenuController};
use crate::render::{MapContext, Renderer};
use crate::state::AppState;
use crate::store::{
    KV_LAST_FULL_SYNC, LogbookEntry, NewLogbookEntry, NewTrip, SYNC_PENDING, Waypoint,
};
use crate::sync::{SyncEngine, read_sync_key};
use crate::telemetry::{LogbookTrigger, TriggerReason};
use crate::wifi;

const TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScreenMode {
    Splash,
    SyncSetup,
    Waiting,
    Map,
    Menu,
}

/// Owns the main loop: screen state, display cadence, sync cadence, logbook
/// triggers, and button dispatch. The display is touched from here and
/// nowhere else.
pub struct Supervisor {
    state: Arc<AppState>,
    manager: Arc<MbtilesManager>,
    renderer: Renderer,
    display: Epd,
    buttons: mpsc::Receiver<ButtonEvent>,
    compass: Option<CompassReader>,

    mode: ScreenMode,
    menu: Option<MenuController>,
    zoom: u8,
    last_display: Option<Instant>,
    last_full_sync: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        state: Arc<AppState>,
        manager: Arc<MbtilesManager>,
        renderer: Renderer,
        display: Epd,
        buttons: mpsc::Receiver<ButtonEvent>,
        compass: Option<CompassReader>,
    ) -> Self {
        let zoom = state.config.default_zoom;
        Self {
            state,
            manager,
            renderer,
            display,
            buttons,
            compass,
            mode: ScreenMode::Splash,
            menu: None,
            zoom,
            last_display: None,
            last_full_sync: None,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.state.shutdown_subscribe();

        let splash = self.renderer.splash();
        self.display.push_frame(&splash)?;

        self.mode = if self.state.sync_engine().is_valid() {
            ScreenMode::Waiting
        } else {
            warn!("sync key missing or invalid, showing setup screen");
            ScreenMode::SyncSetup
        };

        info!("entering main loop");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK) => {
                    self.tick().await;
                }
                Some(button) = self.buttons.recv() => {
                    self.on_button(button).await;
                }
                recv = shutdown_rx.recv() => {
                    match recv {
                        Ok(_)
                        | Err(broadcast::error::RecvError::Lagged(_))
                        | Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        info!("supervisor shutting down");
        if let Some(compass) = &self.compass {
            compass.stop();
        }
        if let Err(err) = self.display.sleep() {
            warn!(error = %err, "display sleep failed");
        }
        Ok(())
    }

    async fn tick(&mut self) {
        let wifi = wifi::probe(&self.state.config.status_path).await;
        self.state.set_wifi(wifi);

        let fix = self.state.telemetry.latest_fix();

        match self.mode {
            ScreenMode::SyncSetup | ScreenMode::Menu => {}
            _ => {
                self.mode = if fix.has_fix() {
                    ScreenMode::Map
                } else {
                    ScreenMode::Waiting
                };
            }
        }

        let forced = self.state.take_refresh_request();
        let refresh_due = self
            .last_display
            .is_none_or(|at| at.elapsed() >= Duration::from_secs(self.state.config.display_update_interval));
        if refresh_due || forced {
            if let Err(err) = self.render_current(&fix).await {
                error!(error = %err, "screen update failed");
            }
            self.last_display = Some(Instant::now());
        }

        self.drive_sync(&fix);
        self.drive_logbook(&fix).await;
    }

    fn drive_sync(&mut self, fix: &Fix) {
        if !self.state.wifi_snapshot().connected {
            return;
        }
        let engine = self.state.sync_engine();
        if !engine.is_valid() {
            return;
        }

        if engine.should_ping() {
            spawn_ping(self.state.clone(), *fix);
        }

        let sync_due = self
            .last_full_sync
            .is_none_or(|at| at.elapsed() >= Duration::from_secs(self.state.config.sync_interval));
        if sync_due {
            self.last_full_sync = Some(Instant::now());
            spawn_full_sync(self.state.clone());
        }
    }

    async fn drive_logbook(&mut self, fix: &Fix) {
        let active_trip = match self.state.store.get_active_trip().await {
            Ok(trip) => trip,
            Err(err) => {
                error!(error = %err, "active trip lookup failed");
                None
            }
        };

        let trigger = self
            .state
            .telemetry
            .on_new_fix(fix, active_trip.is_some());
        if let Some(trigger) = trigger {
            self.record_logbook(trigger, active_trip.map(|t| t.id)).await;
        }
    }

    async fn record_logbook(&self, trigger: LogbookTrigger, trip_id: Option<String>) {
        let entry = new_entry(&trigger, trip_id);
        let id = match self.state.store.insert_logbook(&entry).await {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "logbook insert failed");
                return;
            }
        };
        debug!(id, reason = ?trigger.reason, "logbook entry recorded");

        // Fresh entries go up immediately when the link is there; otherwise
        // they wait for the next drain.
        if self.state.wifi_snapshot().connected && self.state.sync_engine().is_valid() {
            spawn_single_upload(self.state.clone(), saved_entry(id, entry));
        }
    }

    async fn render_current(&mut self, fix: &Fix) -> anyhow::Result<()> {
        let frame = match self.mode {
            ScreenMode::Splash => self.renderer.splash(),
            ScreenMode::SyncSetup => self.renderer.sync_setup(),
            ScreenMode::Waiting => {
                let wifi = self.state.wifi_snapshot();
                self.renderer.waiting(&wifi, fix)
            }
            ScreenMode::Menu => match &self.menu {
                Some(menu) => self.renderer.menu(&menu.view()),
                None => self.renderer.splash(),
            },
            ScreenMode::Map => self.render_map(fix).await?,
        };
        self.display.push_frame(&frame)?;
        Ok(())
    }

    async fn render_map(&mut self, fix: &Fix) -> anyhow::Result<image::GrayImage> {
        let (lat, lon) = if fix.has_fix() {
            (fix.latitude, fix.longitude)
        } else {
            let [lat, lon] = self.state.config.fallback_coordinates;
            (lat, lon)
        };
        let wifi = self.state.wifi_snapshot();

        let Some(reader) = self.manager.reader_for(lat, lon).await else {
            let regions = self.manager.regions().await;
            return Ok(self.renderer.no_map(lat, lon, &regions, &wifi, fix));
        };

        let (width, height) = (
            self.state.config.display_width,
            self.state.config.display_height,
        );
        let (png, meta) = compose(&reader, lat, lon, self.zoom, width, height, true).await?;
        drop(reader);

        if meta.tiles_found == 0 {
            let regions = self.manager.regions().await;
            return Ok(self.renderer.no_map(lat, lon, &regions, &wifi, fix));
        }

        let route = match &self.state.store.get_active_trip().await? {
            Some(trip) => self.state.store.waypoints_by_trip(&trip.id).await?,
            None => Vec::new(),
        };

        let sync_line = self.sync_status_line().await;
        let ctx = MapContext {
            lat,
            lon,
            zoom: self.zoom,
            heading: self.state.telemetry.current_heading(),
            wifi: &wifi,
            fix,
            route: &route,
            sync_line: &sync_line,
        };
        Ok(self.renderer.map(&png, &meta, &ctx))
    }

    /// One line for the map overlay describing where sync stands.
    async fn sync_status_line(&self) -> String {
        if !self.state.sync_engine().is_valid() {
            return "Sync: Setup required".to_string();
        }
        if self.state.is_syncing() {
            return "Sync: Syncing\u{2026}".to_string();
        }

        let queued = self
            .state
            .store
            .pending_logbook_count()
            .await
            .unwrap_or(0);
        if queued > 0 {
            return format!("Sync: Queue: {queued}");
        }

        match self.state.store.kv_get(KV_LAST_FULL_SYNC).await {
            Ok(Some(raw)) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => format!("Last sync: {}", at.format("%H:%M")),
                Err(_) => "Last sync: unknown".to_string(),
            },
            _ => "Sync: Never".to_string(),
        }
    }

    async fn on_button(&mut self, button: ButtonEvent) {
        debug!(?button, mode = ?self.mode, "button press");
        self.state.request_refresh();

        match self.mode {
            ScreenMode::Splash => {}
            ScreenMode::SyncSetup => self.retry_sync_key(),
            ScreenMode::Menu => self.menu_button(button).await,
            ScreenMode::Map | ScreenMode::Waiting => self.map_button(button).await,
        }
    }

    /// Any button on the setup screen re-reads the settings file.
    fn retry_sync_key(&mut self) {
        let key = read_sync_key(&self.state.config.settings_path);
        match SyncEngine::new(&self.state.config.api_base_url, key) {
            Ok(engine) => {
                let valid = engine.is_valid();
                self.state.replace_sync_engine(engine);
                if valid {
                    info!("valid sync key detected, leaving setup screen");
                    self.mode = ScreenMode::Waiting;
                } else {
                    info!("still no valid sync key");
                }
            }
            Err(err) => error!(error = %err, "sync engine rebuild failed"),
        }
    }

    async fn map_button(&mut self, button: ButtonEvent) {
        match button {
            ButtonEvent::Up => {
                if self.zoom < self.state.config.max_zoom {
                    self.zoom += 1;
                    info!(zoom = self.zoom, "zoomed in");
                }
            }
            ButtonEvent::Down => {
                if self.zoom > self.state.config.min_zoom {
                    self.zoom -= 1;
                    info!(zoom = self.zoom, "zoomed out");
                }
            }
            ButtonEvent::Left => {
                if let Some(reader) = self.manager.cycle_region(-1).await {
                    info!(region = %reader.info().name, "previous region");
                }
            }
            ButtonEvent::Right => {
                if let Some(reader) = self.manager.cycle_region(1).await {
                    info!(region = %reader.info().name, "next region");
                }
            }
            ButtonEvent::Center => {
                self.menu = Some(MenuController::new());
                self.mode = ScreenMode::Menu;
            }
        }
    }

    async fn menu_button(&mut self, button: ButtonEvent) {
        let Some(menu) = self.menu.as_mut() else {
            self.mode = ScreenMode::Map;
            return;
        };

        let sync_enabled = self.state.sync_engine().is_valid();
        let action = match menu.handle(&self.state.store, sync_enabled, button).await {
            Ok(action) => action,
            Err(err) => {
                error!(error = %err, "menu action failed");
                None
            }
        };

        match action {
            Some(MenuAction::ExitMenu) => {
                self.menu = None;
                self.mode = ScreenMode::Map;
            }
            Some(MenuAction::StartTrip(id)) => {
                self.start_trip(&id).await;
                self.menu = None;
                self.mode = ScreenMode::Map;
            }
            Some(MenuAction::StopTrip(id)) => {
                self.stop_trip(&id).await;
                self.menu = None;
                self.mode = ScreenMode::Map;
            }
            Some(MenuAction::PlanTrip) => {
                self.plan_trip().await;
                self.menu = None;
                self.mode = ScreenMode::Map;
            }
            Some(MenuAction::ForceSync) => {
                spawn_full_sync(self.state.clone());
                self.menu = None;
                self.mode = ScreenMode::Map;
            }
            Some(MenuAction::CalibrateCompass) => {
                // Deliberately blocks the loop: the operator is rotating the
                // device and nothing else is worth doing meanwhile.
                match &self.compass {
                    Some(compass) => {
                        let calibration = compass.calibrate(Duration::from_secs(30)).await;
                        info!(?calibration, "compass calibration finished");
                    }
                    None => warn!("no compass to calibrate"),
                }
                self.menu = None;
                self.mode = ScreenMode::Map;
            }
            None => {}
        }
    }

    /// Plan a trip on the device itself. The current position, when there is
    /// one, becomes the first waypoint so the route has an origin.
    async fn plan_trip(&mut self) {
        let now = Utc::now();
        let trip = NewTrip {
            id: format!("local-{}", now.format("%Y%m%d%H%M%S")),
            title: format!("Trip {}", now.format("%Y-%m-%d %H:%M")),
            description: String::new(),
            start_date: Some(now.format("%Y-%m-%d").to_string()),
            end_date: None,
            status: "PLANNED".to_string(),
        };
        if let Err(err) = self.state.store.add_trip(&trip).await {
            error!(error = %err, "trip planning failed");
            return;
        }

        let fix = self.state.telemetry.latest_fix();
        if fix.has_fix() {
            let origin = Waypoint {
                trip_id: trip.id.clone(),
                sequence: 0,
                latitude: fix.latitude,
                longitude: fix.longitude,
                name: "Start".to_string(),
            };
            if let Err(err) = self.state.store.insert_waypoint(&origin).await {
                error!(error = %err, "origin waypoint insert failed");
            }
        }
        info!(trip = %trip.id, "trip planned");
    }

    async fn start_trip(&mut self, id: &str) {
        match self.state.store.set_active_trip(id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(trip = id, "cannot start unknown trip");
                return;
            }
            Err(err) => {
                error!(error = %err, "trip activation failed");
                return;
            }
        }
        if let Err(err) = self.state.store.set_local_status(id, "IN_ROUTE").await {
            error!(error = %err, "trip status update failed");
        }
        match self.state.store.get_trip(id).await {
            Ok(Some(trip)) => info!(trip = id, title = %trip.title, "trip started"),
            _ => info!(trip = id, "trip started"),
        }

        if let Some(trigger) = self.state.telemetry.trip_event(TriggerReason::TripStart) {
            self.record_logbook(trigger, Some(id.to_string())).await;
        }
    }

    async fn stop_trip(&mut self, id: &str) {
        if let Some(trigger) = self.state.telemetry.trip_event(TriggerReason::TripStop) {
            self.record_logbook(trigger, Some(id.to_string())).await;
        }

        if let Err(err) = self.state.store.set_local_status(id, "COMPLETED").await {
            error!(error = %err, "trip status update failed");
        }
        if let Err(err) = self.state.store.clear_active_trip().await {
            error!(error = %err, "trip deactivation failed");
        }
        info!(trip = id, "trip stopped");
    }
}

fn new_entry(trigger: &LogbookTrigger, trip_id: Option<String>) -> NewLogbookEntry {
    let content = match trigger.reason {
        TriggerReason::SignificantChange | TriggerReason::Periodic => {
            "Automatic GPS tracker entry"
        }
        TriggerReason::TripStart => "Trip started",
        TriggerReason::TripStop => "Trip stopped",
    };
    NewLogbookEntry {
        trip_id,
        timestamp: trigger.fix.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        latitude: trigger.fix.latitude,
        longitude: trigger.fix.longitude,
        altitude: trigger.fix.altitude,
        speed_kmh: trigger.fix.speed_kmh,
        heading_deg: trigger.fix.heading_deg,
        satellites: i64::from(trigger.fix.satellites),
        content: content.to_string(),
    }
}

fn saved_entry(id: i64, entry: NewLogbookEntry) -> LogbookEntry {
    LogbookEntry {
        id,
        trip_id: entry.trip_id,
        timestamp: entry.timestamp,
        latitude: entry.latitude,
        longitude: entry.longitude,
        altitude: entry.altitude,
        speed_kmh: entry.speed_kmh,
        heading_deg: entry.heading_deg,
        satellites: entry.satellites,
        content: entry.content,
        sync_status: SYNC_PENDING.to_string(),
    }
}

// ======================================================================
//  Detached sync tasks
// ======================================================================
//
// Each observes the shutdown broadcast and abandons in-flight HTTP early;
// the store side of every operation is a single transaction, so there is
// nothing to unwind.

fn spawn_ping(state: Arc<AppState>, fix: Fix) {
    tokio::spawn(async move {
        let mut shutdown = state.shutdown_subscribe();
        let engine = state.sync_engine();
        let work = async {
            let fix_ref = fix.has_fix().then_some(&fix);
            let (ok, message) = engine.ping(&state.store, fix_ref).await;
            if ok {
                debug!("device ping successful");
            } else {
                warn!(%message, "device ping failed");
            }
        };
        tokio::select! {
            _ = shutdown.recv() => {}
            _ = work => {}
        }
    });
}

fn spawn_full_sync(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut shutdown = state.shutdown_subscribe();
        let engine = state.sync_engine();
        state.set_syncing(true);
        let work = async {
            let (ok, message) = engine.pull_device(&state.store).await;
            if !ok {
                warn!(%message, "device pull failed");
            }
            for result in engine.drain_pending(&state.store).await {
                info!(%result, "sync");
            }
        };
        tokio::select! {
            _ = shutdown.recv() => {}
            _ = work => {}
        }
        state.set_syncing(false);
    });
}

fn spawn_single_upload(state: Arc<AppState>, entry: LogbookEntry) {
    tokio::spawn(async move {
        let mut shutdown = state.shutdown_subscribe();
        let engine = state.sync_engine();
        let work = async {
            let (ok, message) = engine.push_logbook(&state.store, &[entry]).await;
            if !ok {
                debug!(%message, "immediate upload failed, entry stays queued");
            }
        };
        tokio::select! {
            _ = shutdown.recv() => {}
            _ = work => {}
        }
    });
}
