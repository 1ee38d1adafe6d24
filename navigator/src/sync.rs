use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::gnss::Fix;
use crate::store::{
    DeviceInfo, KV_LAST_PING, KV_LAST_PING_POSITION, LogbookEntry, Store,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Keys shipped with demo units and documentation; never valid in the field.
const BLACKLISTED_KEYS: &[&str] = &["ABC1234567", "PLACEHOLDER", "DEFAULT", "TEST123456"];

/// Read the sync key from the settings file (`token=<key>` on one line).
pub fn read_sync_key(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let key = raw.trim().trim_start_matches("token=").trim().to_string();
            (!key.is_empty()).then_some(key)
        }
        Err(err) => {
            warn!(settings = %path.display(), error = %err, "could not read sync key");
            None
        }
    }
}

pub fn is_valid_sync_key(key: Option<&str>) -> bool {
    match key {
        Some(key) => key.len() >= 10 && !BLACKLISTED_KEYS.contains(&key),
        None => false,
    }
}

// ======================================================================
//  Wire types
// ======================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PingBody {
    last_latitude: f64,
    last_longitude: f64,
    last_heading: f64,
    last_course: f64,
}

impl PingBody {
    fn from_fix(fix: &Fix) -> Self {
        Self {
            last_latitude: fix.latitude,
            last_longitude: fix.longitude,
            last_heading: fix.heading_deg,
            // The receiver reports one direction; the backend models
            // heading and course separately.
            last_course: fix.heading_deg,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PingResponse {
    last_latitude: Option<f64>,
    last_longitude: Option<f64>,
    last_heading: Option<f64>,
    last_course: Option<f64>,
    last_update: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteSyncPayload {
    pub device: RemoteDevice,
    #[serde(default)]
    pub trips: Vec<RemoteTrip>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDevice {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sync_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub owner: Option<serde_json::Value>,
    #[serde(default)]
    pub last_update: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteTrip {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub points: Vec<RemotePoint>,
}

#[derive(Debug, Deserialize)]
pub struct RemotePoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
}

impl RemoteSyncPayload {
    pub fn device_info(&self, fetched_at: &str) -> DeviceInfo {
        let owner = match &self.device.owner {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        DeviceInfo {
            id: self.device.id.clone(),
            name: self.device.name.clone().unwrap_or_default(),
            sync_key: self.device.sync_key.clone().unwrap_or_default(),
            model: self.device.model.clone().unwrap_or_default(),
            owner,
            last_update: self.device.last_update.clone(),
            fetched_at: fetched_at.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BulkLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Serialize)]
struct BulkVessel {
    speed: f64,
    course: f64,
}

#[derive(Debug, Serialize)]
struct BulkEntry {
    timestamp: String,
    location: BulkLocation,
    vessel: BulkVessel,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    trip: Option<String>,
}

impl BulkEntry {
    fn from_entry(entry: &LogbookEntry) -> Self {
        Self {
            timestamp: entry.timestamp.clone(),
            location: BulkLocation {
                latitude: entry.latitude,
                longitude: entry.longitude,
            },
            vessel: BulkVessel {
                speed: entry.speed_kmh,
                course: entry.heading_deg,
            },
            content: if entry.content.is_empty() {
                "GPS tracker entry".to_string()
            } else {
                entry.content.clone()
            },
            trip: entry.trip_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BulkBody {
    entries: Vec<BulkEntry>,
}

// ======================================================================
//  Engine
// ======================================================================

/// Talks to the fleet backend. Every operation is a no-op with a message
/// when the device has no valid sync key; failures are reported, never
/// retried inline, and never lose queued data.
pub struct SyncEngine {
    client: reqwest::Client,
    base_url: String,
    sync_key: Option<String>,
    last_ping: Mutex<Option<Instant>>,
}

impl SyncEngine {
    pub fn new(base_url: &str, sync_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        if sync_key.is_none() {
            warn!("no sync key configured, backend sync disabled");
        }
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            sync_key,
            last_ping: Mutex::new(None),
        })
    }

    pub fn is_valid(&self) -> bool {
        is_valid_sync_key(self.sync_key.as_deref())
    }

    fn key(&self) -> Result<&str, String> {
        match self.sync_key.as_deref() {
            Some(key) if is_valid_sync_key(Some(key)) => Ok(key),
            _ => Err("No sync key configured".to_string()),
        }
    }

    pub fn should_ping(&self) -> bool {
        self.last_ping
            .lock()
            .unwrap()
            .is_none_or(|at| at.elapsed() >= PING_INTERVAL)
    }

    fn mark_pinged(&self) {
        *self.last_ping.lock().unwrap() = Some(Instant::now());
    }

    /// Liveness ping, carrying the position when a fix is available. The
    /// server echoes its view of the device position; the echo is kept for
    /// the sync status screen.
    pub async fn ping(&self, store: &Store, fix: Option<&Fix>) -> (bool, String) {
        let key = match self.key() {
            Ok(key) => key,
            Err(msg) => return (false, msg),
        };
        let url = format!("{}/api/sync/device/{key}/ping", self.base_url);

        let request = match fix.filter(|f| f.has_fix()) {
            Some(fix) => self.client.post(&url).json(&PingBody::from_fix(fix)),
            None => self.client.post(&url),
        };

        match request.send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                self.mark_pinged();
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                if let Err(err) = store.kv_set(KV_LAST_PING, &now).await {
                    warn!(error = %err, "failed to record ping time");
                }

                if let Ok(echo) = response.json::<PingResponse>().await {
                    if echo.last_latitude.is_some() {
                        let snapshot = serde_json::json!({
                            "latitude": echo.last_latitude,
                            "longitude": echo.last_longitude,
                            "heading": echo.last_heading,
                            "course": echo.last_course,
                            "timestamp": echo.last_update,
                        });
                        let _ = store
                            .kv_set(KV_LAST_PING_POSITION, &snapshot.to_string())
                            .await;
                    }
                }
                (true, "Ping successful".to_string())
            }
            Ok(response) => {
                let status = response.status();
                error!(%status, "ping rejected");
                (false, format!("Ping failed: {status}"))
            }
            Err(err) => {
                error!(error = %err, "ping error");
                (false, format!("Ping error: {err}"))
            }
        }
    }

    /// Pull device identity and trips; everything lands in one store
    /// transaction.
    pub async fn pull_device(&self, store: &Store) -> (bool, String) {
        let key = match self.key() {
            Ok(key) => key,
            Err(msg) => return (false, msg),
        };
        let url = format!("{}/api/sync/device/{key}", self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                match response.json::<RemoteSyncPayload>().await {
                    Ok(payload) => {
                        let trips = payload.trips.len();
                        match store.store_remote_sync(&payload).await {
                            Ok(()) => {
                                info!(trips, "device pull complete");
                                (true, format!("Synced {trips} trips"))
                            }
                            Err(err) => {
                                // One bad row poisons the whole transaction;
                                // salvage the rest trip by trip.
                                warn!(error = %err, "bulk store failed, applying trips individually");
                                let mut stored = 0usize;
                                for trip in &payload.trips {
                                    match store.upsert_from_remote(trip).await {
                                        Ok(()) => stored += 1,
                                        Err(err) => {
                                            error!(trip = %trip.id, error = %err, "trip upsert failed")
                                        }
                                    }
                                }
                                if stored > 0 {
                                    (true, format!("Synced {stored} of {trips} trips"))
                                } else {
                                    (false, "Failed to store sync data".to_string())
                                }
                            }
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "malformed sync payload");
                        (false, format!("Sync failed: {err}"))
                    }
                }
            }
            Ok(response) => {
                let status = response.status();
                error!(%status, "device pull rejected");
                (false, format!("Sync failed: {status}"))
            }
            Err(err) => {
                error!(error = %err, "device pull error");
                (false, format!("Sync error: {err}"))
            }
        }
    }

    /// Push one trip's status; marks it synced on acceptance.
    pub async fn push_trip_status(
        &self,
        store: &Store,
        trip_id: &str,
        status: &str,
    ) -> (bool, String) {
        let key = match self.key() {
            Ok(key) => key,
            Err(msg) => return (false, msg),
        };
        let url = format!("{}/api/sync/device/{key}/trip/{trip_id}", self.base_url);
        let body = serde_json::json!({ "status": status });

        match self.client.put(&url).json(&body).send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                if let Err(err) = store.mark_trip_synced(trip_id).await {
                    warn!(trip_id, error = %err, "push accepted but local mark failed");
                }
                info!(trip_id, status, "trip status pushed");
                (true, "Trip status updated".to_string())
            }
            Ok(response) => {
                let status = response.status();
                error!(trip_id, %status, "trip status push rejected");
                (false, format!("Update failed: {status}"))
            }
            Err(err) => {
                error!(trip_id, error = %err, "trip status push error");
                (false, format!("Update error: {err}"))
            }
        }
    }

    /// Upload a batch of logbook entries; all-or-nothing per batch.
    pub async fn push_logbook(&self, store: &Store, entries: &[LogbookEntry]) -> (bool, String) {
        let key = match self.key() {
            Ok(key) => key,
            Err(msg) => return (false, msg),
        };
        if entries.is_empty() {
            return (false, "No entries".to_string());
        }

        let url = format!("{}/api/logbook/sync/{key}/bulk", self.base_url);
        let body = BulkBody {
            entries: entries.iter().map(BulkEntry::from_entry).collect(),
        };

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if matches!(response.status().as_u16(), 200 | 201) => {
                let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
                if let Err(err) = store.mark_logbook_synced(&ids).await {
                    warn!(error = %err, "upload accepted but local mark failed");
                }
                info!(count = entries.len(), "logbook entries uploaded");
                (true, format!("Synced {} entries", entries.len()))
            }
            Ok(response) => {
                let status = response.status();
                error!(%status, "logbook upload rejected");
                (false, format!("Sync failed: {status}"))
            }
            Err(err) => {
                error!(error = %err, "logbook upload error");
                (false, format!("Sync error: {err}"))
            }
        }
    }

    /// Push every pending trip status in change order, then one bulk
    /// logbook upload. Failures leave the queues intact for the next pass.
    pub async fn drain_pending(&self, store: &Store) -> Vec<String> {
        let mut results = Vec::new();

        match store.trips_needing_sync().await {
            Ok(trips) => {
                for trip in trips {
                    let Some(status) = trip.local_status.as_deref() else {
                        continue;
                    };
                    let (_, message) = self.push_trip_status(store, &trip.id, status).await;
                    results.push(format!("Trip {}: {message}", trip.title));
                }
            }
            Err(err) => {
                error!(error = %err, "could not list trips needing sync");
                results.push(format!("Trips: {err}"));
            }
        }

        match store.pending_logbook().await {
            Ok(entries) if !entries.is_empty() => {
                let (_, message) = self.push_logbook(store, &entries).await;
                results.push(format!("Logbook: {message}"));
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "could not list pending logbook entries");
                results.push(format!("Logbook: {err}"));
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_key_validation() {
        assert!(is_valid_sync_key(Some("K1234567890")));
        assert!(!is_valid_sync_key(None));
        assert!(!is_valid_sync_key(Some("")));
        assert!(!is_valid_sync_key(Some("short")));
        for bad in BLACKLISTED_KEYS {
            assert!(!is_valid_sync_key(Some(bad)), "{bad} must be rejected");
        }
    }

    #[test]
    fn settings_file_token_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");

        std::fs::write(&path, "token=K1234567890\n").unwrap();
        assert_eq!(read_sync_key(&path).as_deref(), Some("K1234567890"));

        std::fs::write(&path, "\n").unwrap();
        assert!(read_sync_key(&path).is_none());

        assert!(read_sync_key(dir.path().join("missing.ini").as_path()).is_none());
    }

    #[test]
    fn ping_body_mirrors_fix() {
        let fix = Fix {
            latitude: 52.3676,
            longitude: 4.9041,
            heading_deg: 90.0,
            fix_quality: 1,
            ..Fix::default()
        };
        let body = serde_json::to_value(PingBody::from_fix(&fix)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "lastLatitude": 52.3676,
                "lastLongitude": 4.9041,
                "lastHeading": 90.0,
                "lastCourse": 90.0,
            })
        );
    }

    #[test]
    fn bulk_entry_shape_matches_backend_contract() {
        let entry = LogbookEntry {
            id: 7,
            trip_id: Some("trip-1".into()),
            timestamp: "2026-07-01T10:00:00Z".into(),
            latitude: 52.0,
            longitude: 4.0,
            altitude: 3.0,
            speed_kmh: 9.5,
            heading_deg: 182.0,
            satellites: 8,
            content: "Automatic GPS tracker entry".into(),
            sync_status: "pending".into(),
        };
        let body = serde_json::to_value(BulkBody {
            entries: vec![BulkEntry::from_entry(&entry)],
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "entries": [{
                    "timestamp": "2026-07-01T10:00:00Z",
                    "location": {"latitude": 52.0, "longitude": 4.0},
                    "vessel": {"speed": 9.5, "course": 182.0},
                    "content": "Automatic GPS tracker entry",
                    "trip": "trip-1",
                }]
            })
        );
    }

    #[test]
    fn bulk_entry_without_trip_omits_the_field() {
        let entry = LogbookEntry {
            id: 1,
            trip_id: None,
            timestamp: "2026-07-01T10:00:00Z".into(),
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            speed_kmh: 0.0,
            heading_deg: 0.0,
            satellites: 0,
            content: String::new(),
            sync_status: "pending".into(),
        };
        let value = serde_json::to_value(BulkEntry::from_entry(&entry)).unwrap();
        assert!(value.get("trip").is_none());
        assert_eq!(value["content"], "GPS tracker entry");
    }

    #[test]
    fn ping_cadence() {
        let engine = SyncEngine::new("https://api.example.com", Some("K1234567890".into())).unwrap();
        assert!(engine.should_ping());
        engine.mark_pinged();
        assert!(!engine.should_ping());
    }

    #[tokio::test]
    async fn operations_without_key_are_noops() {
        let store = Store::open_in_memory().await.unwrap();
        let engine = SyncEngine::new("https://api.example.com", None).unwrap();

        let (ok, message) = engine.ping(&store, None).await;
        assert!(!ok);
        assert_eq!(message, "No sync key configured");

        let (ok, _) = engine.pull_device(&store).await;
        assert!(!ok);
        let (ok, _) = engine.push_trip_status(&store, "t", "IN_ROUTE").await;
        assert!(!ok);
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let engine = SyncEngine::new("https://api.example.com/", None).unwrap();
        assert_eq!(engine.base_url, "https://api.example.com");
    }
}
