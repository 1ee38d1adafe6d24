use std::path::Path;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::sync::{RemoteSyncPayload, RemoteTrip};

pub const SYNC_PENDING: &str = "pending";
pub const SYNC_SYNCED: &str = "synced";

pub const KV_LAST_PING: &str = "last_ping";
pub const KV_LAST_PING_POSITION: &str = "last_ping_position";
pub const KV_LAST_FULL_SYNC: &str = "last_full_sync";

#[derive(Debug, Clone)]
pub struct Trip {
    pub id: String,
    pub title: String,
    pub description: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub remote_status: String,
    pub local_status: Option<String>,
    pub sync_status: String,
    pub is_active: bool,
}

impl Trip {
    /// Status shown to the user: a local override beats the server's word.
    pub fn effective_status(&self) -> &str {
        self.local_status.as_deref().unwrap_or(&self.remote_status)
    }
}

/// A trip planned on the device itself, before the backend knows about it.
#[derive(Debug, Clone)]
pub struct NewTrip {
    pub id: String,
    pub title: String,
    pub description: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct Waypoint {
    pub trip_id: String,
    pub sequence: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct LogbookEntry {
    pub id: i64,
    pub trip_id: Option<String>,
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub satellites: i64,
    pub content: String,
    pub sync_status: String,
}

#[derive(Debug, Clone)]
pub struct NewLogbookEntry {
    pub trip_id: Option<String>,
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub satellites: i64,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub sync_key: String,
    pub model: String,
    pub owner: String,
    pub last_update: Option<String>,
    pub fetched_at: String,
}

/// What startup reconciliation had to repair.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    pub trips_deactivated: u64,
    pub orphan_waypoints: u64,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Persistent device state: trips, waypoints, logbook, device identity, sync
/// bookkeeping. The pool holds a single connection, so every mutation
/// serializes; multi-row mutations additionally run in transactions.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to open database {}", path.display()))?;

        let store = Self { pool };
        store.apply_pragmas().await;
        store.create_tables().await.context("schema creation failed")?;
        store.migrate().await.context("schema migration failed")?;
        info!(db = %path.display(), "store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn pool_for_tests(&self) -> &SqlitePool {
        &self.pool
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.create_tables().await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn apply_pragmas(&self) {
        let pragmas = [
            "PRAGMA journal_mode=WAL;",
            "PRAGMA synchronous=NORMAL;",
            "PRAGMA busy_timeout=5000;",
            "PRAGMA foreign_keys=ON;",
        ];
        for stmt in pragmas {
            if let Err(err) = sqlx::query(stmt).execute(&self.pool).await {
                warn!(pragma = stmt, error = %err, "pragma failed");
            }
        }
    }

    async fn create_tables(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trips (
                id            TEXT PRIMARY KEY,
                title         TEXT NOT NULL,
                description   TEXT NOT NULL DEFAULT '',
                start_date    TEXT,
                end_date      TEXT,
                remote_status TEXT NOT NULL DEFAULT 'PLANNED',
                local_status  TEXT,
                sync_status   TEXT NOT NULL DEFAULT 'synced',
                is_active     INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS waypoints (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                trip_id   TEXT NOT NULL,
                seq       INTEGER NOT NULL DEFAULT 0,
                name      TEXT NOT NULL DEFAULT '',
                latitude  REAL NOT NULL,
                longitude REAL NOT NULL,
                FOREIGN KEY (trip_id) REFERENCES trips (id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS logbook_entries (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT NOT NULL,
                latitude    REAL NOT NULL,
                longitude   REAL NOT NULL,
                altitude    REAL NOT NULL DEFAULT 0,
                speed       REAL NOT NULL DEFAULT 0,
                heading     REAL NOT NULL DEFAULT 0,
                satellites  INTEGER NOT NULL DEFAULT 0,
                trip_id     TEXT,
                content     TEXT NOT NULL DEFAULT '',
                sync_status TEXT NOT NULL DEFAULT 'pending',
                created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_info (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL DEFAULT '',
                sync_key    TEXT NOT NULL DEFAULT '',
                model       TEXT NOT NULL DEFAULT '',
                owner       TEXT NOT NULL DEFAULT '',
                last_update TEXT,
                fetched_at  TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Additive evolution only: probe for columns older databases are
    /// missing and add them. Unknown extra columns are left alone.
    async fn migrate(&self) -> anyhow::Result<()> {
        let cols = sqlx::query("PRAGMA table_info(trips)")
            .fetch_all(&self.pool)
            .await?;
        let has_is_active = cols
            .iter()
            .any(|row| row.get::<String, _>("name") == "is_active");
        if !has_is_active {
            sqlx::query("ALTER TABLE trips ADD COLUMN is_active INTEGER NOT NULL DEFAULT 0")
                .execute(&self.pool)
                .await?;
            info!("added trips.is_active column");
        }
        Ok(())
    }

    /// Repair logical state after a crash: collapse multiple active trips
    /// down to the most recently updated one and report orphan waypoints
    /// (kept, not deleted).
    pub async fn reconcile_startup(&self) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let active: i64 = sqlx::query("SELECT COUNT(*) FROM trips WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        if active > 1 {
            let result = sqlx::query(
                "UPDATE trips SET is_active = 0
                 WHERE is_active = 1
                 AND id != (SELECT id FROM trips WHERE is_active = 1
                            ORDER BY updated_at DESC, rowid DESC LIMIT 1)",
            )
            .execute(&self.pool)
            .await?;
            report.trips_deactivated = result.rows_affected();
            warn!(deactivated = report.trips_deactivated, "repaired multiple active trips");
        }

        let orphans: i64 = sqlx::query(
            "SELECT COUNT(*) FROM waypoints WHERE trip_id NOT IN (SELECT id FROM trips)",
        )
        .fetch_one(&self.pool)
        .await?
        .get(0);
        report.orphan_waypoints = orphans as u64;
        if orphans > 0 {
            warn!(orphans, "waypoints without a parent trip");
        }

        Ok(report)
    }

    // ==================================================================
    //  Trips
    // ==================================================================

    pub async fn get_trips(&self, status: Option<&str>) -> anyhow::Result<Vec<Trip>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM trips
                     WHERE COALESCE(local_status, remote_status) = ?
                     ORDER BY created_at DESC, rowid DESC",
                )
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM trips ORDER BY created_at DESC, rowid DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(trip_from_row).collect())
    }

    pub async fn get_trip(&self, id: &str) -> anyhow::Result<Option<Trip>> {
        let row = sqlx::query("SELECT * FROM trips WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(trip_from_row))
    }

    pub async fn get_active_trip(&self) -> anyhow::Result<Option<Trip>> {
        let row = sqlx::query("SELECT * FROM trips WHERE is_active = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(trip_from_row))
    }

    /// Record a trip planned on the device. It carries its status as a local
    /// override and starts out pending, so the next drain announces it to
    /// the backend.
    pub async fn add_trip(&self, trip: &NewTrip) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO trips
             (id, title, description, start_date, end_date, remote_status, local_status,
              sync_status, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trip.id)
        .bind(&trip.title)
        .bind(&trip.description)
        .bind(&trip.start_date)
        .bind(&trip.end_date)
        .bind(&trip.status)
        .bind(&trip.status)
        .bind(SYNC_PENDING)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        info!(trip = %trip.id, title = %trip.title, "trip planned locally");
        Ok(())
    }

    /// Upsert a single trip (and its waypoints) as described by the backend.
    /// Remote-owned fields refresh; local overrides and sync bookkeeping are
    /// untouched.
    pub async fn upsert_from_remote(&self, trip: &RemoteTrip) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_remote_trip(&mut tx, trip, &now_iso()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Activate one trip and deactivate every other, atomically. Returns
    /// false (and changes nothing) when the id does not exist.
    pub async fn set_active_trip(&self, id: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM trips WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE trips SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE trips SET is_active = 1, updated_at = ? WHERE id = ?")
            .bind(now_iso())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn clear_active_trip(&self) -> anyhow::Result<()> {
        sqlx::query("UPDATE trips SET is_active = 0 WHERE is_active = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a user-driven status change; the trip becomes pending until
    /// the backend accepts it.
    pub async fn set_local_status(&self, id: &str, status: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE trips SET local_status = ?, sync_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(SYNC_PENDING)
        .bind(now_iso())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The backend accepted the pushed status: promote it to the remote
    /// status and drop the override.
    pub async fn mark_trip_synced(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE trips
             SET remote_status = COALESCE(local_status, remote_status),
                 local_status = NULL, sync_status = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(SYNC_SYNCED)
        .bind(now_iso())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Trips with an unpushed local status change, in the order the changes
    /// were made.
    pub async fn trips_needing_sync(&self) -> anyhow::Result<Vec<Trip>> {
        let rows = sqlx::query(
            "SELECT * FROM trips
             WHERE local_status IS NOT NULL AND sync_status = ?
             ORDER BY updated_at ASC, rowid ASC",
        )
        .bind(SYNC_PENDING)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(trip_from_row).collect())
    }

    // ==================================================================
    //  Waypoints
    // ==================================================================

    pub async fn insert_waypoint(&self, wp: &Waypoint) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO waypoints (trip_id, seq, name, latitude, longitude) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&wp.trip_id)
        .bind(wp.sequence)
        .bind(&wp.name)
        .bind(wp.latitude)
        .bind(wp.longitude)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn waypoints_by_trip(&self, trip_id: &str) -> anyhow::Result<Vec<Waypoint>> {
        let rows = sqlx::query("SELECT * FROM waypoints WHERE trip_id = ? ORDER BY seq ASC")
            .bind(trip_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Waypoint {
                trip_id: row.get("trip_id"),
                sequence: row.get("seq"),
                name: row.get("name"),
                latitude: row.get("latitude"),
                longitude: row.get("longitude"),
            })
            .collect())
    }

    // ==================================================================
    //  Logbook
    // ==================================================================

    pub async fn insert_logbook(&self, entry: &NewLogbookEntry) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO logbook_entries
             (timestamp, latitude, longitude, altitude, speed, heading, satellites, trip_id, content)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.timestamp)
        .bind(entry.latitude)
        .bind(entry.longitude)
        .bind(entry.altitude)
        .bind(entry.speed_kmh)
        .bind(entry.heading_deg)
        .bind(entry.satellites)
        .bind(&entry.trip_id)
        .bind(&entry.content)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Newest entries first.
    pub async fn recent_logbook(
        &self,
        trip_id: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<LogbookEntry>> {
        let rows = match trip_id {
            Some(trip_id) => {
                sqlx::query(
                    "SELECT * FROM logbook_entries WHERE trip_id = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(trip_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM logbook_entries ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(logbook_from_row).collect())
    }

    /// Entries still waiting for upload, oldest first.
    pub async fn pending_logbook(&self) -> anyhow::Result<Vec<LogbookEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM logbook_entries WHERE sync_status = ? ORDER BY id ASC",
        )
        .bind(SYNC_PENDING)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(logbook_from_row).collect())
    }

    pub async fn pending_logbook_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM logbook_entries WHERE sync_status = ?")
            .bind(SYNC_PENDING)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    pub async fn mark_logbook_synced(&self, ids: &[i64]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE logbook_entries SET sync_status = ? WHERE id = ?")
                .bind(SYNC_SYNCED)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(count = ids.len(), "logbook entries marked synced");
        Ok(())
    }

    // ==================================================================
    //  Device + KV
    // ==================================================================

    pub async fn upsert_device_info(&self, device: &DeviceInfo) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_device(&mut tx, device).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_device_info(&self) -> anyhow::Result<Option<DeviceInfo>> {
        let row = sqlx::query("SELECT * FROM device_info LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| DeviceInfo {
            id: row.get("id"),
            name: row.get("name"),
            sync_key: row.get("sync_key"),
            model: row.get("model"),
            owner: row.get("owner"),
            last_update: row.get("last_update"),
            fetched_at: row.get("fetched_at"),
        }))
    }

    pub async fn kv_set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sync_kv (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn kv_get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    // ==================================================================
    //  Remote sync ingestion
    // ==================================================================

    /// Apply a full device pull in one transaction: device identity, trips,
    /// and their waypoints. Trips with unpushed local changes keep their
    /// override and pending flag; only the remote-owned fields refresh.
    pub async fn store_remote_sync(&self, payload: &RemoteSyncPayload) -> anyhow::Result<()> {
        let fetched_at = now_iso();
        let mut tx = self.pool.begin().await?;

        // The device row is a singleton; a pull supersedes any provisional
        // identity recorded before the first contact.
        let device = payload.device_info(&fetched_at);
        sqlx::query("DELETE FROM device_info WHERE id != ?")
            .bind(&device.id)
            .execute(&mut *tx)
            .await?;
        upsert_device(&mut tx, &device).await?;

        for trip in &payload.trips {
            upsert_remote_trip(&mut tx, trip, &fetched_at).await?;
        }

        sqlx::query(
            "INSERT INTO sync_kv (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(KV_LAST_FULL_SYNC)
        .bind(&fetched_at)
        .bind(&fetched_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(trips = payload.trips.len(), "remote sync stored");
        Ok(())
    }

    /// Checkpoint the WAL and close. Mirrors the shutdown path of the
    /// database-backed services this store grew out of.
    pub async fn close(&self) {
        if let Err(err) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .execute(&self.pool)
            .await
        {
            warn!(error = %err, "wal checkpoint failed");
        }
        self.pool.close().await;
    }
}

async fn upsert_device(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    device: &DeviceInfo,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO device_info (id, name, sync_key, model, owner, last_update, fetched_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name, sync_key = excluded.sync_key, model = excluded.model,
           owner = excluded.owner, last_update = excluded.last_update,
           fetched_at = excluded.fetched_at",
    )
    .bind(&device.id)
    .bind(&device.name)
    .bind(&device.sync_key)
    .bind(&device.model)
    .bind(&device.owner)
    .bind(&device.last_update)
    .bind(&device.fetched_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_remote_trip(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    trip: &RemoteTrip,
    fetched_at: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO trips (id, title, description, start_date, end_date, remote_status,
                            sync_status, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           title = excluded.title, description = excluded.description,
           start_date = excluded.start_date, end_date = excluded.end_date,
           remote_status = excluded.remote_status, updated_at = excluded.updated_at",
    )
    .bind(&trip.id)
    .bind(&trip.title)
    .bind(trip.description.as_deref().unwrap_or(""))
    .bind(&trip.start_date)
    .bind(&trip.end_date)
    .bind(trip.status.as_deref().unwrap_or("PLANNED"))
    .bind(SYNC_SYNCED)
    .bind(fetched_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM waypoints WHERE trip_id = ?")
        .bind(&trip.id)
        .execute(&mut **tx)
        .await?;
    for (seq, point) in trip.points.iter().enumerate() {
        sqlx::query(
            "INSERT INTO waypoints (trip_id, seq, name, latitude, longitude)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&trip.id)
        .bind(seq as i64)
        .bind(point.name.clone().unwrap_or_else(|| format!("Waypoint {}", seq + 1)))
        .bind(point.latitude)
        .bind(point.longitude)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn trip_from_row(row: &sqlx::sqlite::SqliteRow) -> Trip {
    Trip {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        remote_status: row.get("remote_status"),
        local_status: row.get("local_status"),
        sync_status: row.get("sync_status"),
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}

fn logbook_from_row(row: &sqlx::sqlite::SqliteRow) -> LogbookEntry {
    LogbookEntry {
        id: row.get("id"),
        trip_id: row.get("trip_id"),
        timestamp: row.get("timestamp"),
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
        altitude: row.get("altitude"),
        speed_kmh: row.get("speed"),
        heading_deg: row.get("heading"),
        satellites: row.get("satellites"),
        content: row.get("content"),
        sync_status: row.get("sync_status"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::RemoteSyncPayload;

    async fn seed_trip(store: &Store, id: &str, status: &str) {
        sqlx::query(
            "INSERT INTO trips (id, title, remote_status, sync_status) VALUES (?, ?, ?, 'synced')",
        )
        .bind(id)
        .bind(format!("Trip {id}"))
        .bind(status)
        .execute(&store.pool)
        .await
        .unwrap();
    }

    fn entry(lat: f64) -> NewLogbookEntry {
        NewLogbookEntry {
            trip_id: None,
            timestamp: now_iso(),
            latitude: lat,
            longitude: 4.9,
            altitude: 0.0,
            speed_kmh: 5.0,
            heading_deg: 90.0,
            satellites: 6,
            content: "Automatic GPS tracker entry".into(),
        }
    }

    #[tokio::test]
    async fn at_most_one_trip_is_active() {
        let store = Store::open_in_memory().await.unwrap();
        seed_trip(&store, "a", "PLANNED").await;
        seed_trip(&store, "b", "PLANNED").await;
        seed_trip(&store, "c", "PLANNED").await;

        assert!(store.set_active_trip("a").await.unwrap());
        assert!(store.set_active_trip("b").await.unwrap());
        assert!(store.set_active_trip("c").await.unwrap());

        let active: Vec<Trip> = store
            .get_trips(None)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "c");
    }

    #[tokio::test]
    async fn activating_unknown_trip_changes_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        seed_trip(&store, "a", "PLANNED").await;
        store.set_active_trip("a").await.unwrap();

        assert!(!store.set_active_trip("ghost").await.unwrap());
        assert_eq!(store.get_active_trip().await.unwrap().unwrap().id, "a");
    }

    #[tokio::test]
    async fn local_status_marks_pending_and_sync_promotes() {
        let store = Store::open_in_memory().await.unwrap();
        seed_trip(&store, "a", "PLANNED").await;

        store.set_local_status("a", "IN_ROUTE").await.unwrap();
        let trip = store.get_trip("a").await.unwrap().unwrap();
        assert_eq!(trip.sync_status, SYNC_PENDING);
        assert_eq!(trip.effective_status(), "IN_ROUTE");
        assert_eq!(trip.remote_status, "PLANNED");

        store.mark_trip_synced("a").await.unwrap();
        let trip = store.get_trip("a").await.unwrap().unwrap();
        assert_eq!(trip.sync_status, SYNC_SYNCED);
        assert_eq!(trip.remote_status, "IN_ROUTE");
        assert!(trip.local_status.is_none());
        assert!(store.trips_needing_sync().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trips_needing_sync_keeps_change_order() {
        let store = Store::open_in_memory().await.unwrap();
        seed_trip(&store, "a", "PLANNED").await;
        seed_trip(&store, "b", "PLANNED").await;

        store.set_local_status("b", "IN_ROUTE").await.unwrap();
        store.set_local_status("a", "COMPLETED").await.unwrap();

        let pending = store.trips_needing_sync().await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn logbook_ids_order_recent_desc_pending_asc() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..5 {
            store.insert_logbook(&entry(52.0 + f64::from(i))).await.unwrap();
        }

        let recent = store.recent_logbook(None, 3).await.unwrap();
        let ids: Vec<i64> = recent.iter().map(|e| e.id).collect();
        assert!(ids.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(ids.len(), 3);

        let pending = store.pending_logbook().await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|e| e.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn mark_synced_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store.insert_logbook(&entry(52.0)).await.unwrap();
        let second = store.insert_logbook(&entry(53.0)).await.unwrap();

        store.mark_logbook_synced(&[first]).await.unwrap();
        store.mark_logbook_synced(&[first]).await.unwrap();
        store.mark_logbook_synced(&[]).await.unwrap();

        let pending = store.pending_logbook().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
    }

    #[tokio::test]
    async fn remote_sync_upserts_and_preserves_pending_overrides() {
        let store = Store::open_in_memory().await.unwrap();
        seed_trip(&store, "existing", "PLANNED").await;
        store.set_local_status("existing", "IN_ROUTE").await.unwrap();

        let payload: RemoteSyncPayload = serde_json::from_value(serde_json::json!({
            "device": {
                "id": "dev-1", "name": "Elcano One", "syncKey": "K1234567890",
                "model": "rpi-zero-2w", "owner": {"name": "G. Chavez"},
                "lastUpdate": "2026-07-01T10:00:00Z"
            },
            "trips": [
                {
                    "id": "existing", "title": "Renamed", "description": "d",
                    "status": "PLANNED", "start_date": "2026-07-01", "end_date": null,
                    "points": [
                        {"latitude": 52.0, "longitude": 4.0, "name": "Start"},
                        {"latitude": 52.1, "longitude": 4.1}
                    ]
                },
                {
                    "id": "fresh", "title": "New Trip", "status": "PLANNED",
                    "points": []
                }
            ],
            "syncTimestamp": "2026-07-01T10:00:01Z"
        }))
        .unwrap();

        store.store_remote_sync(&payload).await.unwrap();

        let existing = store.get_trip("existing").await.unwrap().unwrap();
        assert_eq!(existing.title, "Renamed");
        // The unpushed local change must survive the pull.
        assert_eq!(existing.local_status.as_deref(), Some("IN_ROUTE"));
        assert_eq!(existing.sync_status, SYNC_PENDING);

        let fresh = store.get_trip("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.sync_status, SYNC_SYNCED);

        let waypoints = store.waypoints_by_trip("existing").await.unwrap();
        assert_eq!(waypoints.len(), 2);
        assert_eq!(waypoints[0].name, "Start");
        assert_eq!(waypoints[1].name, "Waypoint 2");
        assert_eq!(waypoints[0].sequence, 0);

        let device = store.get_device_info().await.unwrap().unwrap();
        assert_eq!(device.id, "dev-1");
        assert_eq!(device.sync_key, "K1234567890");

        assert!(store.kv_get(KV_LAST_FULL_SYNC).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn kv_roundtrip_overwrites() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.kv_get("last_ping").await.unwrap().is_none());

        store.kv_set("last_ping", "t1").await.unwrap();
        store.kv_set("last_ping", "t2").await.unwrap();
        assert_eq!(store.kv_get("last_ping").await.unwrap().as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn reconcile_collapses_multiple_active_trips() {
        let store = Store::open_in_memory().await.unwrap();
        seed_trip(&store, "a", "PLANNED").await;
        seed_trip(&store, "b", "PLANNED").await;

        // Fake crash state: both rows active, b touched last.
        sqlx::query("UPDATE trips SET is_active = 1, updated_at = '2026-01-01T00:00:00Z' WHERE id = 'a'")
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query("UPDATE trips SET is_active = 1, updated_at = '2026-01-02T00:00:00Z' WHERE id = 'b'")
            .execute(&store.pool)
            .await
            .unwrap();

        let report = store.reconcile_startup().await.unwrap();
        assert_eq!(report.trips_deactivated, 1);
        assert_eq!(store.get_active_trip().await.unwrap().unwrap().id, "b");
    }

    #[tokio::test]
    async fn orphan_waypoints_are_reported_not_deleted() {
        let store = Store::open_in_memory().await.unwrap();
        // Foreign keys are off in the in-memory test store, which is exactly
        // how orphans appear in the field after partial deletes.
        sqlx::query("INSERT INTO waypoints (trip_id, seq, latitude, longitude) VALUES ('ghost', 0, 1.0, 2.0)")
            .execute(&store.pool)
            .await
            .unwrap();

        let report = store.reconcile_startup().await.unwrap();
        assert_eq!(report.orphan_waypoints, 1);

        let count: i64 = sqlx::query("SELECT COUNT(*) FROM waypoints")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn single_trip_upsert_inserts_then_refreshes() {
        let store = Store::open_in_memory().await.unwrap();

        let trip: crate::sync::RemoteTrip = serde_json::from_value(serde_json::json!({
            "id": "r-1", "title": "Delta Crossing", "status": "PLANNED",
            "points": [{"latitude": 51.8, "longitude": 4.1, "name": "Lock"}]
        }))
        .unwrap();
        store.upsert_from_remote(&trip).await.unwrap();

        let stored = store.get_trip("r-1").await.unwrap().unwrap();
        assert_eq!(stored.title, "Delta Crossing");
        assert_eq!(stored.sync_status, SYNC_SYNCED);
        assert_eq!(store.waypoints_by_trip("r-1").await.unwrap().len(), 1);

        // Same trip again with new remote fields and a rerouted plan.
        store.set_local_status("r-1", "IN_ROUTE").await.unwrap();
        let trip: crate::sync::RemoteTrip = serde_json::from_value(serde_json::json!({
            "id": "r-1", "title": "Delta Crossing II", "status": "PLANNED",
            "points": [
                {"latitude": 51.8, "longitude": 4.1},
                {"latitude": 51.9, "longitude": 4.2}
            ]
        }))
        .unwrap();
        store.upsert_from_remote(&trip).await.unwrap();

        let stored = store.get_trip("r-1").await.unwrap().unwrap();
        assert_eq!(stored.title, "Delta Crossing II");
        // The unpushed override survives a single-trip refresh too.
        assert_eq!(stored.local_status.as_deref(), Some("IN_ROUTE"));
        assert_eq!(stored.sync_status, SYNC_PENDING);
        assert_eq!(store.waypoints_by_trip("r-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn locally_planned_trip_queues_for_sync() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .add_trip(&NewTrip {
                id: "local-20260801".into(),
                title: "Harbor Loop".into(),
                description: String::new(),
                start_date: Some("2026-08-01".into()),
                end_date: None,
                status: "PLANNED".into(),
            })
            .await
            .unwrap();

        let trip = store.get_trip("local-20260801").await.unwrap().unwrap();
        assert_eq!(trip.effective_status(), "PLANNED");
        assert_eq!(trip.sync_status, SYNC_PENDING);

        let pending = store.trips_needing_sync().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "local-20260801");
    }

    #[tokio::test]
    async fn waypoints_insert_and_list_in_sequence_order() {
        let store = Store::open_in_memory().await.unwrap();
        seed_trip(&store, "t", "PLANNED").await;

        for (seq, lat) in [(2i64, 52.2), (0, 52.0), (1, 52.1)] {
            store
                .insert_waypoint(&Waypoint {
                    trip_id: "t".into(),
                    sequence: seq,
                    latitude: lat,
                    longitude: 4.0,
                    name: format!("wp{seq}"),
                })
                .await
                .unwrap();
        }

        let waypoints = store.waypoints_by_trip("t").await.unwrap();
        let seqs: Vec<i64> = waypoints.iter().map(|w| w.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(waypoints[0].name, "wp0");
    }

    #[tokio::test]
    async fn device_info_upserts_by_id() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.get_device_info().await.unwrap().is_none());

        let mut device = DeviceInfo {
            id: "unprovisioned".into(),
            name: "Elcano One".into(),
            sync_key: "K1234567890".into(),
            fetched_at: now_iso(),
            ..DeviceInfo::default()
        };
        store.upsert_device_info(&device).await.unwrap();
        assert_eq!(
            store.get_device_info().await.unwrap().unwrap().sync_key,
            "K1234567890"
        );

        device.sync_key = "K0987654321".into();
        store.upsert_device_info(&device).await.unwrap();
        let stored = store.get_device_info().await.unwrap().unwrap();
        assert_eq!(stored.sync_key, "K0987654321");
    }

    #[tokio::test]
    async fn remote_sync_replaces_provisional_device_row() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_device_info(&DeviceInfo {
                id: "unprovisioned".into(),
                sync_key: "K1234567890".into(),
                fetched_at: now_iso(),
                ..DeviceInfo::default()
            })
            .await
            .unwrap();

        let payload: RemoteSyncPayload = serde_json::from_value(serde_json::json!({
            "device": {"id": "dev-9", "syncKey": "K1234567890"},
            "trips": []
        }))
        .unwrap();
        store.store_remote_sync(&payload).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) FROM device_info")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(count, 1);
        assert_eq!(store.get_device_info().await.unwrap().unwrap().id, "dev-9");
    }

    #[tokio::test]
    async fn status_filter_uses_effective_status() {
        let store = Store::open_in_memory().await.unwrap();
        seed_trip(&store, "a", "PLANNED").await;
        seed_trip(&store, "b", "PLANNED").await;
        store.set_local_status("b", "IN_ROUTE").await.unwrap();

        let planned = store.get_trips(Some("PLANNED")).await.unwrap();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].id, "a");

        let in_route = store.get_trips(Some("IN_ROUTE")).await.unwrap();
        assert_eq!(in_route.len(), 1);
        assert_eq!(in_route[0].id, "b");
    }
}
