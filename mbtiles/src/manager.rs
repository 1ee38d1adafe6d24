use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::TileResult;
use crate::reader::{ArchiveInfo, MbtilesReader};

/// Shared read handle to an archive owned by the manager. Handles are meant
/// to live for one composite; eviction closes the manager's copy and the pool
/// actually shuts down once the last in-flight handle drops.
pub type ReaderHandle = Arc<MbtilesReader>;

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// Archives kept open at once before LRU eviction kicks in.
    pub max_open: usize,
    /// Idle time after which an open archive is closed regardless of the LRU.
    pub cache_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_open: 3,
            cache_timeout: Duration::from_secs(300),
        }
    }
}

/// Lightweight listing entry for menus and the no-map screen.
#[derive(Debug, Clone)]
pub struct RegionSummary {
    pub file_name: String,
    pub name: String,
}

struct KnownArchive {
    path: PathBuf,
    file_name: String,
    info: ArchiveInfo,
}

struct OpenEntry {
    reader: ReaderHandle,
    last_used: u64,
    opened_or_used_at: Instant,
}

struct Inner {
    archives: Vec<KnownArchive>,
    open: HashMap<String, OpenEntry>,
    current: Option<String>,
    access_counter: u64,
}

/// Holds the working set of regional archives and picks the one covering a
/// coordinate. Internally synchronized; safe to share behind an `Arc`.
pub struct MbtilesManager {
    cfg: ManagerConfig,
    inner: Mutex<Inner>,
}

impl MbtilesManager {
    /// Scan `assets_dir` for `*.mbtiles`, opening each just long enough to
    /// read its metadata. Unreadable archives are dropped from the working
    /// set with a warning.
    pub async fn discover(assets_dir: &Path, cfg: ManagerConfig) -> TileResult<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(assets_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "mbtiles"))
            .collect();
        paths.sort();

        let mut archives = Vec::new();
        for path in paths {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match MbtilesReader::open(&path).await {
                Ok(reader) => {
                    let info = reader.info().clone();
                    info!(archive = %file_name, region = %info.name, "registered archive");
                    archives.push(KnownArchive {
                        path,
                        file_name,
                        info,
                    });
                }
                Err(err) => {
                    warn!(archive = %file_name, error = %err, "dropping unreadable archive");
                }
            }
        }

        if archives.is_empty() {
            warn!(assets = %assets_dir.display(), "no usable archives; every lookup will come up empty");
        }

        Ok(Self {
            cfg,
            inner: Mutex::new(Inner {
                archives,
                open: HashMap::new(),
                current: None,
                access_counter: 0,
            }),
        })
    }

    /// Pick the archive for a coordinate.
    ///
    /// The current archive is sticky while it still contains the point. A new
    /// point selects, among containing archives, the one storing the most
    /// zoom levels (ties: closest bounds center, then lexicographic file
    /// name). With no containing archive at all, the closest one is returned
    /// so the caller can at least show where the maps end.
    pub async fn reader_for(&self, lat: f64, lon: f64) -> Option<ReaderHandle> {
        let mut inner = self.inner.lock().await;

        if let Some(current) = inner.current.clone() {
            let still_inside = inner
                .archives
                .iter()
                .any(|a| a.file_name == current && a.info.bounds.contains(lat, lon));
            if still_inside {
                return self.open_archive(&mut inner, &current).await;
            }
        }

        let chosen = {
            let mut containing: Vec<&KnownArchive> = inner
                .archives
                .iter()
                .filter(|a| a.info.bounds.contains(lat, lon))
                .collect();

            if containing.is_empty() {
                let closest = inner.archives.iter().min_by(|a, b| {
                    distance_to(&a.info, lat, lon).total_cmp(&distance_to(&b.info, lat, lon))
                })?;
                info!(
                    archive = %closest.file_name,
                    "no archive covers {lat:.4}, {lon:.4}; using closest fallback"
                );
                closest.file_name.clone()
            } else {
                containing.sort_by(|a, b| {
                    b.info
                        .zoom_levels
                        .len()
                        .cmp(&a.info.zoom_levels.len())
                        .then_with(|| {
                            distance_to(&a.info, lat, lon)
                                .total_cmp(&distance_to(&b.info, lat, lon))
                        })
                        .then_with(|| a.file_name.cmp(&b.file_name))
                });
                containing[0].file_name.clone()
            }
        };

        let handle = self.open_archive(&mut inner, &chosen).await;
        if handle.is_some() {
            inner.current = Some(chosen);
        }
        handle
    }

    /// Metadata of the archive last handed out, if any.
    pub async fn current_info(&self) -> Option<ArchiveInfo> {
        let inner = self.inner.lock().await;
        let current = inner.current.as_ref()?;
        inner
            .archives
            .iter()
            .find(|a| &a.file_name == current)
            .map(|a| a.info.clone())
    }

    /// Every known region, discovery (lexicographic) order.
    pub async fn regions(&self) -> Vec<RegionSummary> {
        let inner = self.inner.lock().await;
        inner
            .archives
            .iter()
            .map(|a| RegionSummary {
                file_name: a.file_name.clone(),
                name: a.info.name.clone(),
            })
            .collect()
    }

    /// Manual region override: step forward (+1) or back (-1) through the
    /// discovery order, wrapping at the ends. Returns the newly current
    /// archive.
    pub async fn cycle_region(&self, step: i32) -> Option<ReaderHandle> {
        let mut inner = self.inner.lock().await;
        if inner.archives.is_empty() {
            return None;
        }

        let len = inner.archives.len() as i32;
        let current_idx = inner
            .current
            .as_ref()
            .and_then(|current| {
                inner
                    .archives
                    .iter()
                    .position(|a| &a.file_name == current)
            })
            .unwrap_or(0) as i32;
        let next_idx = (current_idx + step).rem_euclid(len) as usize;
        let chosen = inner.archives[next_idx].file_name.clone();

        let handle = self.open_archive(&mut inner, &chosen).await;
        if handle.is_some() {
            inner.current = Some(chosen);
        }
        handle
    }

    async fn open_archive(&self, inner: &mut Inner, file_name: &str) -> Option<ReaderHandle> {
        inner.access_counter += 1;
        let counter = inner.access_counter;

        if let Some(entry) = inner.open.get_mut(file_name) {
            entry.last_used = counter;
            entry.opened_or_used_at = Instant::now();
            return Some(entry.reader.clone());
        }

        self.evict(inner, file_name);

        let path = inner
            .archives
            .iter()
            .find(|a| a.file_name == file_name)?
            .path
            .clone();
        match MbtilesReader::open(&path).await {
            Ok(reader) => {
                let reader = Arc::new(reader);
                inner.open.insert(
                    file_name.to_string(),
                    OpenEntry {
                        reader: reader.clone(),
                        last_used: counter,
                        opened_or_used_at: Instant::now(),
                    },
                );
                Some(reader)
            }
            Err(err) => {
                // Dead at runtime despite passing discovery: drop it for good.
                warn!(archive = %file_name, error = %err, "archive failed to reopen, removing");
                inner.archives.retain(|a| a.file_name != file_name);
                if inner.current.as_deref() == Some(file_name) {
                    inner.current = None;
                }
                None
            }
        }
    }

    /// Close idle archives past the cache timeout, then enforce the open-file
    /// cap. The LRU order uses the access counter, not wall-clock time.
    fn evict(&self, inner: &mut Inner, keep: &str) {
        let now = Instant::now();
        inner.open.retain(|name, entry| {
            name == keep || now.duration_since(entry.opened_or_used_at) < self.cfg.cache_timeout
        });

        while inner.open.len() >= self.cfg.max_open {
            let Some(oldest) = inner
                .open
                .iter()
                .filter(|(name, _)| name.as_str() != keep)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(name, _)| name.clone())
            else {
                break;
            };
            inner.open.remove(&oldest);
            if inner.current.as_deref() == Some(oldest.as_str()) {
                inner.current = None;
            }
        }
    }

    /// Drop every open archive. Used on shutdown.
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.open.clear();
        inner.current = None;
    }
}

fn distance_to(info: &ArchiveInfo, lat: f64, lon: f64) -> f64 {
    let (clat, clon) = info.bounds.center();
    ((lat - clat).powi(2) + (lon - clon).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::geo::lonlat_to_tile;

    async fn build_archive(
        dir: &Path,
        file: &str,
        name: &str,
        bounds: &str,
        zooms: &[u8],
        at: (f64, f64),
    ) {
        let path = dir.join(file);
        let pool = fixtures::create_archive_pool(&path).await;
        fixtures::put_metadata(&pool, "name", name).await;
        fixtures::put_metadata(&pool, "bounds", bounds).await;
        for &zoom in zooms {
            let (cx, cy) = lonlat_to_tile(at.0, at.1, zoom);
            let (cx, cy) = (cx.floor() as u32, cy.floor() as u32);
            fixtures::fill_zoom(&pool, zoom, cx.saturating_sub(2)..=cx + 2, cy.saturating_sub(2)..=cy + 2)
                .await;
        }
        pool.close().await;
    }

    async fn two_region_manager(dir: &Path) -> MbtilesManager {
        // Netherlands and an Alpine region; the point used below is in NL.
        build_archive(dir, "alps.mbtiles", "Alps", "5.0,45.0,16.0,48.0", &[10], (46.5, 10.0)).await;
        build_archive(
            dir,
            "netherlands.mbtiles",
            "Netherlands",
            "3.0,50.7,7.3,53.6",
            &[10, 12],
            (52.3676, 4.9041),
        )
        .await;
        MbtilesManager::discover(dir, ManagerConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn selection_prefers_containing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_region_manager(dir.path()).await;

        let reader = manager.reader_for(52.3676, 4.9041).await.unwrap();
        assert_eq!(reader.info().name, "Netherlands");
        assert_eq!(manager.current_info().await.unwrap().name, "Netherlands");
    }

    #[tokio::test]
    async fn selection_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_region_manager(dir.path()).await;

        let first = manager.reader_for(46.5, 10.0).await.unwrap().info().name.clone();
        for _ in 0..3 {
            let again = manager.reader_for(46.5, 10.0).await.unwrap().info().name.clone();
            assert_eq!(again, first);
        }
    }

    #[tokio::test]
    async fn uncovered_point_falls_back_to_closest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_region_manager(dir.path()).await;

        // Gulf of Guinea: neither region covers it; the Alps are closer.
        let reader = manager.reader_for(0.0, 0.0).await.unwrap();
        assert_eq!(reader.info().name, "Alps");
    }

    #[tokio::test]
    async fn current_archive_is_sticky_within_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_region_manager(dir.path()).await;

        manager.reader_for(52.3676, 4.9041).await.unwrap();
        // A second point still inside NL must not trigger re-selection.
        let reader = manager.reader_for(51.9, 4.5).await.unwrap();
        assert_eq!(reader.info().name, "Netherlands");
    }

    #[tokio::test]
    async fn region_cycling_wraps_in_discovery_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_region_manager(dir.path()).await;

        // Discovery order is lexicographic: alps, netherlands.
        let first = manager.cycle_region(1).await.unwrap();
        assert_eq!(first.info().name, "Netherlands");
        let wrapped = manager.cycle_region(1).await.unwrap();
        assert_eq!(wrapped.info().name, "Alps");
        let back = manager.cycle_region(-1).await.unwrap();
        assert_eq!(back.info().name, "Netherlands");
    }

    #[tokio::test]
    async fn lru_caps_open_archives() {
        let dir = tempfile::tempdir().unwrap();
        build_archive(dir.path(), "a.mbtiles", "A", "0.0,0.0,1.0,1.0", &[8], (0.5, 0.5)).await;
        build_archive(dir.path(), "b.mbtiles", "B", "10.0,10.0,11.0,11.0", &[8], (10.5, 10.5)).await;
        build_archive(dir.path(), "c.mbtiles", "C", "20.0,20.0,21.0,21.0", &[8], (20.5, 20.5)).await;

        let cfg = ManagerConfig {
            max_open: 2,
            ..ManagerConfig::default()
        };
        let manager = MbtilesManager::discover(dir.path(), cfg).await.unwrap();

        manager.reader_for(0.5, 0.5).await.unwrap();
        manager.reader_for(10.5, 10.5).await.unwrap();
        manager.reader_for(20.5, 20.5).await.unwrap();

        let inner = manager.inner.lock().await;
        assert!(inner.open.len() <= 2);
        assert!(inner.open.contains_key("c.mbtiles"));
    }

    #[tokio::test]
    async fn discovery_skips_unreadable_archives() {
        let dir = tempfile::tempdir().unwrap();
        build_archive(dir.path(), "good.mbtiles", "Good", "0.0,0.0,1.0,1.0", &[8], (0.5, 0.5)).await;
        std::fs::write(dir.path().join("broken.mbtiles"), b"not a database").unwrap();

        let manager = MbtilesManager::discover(dir.path(), ManagerConfig::default())
            .await
            .unwrap();
        let regions = manager.regions().await;
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].name, "Good");
    }
}
