use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::{TileError, TileResult};
use crate::geo::{lonlat_to_tile, tile_to_lonlat, tms_flip};

/// A composite is considered usable at a zoom once at least this share of its
/// tile grid resolves.
pub const MIN_COVERAGE_RATIO: f64 = 0.10;

/// Geographic extent of an archive, degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveBounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl ArchiveBounds {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.south <= lat && lat <= self.north && self.west <= lon && lon <= self.east
    }

    /// (lat, lon) midpoint of the extent.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.south + self.north) / 2.0,
            (self.west + self.east) / 2.0,
        )
    }

    /// Parse the MBTiles `bounds` metadata value: "west,south,east,north".
    fn parse(value: &str) -> Option<Self> {
        let parts: Vec<f64> = value
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        if parts.len() != 4 {
            return None;
        }
        Some(Self {
            west: parts[0],
            south: parts[1],
            east: parts[2],
            north: parts[3],
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub name: String,
    pub description: String,
    pub format: String,
    pub bounds: ArchiveBounds,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub zoom_levels: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct TileCoverage {
    pub available: u32,
    pub total: u32,
}

impl TileCoverage {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.available) / f64::from(self.total)
        }
    }
}

/// One open tile archive. Immutable once opened; all access is read-only.
pub struct MbtilesReader {
    pool: SqlitePool,
    info: ArchiveInfo,
    path: PathBuf,
}

impl MbtilesReader {
    pub async fn open(path: &Path) -> TileResult<Self> {
        let opts = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|source| TileError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let info = Self::load_info(&pool).await?;
        debug!(
            archive = %path.display(),
            name = %info.name,
            zooms = ?info.zoom_levels,
            "opened archive"
        );

        Ok(Self {
            pool,
            info,
            path: path.to_path_buf(),
        })
    }

    async fn load_info(pool: &SqlitePool) -> TileResult<ArchiveInfo> {
        let mut metadata = HashMap::new();
        for row in sqlx::query("SELECT name, value FROM metadata")
            .fetch_all(pool)
            .await?
        {
            let name: String = row.get(0);
            let value: String = row.get(1);
            metadata.insert(name, value);
        }

        let zoom_levels: Vec<u8> =
            sqlx::query("SELECT DISTINCT zoom_level FROM tiles ORDER BY zoom_level")
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|row| row.get::<i64, _>(0) as u8)
                .collect();

        let bounds = match metadata.get("bounds").and_then(|v| ArchiveBounds::parse(v)) {
            Some(bounds) => bounds,
            None => Self::bounds_from_tiles(pool).await?,
        };

        let min_zoom = metadata
            .get("minzoom")
            .and_then(|v| v.parse().ok())
            .or_else(|| zoom_levels.first().copied())
            .unwrap_or(0);
        let max_zoom = metadata
            .get("maxzoom")
            .and_then(|v| v.parse().ok())
            .or_else(|| zoom_levels.last().copied())
            .unwrap_or(18);

        Ok(ArchiveInfo {
            name: metadata.get("name").cloned().unwrap_or_else(|| "Unknown".into()),
            description: metadata.get("description").cloned().unwrap_or_default(),
            format: metadata.get("format").cloned().unwrap_or_else(|| "png".into()),
            bounds,
            min_zoom,
            max_zoom,
            zoom_levels,
        })
    }

    /// Derive bounds from the tile index extent at the deepest zoom when the
    /// `bounds` metadata key is missing or malformed.
    async fn bounds_from_tiles(pool: &SqlitePool) -> TileResult<ArchiveBounds> {
        let row = sqlx::query(
            "SELECT MIN(tile_column), MIN(tile_row), MAX(tile_column), MAX(tile_row), zoom_level
             FROM tiles GROUP BY zoom_level ORDER BY zoom_level DESC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?
        .ok_or(TileError::NoBounds)?;

        let min_x: i64 = row.get(0);
        let min_row: i64 = row.get(1);
        let max_x: i64 = row.get(2);
        let max_row: i64 = row.get(3);
        let zoom = row.get::<i64, _>(4) as u8;

        // Rows are TMS; the smallest row is the southernmost.
        let min_y = i64::from(tms_flip(max_row as u32, zoom));
        let max_y = i64::from(tms_flip(min_row as u32, zoom));

        let (west, north) = tile_to_lonlat(min_x as f64, min_y as f64, zoom);
        let (east, south) = tile_to_lonlat((max_x + 1) as f64, (max_y + 1) as f64, zoom);

        warn!("archive is missing bounds metadata, derived extent from zoom {zoom} tile index");
        Ok(ArchiveBounds {
            south,
            west,
            north,
            east,
        })
    }

    pub fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.info.bounds.contains(lat, lon)
    }

    /// Angular distance (degrees) from a point to the bounds center. Not a
    /// surface distance, but monotone, which is all selection needs.
    pub fn distance_to_center(&self, lat: f64, lon: f64) -> f64 {
        let (clat, clon) = self.info.bounds.center();
        ((lat - clat).powi(2) + (lon - clon).powi(2)).sqrt()
    }

    /// Fetch one tile addressed in XYZ. A missing row is `Ok(None)`.
    pub async fn get_tile(&self, zoom: u8, x: i64, y: i64) -> TileResult<Option<Vec<u8>>> {
        let side = 1i64 << zoom;
        if x < 0 || y < 0 || x >= side || y >= side {
            return Ok(None);
        }

        let tms_row = i64::from(tms_flip(y as u32, zoom));
        let row = sqlx::query(
            "SELECT tile_data FROM tiles WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
        )
        .bind(i64::from(zoom))
        .bind(x)
        .bind(tms_row)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    /// Count available tiles in a `w_tiles` x `h_tiles` grid centered on the
    /// given XYZ tile coordinate.
    pub async fn tile_coverage(
        &self,
        zoom: u8,
        center_x: i64,
        center_y: i64,
        w_tiles: u32,
        h_tiles: u32,
    ) -> TileResult<TileCoverage> {
        let total = w_tiles * h_tiles;
        let side = 1i64 << zoom;

        let x0 = center_x - i64::from(w_tiles / 2);
        let y0 = center_y - i64::from(h_tiles / 2);
        let x1 = x0 + i64::from(w_tiles) - 1;
        let y1 = y0 + i64::from(h_tiles) - 1;

        let x0 = x0.max(0);
        let x1 = x1.min(side - 1);
        let y0c = y0.max(0);
        let y1c = y1.min(side - 1);
        if x0 > x1 || y0c > y1c {
            return Ok(TileCoverage {
                available: 0,
                total,
            });
        }

        // XYZ row range maps to a reversed TMS row range.
        let tms_lo = i64::from(tms_flip(y1c as u32, zoom));
        let tms_hi = i64::from(tms_flip(y0c as u32, zoom));

        let row = sqlx::query(
            "SELECT COUNT(*) FROM tiles
             WHERE zoom_level = ? AND tile_column BETWEEN ? AND ? AND tile_row BETWEEN ? AND ?",
        )
        .bind(i64::from(zoom))
        .bind(x0)
        .bind(x1)
        .bind(tms_lo)
        .bind(tms_hi)
        .fetch_one(&self.pool)
        .await?;

        let available = row.get::<i64, _>(0).min(i64::from(total)) as u32;
        Ok(TileCoverage { available, total })
    }

    async fn coverage_ratio_at(
        &self,
        zoom: u8,
        lat: f64,
        lon: f64,
        w_tiles: u32,
        h_tiles: u32,
    ) -> TileResult<f64> {
        let (cx, cy) = lonlat_to_tile(lat, lon, zoom);
        let coverage = self
            .tile_coverage(zoom, cx.floor() as i64, cy.floor() as i64, w_tiles, h_tiles)
            .await?;
        Ok(coverage.ratio())
    }

    /// Pick the zoom level to actually render for a requested zoom.
    ///
    /// The requested level wins outright when it is stored and usable.
    /// Otherwise every stored level is scored: detail tiers (>=12, 10..12,
    /// <10), coverage of the target frame, distance from the request, and an
    /// exact-match bonus. Low-coverage winners are passed over for the best
    /// scoring level that clears the coverage floor, if any does.
    pub async fn best_available_zoom(
        &self,
        requested: u8,
        lat: f64,
        lon: f64,
        w_tiles: u32,
        h_tiles: u32,
    ) -> TileResult<u8> {
        let levels = &self.info.zoom_levels;
        if levels.is_empty() {
            return Ok(requested);
        }

        if levels.contains(&requested)
            && self
                .coverage_ratio_at(requested, lat, lon, w_tiles, h_tiles)
                .await?
                >= MIN_COVERAGE_RATIO
        {
            return Ok(requested);
        }

        let mut scored = Vec::with_capacity(levels.len());
        for &zoom in levels {
            let ratio = self
                .coverage_ratio_at(zoom, lat, lon, w_tiles, h_tiles)
                .await?;
            let tier = if zoom >= 12 {
                100.0
            } else if zoom >= 10 {
                50.0
            } else {
                10.0
            };
            let mut score = tier + 200.0 * ratio
                - 10.0 * f64::from(zoom.abs_diff(requested));
            if zoom == requested {
                score += 50.0;
            }
            scored.push((zoom, ratio, score));
        }

        scored.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then_with(|| a.0.abs_diff(requested).cmp(&b.0.abs_diff(requested)))
                .then_with(|| b.0.cmp(&a.0))
        });

        let (top_zoom, top_ratio, _) = scored[0];
        if top_ratio < MIN_COVERAGE_RATIO {
            if let Some(&(zoom, _, _)) = scored
                .iter()
                .find(|(_, ratio, _)| *ratio >= MIN_COVERAGE_RATIO)
            {
                debug!(requested, chosen = zoom, "skipped low-coverage zoom levels");
                return Ok(zoom);
            }
        }

        Ok(top_zoom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::geo::lonlat_to_tile;

    const AMSTERDAM: (f64, f64) = (52.3676, 4.9041);

    async fn archive_with_zooms(
        dir: &tempfile::TempDir,
        zooms: &[u8],
        span: u32,
    ) -> MbtilesReader {
        let path = dir.path().join("region.mbtiles");
        let pool = fixtures::create_archive_pool(&path).await;
        fixtures::put_metadata(&pool, "name", "Test Region").await;
        fixtures::put_metadata(&pool, "bounds", "3.0,51.0,7.5,54.0").await;
        fixtures::put_metadata(&pool, "minzoom", &zooms[0].to_string()).await;
        fixtures::put_metadata(&pool, "maxzoom", &zooms[zooms.len() - 1].to_string()).await;

        for &zoom in zooms {
            let (cx, cy) = lonlat_to_tile(AMSTERDAM.0, AMSTERDAM.1, zoom);
            let (cx, cy) = (cx.floor() as u32, cy.floor() as u32);
            fixtures::fill_zoom(
                &pool,
                zoom,
                cx.saturating_sub(span)..=cx + span,
                cy.saturating_sub(span)..=cy + span,
            )
            .await;
        }
        pool.close().await;

        MbtilesReader::open(&path).await.unwrap()
    }

    #[tokio::test]
    async fn metadata_and_bounds_parse() {
        let dir = tempfile::tempdir().unwrap();
        let reader = archive_with_zooms(&dir, &[10], 2).await;

        let info = reader.info();
        assert_eq!(info.name, "Test Region");
        assert_eq!(info.zoom_levels, vec![10]);
        assert!(reader.contains(AMSTERDAM.0, AMSTERDAM.1));
        assert!(!reader.contains(0.0, 0.0));
    }

    #[tokio::test]
    async fn tile_fetch_applies_tms_flip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flip.mbtiles");
        let pool = fixtures::create_archive_pool(&path).await;
        fixtures::put_metadata(&pool, "bounds", "-180,-85,180,85").await;
        fixtures::put_tile_xyz(&pool, 3, 2, 5, b"payload").await;
        pool.close().await;

        let reader = MbtilesReader::open(&path).await.unwrap();
        let tile = reader.get_tile(3, 2, 5).await.unwrap();
        assert_eq!(tile.as_deref(), Some(&b"payload"[..]));

        assert!(reader.get_tile(3, 2, 6).await.unwrap().is_none());
        assert!(reader.get_tile(3, -1, 5).await.unwrap().is_none());
        assert!(reader.get_tile(3, 8, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn coverage_counts_grid_hits() {
        let dir = tempfile::tempdir().unwrap();
        let reader = archive_with_zooms(&dir, &[12], 1).await;

        let (cx, cy) = lonlat_to_tile(AMSTERDAM.0, AMSTERDAM.1, 12);
        let coverage = reader
            .tile_coverage(12, cx.floor() as i64, cy.floor() as i64, 3, 3)
            .await
            .unwrap();
        assert_eq!(coverage.total, 9);
        assert_eq!(coverage.available, 9);
        assert!((coverage.ratio() - 1.0).abs() < f64::EPSILON);

        // Far away, same zoom: nothing there.
        let coverage = reader.tile_coverage(12, 0, 0, 3, 3).await.unwrap();
        assert_eq!(coverage.available, 0);
    }

    #[tokio::test]
    async fn requested_zoom_wins_when_stored_and_covered() {
        let dir = tempfile::tempdir().unwrap();
        let reader = archive_with_zooms(&dir, &[10, 11, 13], 3).await;

        let zoom = reader
            .best_available_zoom(13, AMSTERDAM.0, AMSTERDAM.1, 4, 3)
            .await
            .unwrap();
        assert_eq!(zoom, 13);
    }

    #[tokio::test]
    async fn missing_zoom_falls_back_to_best_stored_level() {
        let dir = tempfile::tempdir().unwrap();
        let reader = archive_with_zooms(&dir, &[10, 11, 13], 3).await;

        // Scenario from the field: zooms {10,11,13}, request 14.
        let zoom = reader
            .best_available_zoom(14, AMSTERDAM.0, AMSTERDAM.1, 4, 3)
            .await
            .unwrap();
        assert_eq!(zoom, 13);
    }

    #[tokio::test]
    async fn uncovered_levels_are_passed_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.mbtiles");
        let pool = fixtures::create_archive_pool(&path).await;
        fixtures::put_metadata(&pool, "bounds", "3.0,51.0,7.5,54.0").await;

        // Zoom 14 exists but only far away from the point; zoom 11 covers it.
        fixtures::put_tile_xyz(&pool, 14, 0, 0, &fixtures::png_tile(80)).await;
        let (cx, cy) = lonlat_to_tile(AMSTERDAM.0, AMSTERDAM.1, 11);
        let (cx, cy) = (cx.floor() as u32, cy.floor() as u32);
        fixtures::fill_zoom(&pool, 11, cx - 3..=cx + 3, cy - 3..=cy + 3).await;
        pool.close().await;

        let reader = MbtilesReader::open(&path).await.unwrap();
        let zoom = reader
            .best_available_zoom(14, AMSTERDAM.0, AMSTERDAM.1, 4, 3)
            .await
            .unwrap();
        assert_eq!(zoom, 11);
    }

    #[tokio::test]
    async fn bounds_derive_from_tile_extent_when_metadata_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nobounds.mbtiles");
        let pool = fixtures::create_archive_pool(&path).await;
        let (cx, cy) = lonlat_to_tile(AMSTERDAM.0, AMSTERDAM.1, 9);
        let (cx, cy) = (cx.floor() as u32, cy.floor() as u32);
        fixtures::fill_zoom(&pool, 9, cx - 1..=cx + 1, cy - 1..=cy + 1).await;
        pool.close().await;

        let reader = MbtilesReader::open(&path).await.unwrap();
        assert!(reader.contains(AMSTERDAM.0, AMSTERDAM.1));
    }
}
