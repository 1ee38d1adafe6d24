//! Reading, selecting and compositing regional MBTiles archives.
//!
//! An archive is a SQLite file with the standard `metadata(name, value)` and
//! `tiles(zoom_level, tile_column, tile_row, tile_data)` tables. Tile rows are
//! stored in the TMS scheme; everything in this crate speaks XYZ and flips Y
//! internally.

mod compose;
mod error;
mod geo;
mod manager;
mod reader;

pub use compose::{CompositeMetadata, compose};
pub use error::{TileError, TileResult};
pub use geo::{MAX_MERCATOR_LAT, TILE_SIZE, clamp_lat, lonlat_to_tile, tile_to_lonlat, tms_flip, wrap_lon};
pub use manager::{ManagerConfig, MbtilesManager, ReaderHandle, RegionSummary};
pub use reader::{ArchiveBounds, ArchiveInfo, MbtilesReader, TileCoverage};

#[cfg(test)]
pub(crate) mod fixtures;
