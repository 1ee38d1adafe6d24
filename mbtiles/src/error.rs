use std::path::PathBuf;

use thiserror::Error;

pub type TileResult<T> = Result<T, TileError>;

#[derive(Debug, Error)]
pub enum TileError {
    #[error("failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("archive query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("archive has no bounds metadata and no tiles to derive them from")]
    NoBounds,

    #[error("image encode failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("no .mbtiles archives found under {0}")]
    NoArchives(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
