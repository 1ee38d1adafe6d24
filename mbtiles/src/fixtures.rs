//! Shared helpers for building throwaway archives in tests.

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, Rgba, RgbaImage};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::geo::tms_flip;

pub async fn create_archive_pool(path: &Path) -> SqlitePool {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .expect("fixture archive open");

    sqlx::query("CREATE TABLE metadata (name TEXT, value TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB)",
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

pub async fn put_metadata(pool: &SqlitePool, name: &str, value: &str) {
    sqlx::query("INSERT INTO metadata (name, value) VALUES (?, ?)")
        .bind(name)
        .bind(value)
        .execute(pool)
        .await
        .unwrap();
}

/// Insert a tile addressed in XYZ; the row is stored TMS-flipped like a real
/// archive.
pub async fn put_tile_xyz(pool: &SqlitePool, zoom: u8, x: u32, y: u32, data: &[u8]) {
    sqlx::query("INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?, ?, ?, ?)")
        .bind(i64::from(zoom))
        .bind(i64::from(x))
        .bind(i64::from(tms_flip(y, zoom)))
        .bind(data)
        .execute(pool)
        .await
        .unwrap();
}

/// A valid 256x256 solid-shade PNG payload.
pub fn png_tile(shade: u8) -> Vec<u8> {
    let img = RgbaImage::from_pixel(256, 256, Rgba([shade, shade, shade, 255]));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Fill the whole tile pyramid level `zoom` inside the given XYZ index ranges.
pub async fn fill_zoom(pool: &SqlitePool, zoom: u8, xs: std::ops::RangeInclusive<u32>, ys: std::ops::RangeInclusive<u32>) {
    let data = png_tile(128);
    for x in xs {
        for y in ys.clone() {
            put_tile_xyz(pool, zoom, x, y, &data).await;
        }
    }
}
