//! Operator CLI for regional tile archives: inspect metadata, extract
//! composite previews, merge archives into one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing_subscriber::EnvFilter;

use elcano_mbtiles::{MbtilesReader, compose};

#[derive(Parser)]
#[command(name = "tile_tools", about = "Inspect, extract and merge MBTiles archives")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print archive metadata, bounds and zoom levels.
    Info {
        /// Path to the .mbtiles archive.
        archive: PathBuf,
    },
    /// Render a composite PNG centered on a coordinate.
    Extract {
        archive: PathBuf,
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lon: f64,
        #[arg(long, default_value_t = 12)]
        zoom: u8,
        #[arg(long, default_value_t = 800)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Output PNG path.
        #[arg(long)]
        out: PathBuf,
    },
    /// Merge archives into one; earlier inputs win on overlapping tiles.
    Merge {
        /// Output archive (must not exist yet).
        out: PathBuf,
        /// Input archives, highest priority first.
        inputs: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    match Cli::parse().command {
        Command::Info { archive } => info(&archive).await,
        Command::Extract {
            archive,
            lat,
            lon,
            zoom,
            width,
            height,
            out,
        } => extract(&archive, lat, lon, zoom, width, height, &out).await,
        Command::Merge { out, inputs } => merge(&out, &inputs).await,
    }
}

async fn info(archive: &Path) -> Result<()> {
    let reader = MbtilesReader::open(archive).await?;
    let info = reader.info();

    println!("Archive:     {}", archive.display());
    println!("Name:        {}", info.name);
    if !info.description.is_empty() {
        println!("Description: {}", info.description);
    }
    println!("Format:      {}", info.format);
    println!(
        "Bounds:      {:.4},{:.4} to {:.4},{:.4} (w,s,e,n)",
        info.bounds.west, info.bounds.south, info.bounds.east, info.bounds.north
    );
    println!("Zoom range:  {}..={}", info.min_zoom, info.max_zoom);
    println!(
        "Stored zooms: {}",
        info.zoom_levels
            .iter()
            .map(|z| z.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

async fn extract(
    archive: &Path,
    lat: f64,
    lon: f64,
    zoom: u8,
    width: u32,
    height: u32,
    out: &Path,
) -> Result<()> {
    let reader = MbtilesReader::open(archive).await?;
    if !reader.contains(lat, lon) {
        println!(
            "note: {lat:.4},{lon:.4} is outside the archive bounds, expect placeholders"
        );
    }

    let (png, meta) = compose(&reader, lat, lon, zoom, width, height, true).await?;
    std::fs::write(out, &png).with_context(|| format!("failed to write {}", out.display()))?;

    println!(
        "wrote {} ({}x{}, zoom {}{}, {}/{} tiles)",
        out.display(),
        meta.image_w,
        meta.image_h,
        meta.actual_zoom,
        if meta.zoom_adjusted {
            format!(" adjusted from {}", meta.requested_zoom)
        } else {
            String::new()
        },
        meta.tiles_found,
        meta.tiles_found + meta.tiles_missing,
    );
    Ok(())
}

async fn merge(out: &Path, inputs: &[PathBuf]) -> Result<()> {
    if inputs.is_empty() {
        bail!("at least one input archive is required");
    }
    if out.exists() {
        bail!("output {} already exists", out.display());
    }

    let output = open_output(out).await?;
    let mut bounds: Option<[f64; 4]> = None;
    let mut min_zoom = u8::MAX;
    let mut max_zoom = 0u8;
    let mut name = String::new();
    let mut format = String::new();
    let mut total_added = 0u64;
    let mut total_skipped = 0u64;

    for input in inputs {
        let reader = MbtilesReader::open(input).await?;
        let info = reader.info().clone();
        if name.is_empty() {
            name = info.name.clone();
            format = info.format.clone();
        }
        bounds = Some(match bounds {
            None => [
                info.bounds.west,
                info.bounds.south,
                info.bounds.east,
                info.bounds.north,
            ],
            Some([w, s, e, n]) => [
                w.min(info.bounds.west),
                s.min(info.bounds.south),
                e.max(info.bounds.east),
                n.max(info.bounds.north),
            ],
        });
        min_zoom = min_zoom.min(info.min_zoom);
        max_zoom = max_zoom.max(info.max_zoom);

        let (added, skipped) = copy_tiles(input, &output).await?;
        total_added += added;
        total_skipped += skipped;
        println!(
            "{}: {added} tiles added, {skipped} overlapping skipped",
            input.display()
        );
    }

    let bounds = bounds.expect("at least one input");
    let metadata = [
        ("name", format!("{name} (merged)")),
        ("format", format),
        (
            "bounds",
            format!("{},{},{},{}", bounds[0], bounds[1], bounds[2], bounds[3]),
        ),
        ("minzoom", min_zoom.to_string()),
        ("maxzoom", max_zoom.to_string()),
    ];
    for (key, value) in metadata {
        sqlx::query("INSERT INTO metadata (name, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&output)
            .await?;
    }

    output.close().await;
    println!(
        "merged {} archives into {} ({total_added} tiles, {total_skipped} skipped)",
        inputs.len(),
        out.display()
    );
    Ok(())
}

async fn open_output(path: &Path) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;

    sqlx::query("CREATE TABLE metadata (name TEXT, value TEXT)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE UNIQUE INDEX idx_tiles ON tiles (zoom_level, tile_column, tile_row)")
        .execute(&pool)
        .await?;

    Ok(pool)
}

/// Stream every tile row from `input` into the output, skipping coordinates
/// that an earlier input already provided.
async fn copy_tiles(input: &Path, output: &SqlitePool) -> Result<(u64, u64)> {
    let opts = SqliteConnectOptions::new().filename(input).read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;

    let total: i64 = sqlx::query("SELECT COUNT(*) FROM tiles")
        .fetch_one(&pool)
        .await?
        .get(0);

    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos}/{len} ({percent}%) ETA {eta}")?
            .progress_chars("##-"),
    );

    let mut added = 0u64;
    let mut skipped = 0u64;
    let mut rows =
        sqlx::query("SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles").fetch(&pool);

    while let Some(row) = rows.try_next().await? {
        let zoom: i64 = row.get(0);
        let column: i64 = row.get(1);
        let tms_row: i64 = row.get(2);
        let data: Vec<u8> = row.get(3);

        let result = sqlx::query(
            "INSERT OR IGNORE INTO tiles (zoom_level, tile_column, tile_row, tile_data)
             VALUES (?, ?, ?, ?)",
        )
        .bind(zoom)
        .bind(column)
        .bind(tms_row)
        .bind(data)
        .execute(output)
        .await?;

        if result.rows_affected() == 1 {
            added += 1;
        } else {
            skipped += 1;
        }
        bar.inc(1);
    }

    bar.finish_and_clear();
    pool.close().await;
    Ok((added, skipped))
}
