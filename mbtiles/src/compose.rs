use std::io::Cursor;
use std::sync::OnceLock;

use ab_glyph::{FontVec, PxScale};
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::{draw_line_segment_mut, draw_text_mut};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::TileResult;
use crate::geo::{TILE_SIZE, clamp_lat, lonlat_to_tile, wrap_lon};
use crate::reader::MbtilesReader;

const CANVAS_GREY: Rgba<u8> = Rgba([240, 240, 240, 255]);
const PLACEHOLDER_GRID: Rgba<u8> = Rgba([200, 200, 200, 255]);
const PLACEHOLDER_TEXT: Rgba<u8> = Rgba([128, 128, 128, 255]);

/// What actually went into a composite, for the info panel and logs.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeMetadata {
    pub requested_zoom: u8,
    pub actual_zoom: u8,
    pub zoom_adjusted: bool,
    pub tiles_found: u32,
    pub tiles_missing: u32,
    pub availability_ratio: f64,
    pub center_lat: f64,
    pub center_lon: f64,
    pub image_w: u32,
    pub image_h: u32,
    pub archive_name: String,
}

/// Assemble a `px_w` x `px_h` PNG centered on a coordinate.
///
/// Missing and undecodable tiles count as missing; with `use_fallback` they
/// are inpainted with a grid placeholder instead of bare canvas. The returned
/// image always has exactly the requested dimensions.
pub async fn compose(
    reader: &MbtilesReader,
    lat: f64,
    lon: f64,
    zoom: u8,
    px_w: u32,
    px_h: u32,
    use_fallback: bool,
) -> TileResult<(Vec<u8>, CompositeMetadata)> {
    let lat = clamp_lat(lat);
    let lon = wrap_lon(lon);

    let tiles_x = px_w.div_ceil(TILE_SIZE) + 1;
    let tiles_y = px_h.div_ceil(TILE_SIZE) + 1;

    let actual_zoom = reader
        .best_available_zoom(zoom, lat, lon, tiles_x, tiles_y)
        .await?;
    let zoom_adjusted = actual_zoom != zoom;

    let (center_x, center_y) = lonlat_to_tile(lat, lon, actual_zoom);
    let start_x = center_x.floor() as i64 - i64::from(tiles_x / 2);
    let start_y = center_y.floor() as i64 - i64::from(tiles_y / 2);

    let canvas_w = tiles_x * TILE_SIZE;
    let canvas_h = tiles_y * TILE_SIZE;
    let mut canvas = RgbaImage::from_pixel(canvas_w, canvas_h, CANVAS_GREY);

    let mut tiles_found = 0u32;
    let mut tiles_missing = 0u32;

    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let tile_x = start_x + i64::from(tx);
            let tile_y = start_y + i64::from(ty);
            let paste_x = i64::from(tx * TILE_SIZE);
            let paste_y = i64::from(ty * TILE_SIZE);

            match reader.get_tile(actual_zoom, tile_x, tile_y).await? {
                Some(bytes) => match image::load_from_memory(&bytes) {
                    Ok(tile) => {
                        let mut tile = tile.to_rgba8();
                        if zoom_adjusted {
                            tile = rescale_tile(tile, zoom, actual_zoom);
                        }
                        imageops::overlay(&mut canvas, &tile, paste_x, paste_y);
                        tiles_found += 1;
                    }
                    Err(err) => {
                        debug!(tile_x, tile_y, zoom = actual_zoom, error = %err, "undecodable tile");
                        tiles_missing += 1;
                        if use_fallback {
                            paint_placeholder(&mut canvas, paste_x as u32, paste_y as u32);
                        }
                    }
                },
                None => {
                    tiles_missing += 1;
                    if use_fallback {
                        paint_placeholder(&mut canvas, paste_x as u32, paste_y as u32);
                    }
                }
            }
        }
    }

    // Crop to the frame, centered on the coordinate's subpixel position.
    let focus_x = (center_x - start_x as f64) * f64::from(TILE_SIZE);
    let focus_y = (center_y - start_y as f64) * f64::from(TILE_SIZE);
    let crop_x = (focus_x - f64::from(px_w) / 2.0)
        .round()
        .clamp(0.0, f64::from(canvas_w - px_w)) as u32;
    let crop_y = (focus_y - f64::from(px_h) / 2.0)
        .round()
        .clamp(0.0, f64::from(canvas_h - px_h)) as u32;
    let framed = imageops::crop_imm(&canvas, crop_x, crop_y, px_w, px_h).to_image();

    let mut png = Vec::new();
    framed.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

    let total = tiles_found + tiles_missing;
    let metadata = CompositeMetadata {
        requested_zoom: zoom,
        actual_zoom,
        zoom_adjusted,
        tiles_found,
        tiles_missing,
        availability_ratio: if total > 0 {
            f64::from(tiles_found) / f64::from(total)
        } else {
            0.0
        },
        center_lat: lat,
        center_lon: lon,
        image_w: px_w,
        image_h: px_h,
        archive_name: reader.info().name.clone(),
    };

    debug!(
        found = tiles_found,
        missing = tiles_missing,
        requested = zoom,
        actual = actual_zoom,
        "composite assembled"
    );

    Ok((png, metadata))
}

/// Make a tile stored at `actual` zoom stand in for one at `requested` zoom.
/// Zooming in enlarges and center-crops; zooming out shrinks onto a grey
/// tile-sized backing.
fn rescale_tile(tile: RgbaImage, requested: u8, actual: u8) -> RgbaImage {
    let diff = i32::from(requested) - i32::from(actual);
    if diff > 0 {
        let factor = 1u32 << diff.min(4);
        let enlarged = imageops::resize(
            &tile,
            TILE_SIZE * factor,
            TILE_SIZE * factor,
            FilterType::Lanczos3,
        );
        let offset = (TILE_SIZE * factor - TILE_SIZE) / 2;
        imageops::crop_imm(&enlarged, offset, offset, TILE_SIZE, TILE_SIZE).to_image()
    } else {
        let factor = 1u32 << (-diff).min(4);
        let size = (TILE_SIZE / factor).max(1);
        let shrunk = imageops::resize(&tile, size, size, FilterType::Lanczos3);
        let mut backing = RgbaImage::from_pixel(TILE_SIZE, TILE_SIZE, CANVAS_GREY);
        let offset = i64::from((TILE_SIZE - size) / 2);
        imageops::overlay(&mut backing, &shrunk, offset, offset);
        backing
    }
}

fn paint_placeholder(canvas: &mut RgbaImage, x: u32, y: u32) {
    let step = TILE_SIZE / 4;
    for offset in (0..=TILE_SIZE).step_by(step as usize) {
        let o = offset.min(TILE_SIZE - 1) as f32;
        draw_line_segment_mut(
            canvas,
            (x as f32 + o, y as f32),
            (x as f32 + o, (y + TILE_SIZE - 1) as f32),
            PLACEHOLDER_GRID,
        );
        draw_line_segment_mut(
            canvas,
            (x as f32, y as f32 + o),
            ((x + TILE_SIZE - 1) as f32, y as f32 + o),
            PLACEHOLDER_GRID,
        );
    }

    if let Some(font) = placeholder_font() {
        let scale = PxScale::from(18.0);
        draw_text_mut(
            canvas,
            PLACEHOLDER_TEXT,
            (x + TILE_SIZE / 2 - 32) as i32,
            (y + TILE_SIZE / 2 - 9) as i32,
            scale,
            font,
            "No Data",
        );
    }
}

/// Label font for placeholder tiles, loaded once from the usual system
/// locations. Rendering degrades to the bare grid when no font is present.
fn placeholder_font() -> Option<&'static FontVec> {
    static FONT: OnceLock<Option<FontVec>> = OnceLock::new();
    FONT.get_or_init(|| {
        const CANDIDATES: &[&str] = &[
            "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
            "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
            "/usr/share/fonts/truetype/noto/NotoSans-Bold.ttf",
        ];
        for path in CANDIDATES {
            if let Ok(bytes) = std::fs::read(path) {
                match FontVec::try_from_vec(bytes) {
                    Ok(font) => return Some(font),
                    Err(err) => warn!(%path, error = %err, "unusable placeholder font"),
                }
            }
        }
        None
    })
    .as_ref()
}
