//! Draws every screen into an 8-bit grayscale framebuffer sized for the
//! panel. Map composites additionally pass through the e-paper enhancement
//! before overlays land on top.

use ab_glyph::{FontVec, PxScale};
use chrono::Local;
use image::{GrayImage, Luma};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut, draw_hollow_rect_mut,
    draw_line_segment_mut, draw_polygon_mut, draw_text_mut, text_size,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use tracing::warn;

use elcano_mbtiles::{CompositeMetadata, RegionSummary, TILE_SIZE, lonlat_to_tile};

use crate::gnss::Fix;
use crate::menu::MenuView;
use crate::store::Waypoint;
use crate::wifi::WifiStatus;

const BLACK: Luma<u8> = Luma([0]);
const WHITE: Luma<u8> = Luma([255]);
const GREY: Luma<u8> = Luma([128]);
const HIGHLIGHT: Luma<u8> = Luma([200]);

const STATUS_BAR_HEIGHT: u32 = 30;

const FONT_SMALL: f32 = 12.0;
const FONT_MEDIUM: f32 = 16.0;
const FONT_LARGE: f32 = 20.0;
const FONT_TITLE: f32 = 24.0;
const FONT_SPLASH: f32 = 72.0;

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/usr/share/fonts/truetype/noto/NotoSans-Bold.ttf",
];

/// E-paper enhancement for map composites: invert, then hard-threshold the
/// inverted value at 100. This exact policy is what field units shipped
/// with; both halves of it are load-bearing for how charts look on the
/// panel.
pub(crate) fn enhance_for_epaper(img: &GrayImage) -> GrayImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        let inverted = 255 - pixel.0[0];
        pixel.0[0] = if inverted > 100 { 255 } else { 0 };
    }
    out
}

/// Project a coordinate onto screen pixels for a map centered on
/// `(center_lat, center_lon)` at `zoom`.
pub(crate) fn geo_to_screen(
    lat: f64,
    lon: f64,
    center_lat: f64,
    center_lon: f64,
    zoom: u8,
    width: u32,
    height: u32,
) -> (i64, i64) {
    let (cx, cy) = lonlat_to_tile(center_lat, center_lon, zoom);
    let (px, py) = lonlat_to_tile(lat, lon, zoom);
    let x = f64::from(width) / 2.0 + (px - cx) * f64::from(TILE_SIZE);
    let y = f64::from(height) / 2.0 + (py - cy) * f64::from(TILE_SIZE);
    (x.round() as i64, y.round() as i64)
}

/// Everything the map screen needs beyond the composite itself.
pub struct MapContext<'a> {
    pub lat: f64,
    pub lon: f64,
    pub zoom: u8,
    pub heading: Option<f64>,
    pub wifi: &'a WifiStatus,
    pub fix: &'a Fix,
    pub route: &'a [Waypoint],
    pub sync_line: &'a str,
}

pub struct Renderer {
    width: u32,
    height: u32,
    font: Option<FontVec>,
}

impl Renderer {
    pub fn new(width: u32, height: u32) -> Self {
        let font = FONT_CANDIDATES.iter().find_map(|path| {
            let bytes = std::fs::read(path).ok()?;
            FontVec::try_from_vec(bytes).ok()
        });
        if font.is_none() {
            warn!("no usable system font, screens will render without text");
        }
        Self {
            width,
            height,
            font,
        }
    }

    fn blank(&self) -> GrayImage {
        GrayImage::from_pixel(self.width, self.height, WHITE)
    }

    fn text(&self, img: &mut GrayImage, x: i32, y: i32, size: f32, color: Luma<u8>, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(img, color, x, y, PxScale::from(size), font, text);
        }
    }

    fn text_width(&self, size: f32, text: &str) -> u32 {
        match &self.font {
            Some(font) => text_size(PxScale::from(size), font, text).0,
            None => 0,
        }
    }

    fn text_centered(&self, img: &mut GrayImage, y: i32, size: f32, color: Luma<u8>, text: &str) {
        let x = (self.width.saturating_sub(self.text_width(size, text))) as i32 / 2;
        self.text(img, x, y, size, color, text);
    }

    // ==================================================================
    //  Screens
    // ==================================================================

    /// Boot splash: brand title, subtitle, decorative corner frame.
    pub fn splash(&self) -> GrayImage {
        let mut img = self.blank();

        let title = "Elcano One";
        let title_w = self.text_width(FONT_SPLASH, title).max(200);
        let title_x = (self.width - title_w.min(self.width)) as i32 / 2;
        let title_y = self.height as i32 / 2 - 80;
        self.text(&mut img, title_x, title_y, FONT_SPLASH, BLACK, title);
        self.text_centered(
            &mut img,
            title_y + 95,
            FONT_TITLE,
            BLACK,
            "GPS Navigation System",
        );

        // Frame lines above and below, with short corner returns.
        let line_x0 = (title_x - 50).max(10) as f32;
        let line_x1 = (title_x + title_w.min(self.width) as i32 + 50)
            .min(self.width as i32 - 10) as f32;
        let line_y0 = (title_y - 20) as f32;
        let line_y1 = (title_y + 90) as f32;
        let corner = 20.0;
        for (y, dy) in [(line_y0, corner), (line_y1, -corner)] {
            draw_line_segment_mut(&mut img, (line_x0, y), (line_x1, y), BLACK);
            draw_line_segment_mut(&mut img, (line_x0, y), (line_x0, y + dy), BLACK);
            draw_line_segment_mut(&mut img, (line_x1, y), (line_x1, y + dy), BLACK);
        }

        self.text_centered(
            &mut img,
            self.height as i32 - 60,
            FONT_TITLE,
            BLACK,
            "Initializing...",
        );
        img
    }

    /// Shown until a valid sync key appears in the settings file.
    pub fn sync_setup(&self) -> GrayImage {
        let mut img = self.blank();

        self.text_centered(&mut img, 50, FONT_TITLE, BLACK, "Device Configuration Required");

        let messages = [
            "This device needs to be configured with a",
            "synchronization key to connect to ElcanoNav.",
            "",
            "To configure this device:",
            "",
            "1. Connect to WiFi network: 'elcano_nav'",
            "",
            "2. Open web browser and go to:",
            "   http://192.168.4.1",
            "",
            "3. Configure WiFi settings and device key",
            "",
            "4. The device will restart after configuration",
        ];
        let mut y = 120;
        for message in messages {
            if !message.is_empty() {
                self.text_centered(&mut img, y, FONT_MEDIUM, BLACK, message);
            }
            y += 25;
        }

        self.text_centered(
            &mut img,
            self.height as i32 - 40,
            FONT_SMALL,
            BLACK,
            "Press any button to retry sync key detection",
        );

        for inset in [20, 21] {
            draw_hollow_rect_mut(
                &mut img,
                Rect::at(inset, inset)
                    .of_size(self.width - 2 * inset as u32, self.height - 2 * inset as u32),
                BLACK,
            );
        }
        img
    }

    /// Card shown while the receiver has no usable fix.
    pub fn waiting(&self, wifi: &WifiStatus, fix: &Fix) -> GrayImage {
        let mut img = self.blank();
        self.draw_status_bar(&mut img, wifi, fix);

        let card_w = 400u32;
        let card_h = 200u32;
        let card_x = (self.width - card_w) as i32 / 2;
        let card_y = (self.height - card_h) as i32 / 2;
        self.draw_rounded_rect(&mut img, card_x, card_y, card_w, card_h, 15);

        self.text_centered(&mut img, card_y + 30, FONT_LARGE, BLACK, "Waiting for GPS Signal");
        self.text_centered(
            &mut img,
            card_y + 65,
            FONT_SMALL,
            BLACK,
            &format!(
                "Satellites: {}   Fix quality: {}",
                fix.satellites, fix.fix_quality
            ),
        );

        let instructions = [
            "\u{2022} Ensure GPS antenna has clear sky view",
            "\u{2022} Initial GPS fix may take 1-5 minutes",
            "\u{2022} Check GPS module connections",
        ];
        let mut y = card_y + 100;
        for line in instructions {
            self.text_centered(&mut img, y, FONT_SMALL, BLACK, line);
            y += 25;
        }
        img
    }

    /// Shown when the selected archive has nothing at all for the position.
    pub fn no_map(
        &self,
        lat: f64,
        lon: f64,
        regions: &[RegionSummary],
        wifi: &WifiStatus,
        fix: &Fix,
    ) -> GrayImage {
        let mut img = self.blank();
        self.draw_status_bar(&mut img, wifi, fix);

        self.text_centered(&mut img, 140, FONT_LARGE, BLACK, "No Map Available");
        self.text_centered(
            &mut img,
            190,
            FONT_MEDIUM,
            BLACK,
            &format!("Position: {lat:.4}, {lon:.4}"),
        );

        if regions.is_empty() {
            self.text_centered(&mut img, 240, FONT_MEDIUM, BLACK, "No map files available");
        } else {
            self.text_centered(&mut img, 240, FONT_MEDIUM, BLACK, "Available Regions:");
            let mut y = 270;
            for region in regions.iter().take(5) {
                self.text_centered(
                    &mut img,
                    y,
                    FONT_SMALL,
                    BLACK,
                    &format!("\u{2022} {}", region.name),
                );
                y += 25;
            }
        }
        img
    }

    /// Map screen: enhanced composite plus route, crosshair, compass rose,
    /// info panel, status bar.
    pub fn map(&self, composite_png: &[u8], meta: &CompositeMetadata, ctx: &MapContext) -> GrayImage {
        let mut img = match image::load_from_memory(composite_png) {
            Ok(base) => {
                let grey = base.to_luma8();
                let mut enhanced = enhance_for_epaper(&grey);
                if enhanced.dimensions() != (self.width, self.height) {
                    enhanced = image::imageops::resize(
                        &enhanced,
                        self.width,
                        self.height,
                        image::imageops::FilterType::Triangle,
                    );
                }
                enhanced
            }
            Err(err) => {
                warn!(error = %err, "composite decode failed, rendering blank chart");
                self.blank()
            }
        };

        self.draw_status_bar(&mut img, ctx.wifi, ctx.fix);
        self.draw_route(&mut img, ctx);
        self.draw_crosshair(&mut img);
        self.draw_compass_rose(&mut img, ctx.heading);
        self.draw_info_panel(&mut img, ctx, meta);
        img
    }

    /// Menu screen: titled panel, vertical list, highlight, hint footer.
    pub fn menu(&self, view: &MenuView) -> GrayImage {
        let mut img = self.blank();

        self.text_centered(&mut img, 30, FONT_TITLE, BLACK, &view.title);
        draw_line_segment_mut(
            &mut img,
            (50.0, 70.0),
            ((self.width - 50) as f32, 70.0),
            BLACK,
        );

        let y_start = 100i32;
        let item_height = 40i32;
        for (i, item) in view.items.iter().enumerate() {
            let y = y_start + i as i32 * item_height;
            if i == view.selected {
                draw_filled_rect_mut(
                    &mut img,
                    Rect::at(50, y - 5).of_size(self.width - 100, 35),
                    HIGHLIGHT,
                );
                draw_hollow_rect_mut(
                    &mut img,
                    Rect::at(50, y - 5).of_size(self.width - 100, 35),
                    BLACK,
                );
            }
            let color = if item.enabled { BLACK } else { GREY };
            self.text(&mut img, 70, y, FONT_MEDIUM, color, &item.label);
            if item.submenu {
                self.text(
                    &mut img,
                    self.width as i32 - 100,
                    y,
                    FONT_MEDIUM,
                    color,
                    "\u{25ba}",
                );
            }
        }

        self.text_centered(
            &mut img,
            self.height as i32 - 40,
            FONT_SMALL,
            GREY,
            "\u{2191}\u{2193}: Navigate   Center: Select   \u{2190}: Back",
        );
        img
    }

    // ==================================================================
    //  Shared elements
    // ==================================================================

    fn draw_status_bar(&self, img: &mut GrayImage, wifi: &WifiStatus, fix: &Fix) {
        draw_filled_rect_mut(
            img,
            Rect::at(0, 0).of_size(self.width, STATUS_BAR_HEIGHT),
            WHITE,
        );
        draw_line_segment_mut(
            img,
            (0.0, STATUS_BAR_HEIGHT as f32),
            (self.width as f32, STATUS_BAR_HEIGHT as f32),
            BLACK,
        );

        let gps_text = if fix.has_fix() {
            format!("GPS: \u{2713} {} sats", fix.satellites)
        } else {
            "GPS: \u{2717} No fix".to_string()
        };
        self.text(img, 10, 5, FONT_SMALL, BLACK, &gps_text);

        let wifi_text = match (&wifi.connected, &wifi.ssid) {
            (true, Some(ssid)) => format!("WiFi: \u{2713} {ssid}"),
            (true, None) => "WiFi: \u{2713} Connected".to_string(),
            (false, _) => "WiFi: \u{2717} Disconnected".to_string(),
        };
        self.text_centered(img, 5, FONT_SMALL, BLACK, &wifi_text);

        let time_text = Local::now().format("%H:%M").to_string();
        let time_x = self.width as i32 - self.text_width(FONT_SMALL, &time_text) as i32 - 10;
        self.text(img, time_x, 5, FONT_SMALL, BLACK, &time_text);
    }

    fn draw_crosshair(&self, img: &mut GrayImage) {
        let cx = self.width as f32 / 2.0;
        let cy = self.height as f32 / 2.0;
        for offset in [-1.0, 0.0, 1.0] {
            draw_line_segment_mut(img, (cx - 15.0, cy + offset), (cx + 15.0, cy + offset), BLACK);
            draw_line_segment_mut(img, (cx + offset, cy - 15.0), (cx + offset, cy + 15.0), BLACK);
        }
        draw_filled_circle_mut(img, (cx as i32, cy as i32), 2, BLACK);
    }

    fn draw_compass_rose(&self, img: &mut GrayImage, heading: Option<f64>) {
        let cx = 60i32;
        let cy = self.height as i32 - 60;
        let radius = 40i32;

        draw_filled_circle_mut(img, (cx, cy), radius, WHITE);
        draw_hollow_circle_mut(img, (cx, cy), radius, BLACK);
        draw_hollow_circle_mut(img, (cx, cy), radius - 1, BLACK);

        for (i, label) in ["N", "E", "S", "W"].iter().enumerate() {
            let angle = (i as f64 * 90.0).to_radians();
            let text_x = cx + ((radius - 15) as f64 * angle.sin()) as i32;
            let text_y = cy - ((radius - 15) as f64 * angle.cos()) as i32;
            let w = self.text_width(FONT_SMALL, label) as i32;
            self.text(img, text_x - w / 2, text_y - 7, FONT_SMALL, BLACK, label);
        }

        // The arrow only appears when some heading source is alive.
        let Some(heading) = heading else {
            return;
        };
        let angle = heading.to_radians();
        let tip_x = cx + ((radius - 10) as f64 * angle.sin()) as i32;
        let tip_y = cy - ((radius - 10) as f64 * angle.cos()) as i32;
        for offset in [-1.0, 0.0, 1.0] {
            draw_line_segment_mut(
                img,
                (cx as f32 + offset, cy as f32),
                (tip_x as f32 + offset, tip_y as f32),
                BLACK,
            );
        }

        let head_x = cx as f64 + f64::from(radius - 5) * angle.sin();
        let head_y = cy as f64 - f64::from(radius - 5) * angle.cos();
        let size = 8.0;
        let spread = 150f64.to_radians();
        let points: Vec<Point<i32>> = [angle, angle + spread, angle - spread]
            .iter()
            .map(|a| {
                Point::new(
                    (head_x + size * a.sin()) as i32,
                    (head_y - size * a.cos()) as i32,
                )
            })
            .collect();
        if points[0] != points[1] && points[1] != points[2] && points[0] != points[2] {
            draw_polygon_mut(img, &points, BLACK);
        }
    }

    fn draw_info_panel(&self, img: &mut GrayImage, ctx: &MapContext, meta: &CompositeMetadata) {
        let panel_w = 280u32;
        let panel_h = 120u32;
        let panel_x = self.width as i32 - panel_w as i32 - 10;
        let panel_y = self.height as i32 - panel_h as i32 - 10;
        self.draw_rounded_rect(img, panel_x, panel_y, panel_w, panel_h, 10);

        let mut region = meta.archive_name.clone();
        if region.len() > 22 {
            region.truncate(22);
            region.push_str("...");
        }
        let zoom_line = if meta.zoom_adjusted {
            format!("Zoom: {} (req {}) | {region}", meta.actual_zoom, meta.requested_zoom)
        } else {
            format!("Zoom: {} | {region}", ctx.zoom)
        };

        let total = meta.tiles_found + meta.tiles_missing;
        let lines = [
            format!("Lat: {:.5}", ctx.lat),
            format!("Lon: {:.5}", ctx.lon),
            zoom_line,
            format!(
                "Tiles: {}/{} ({:.0}%)",
                meta.tiles_found,
                total,
                meta.availability_ratio * 100.0
            ),
            format!("Scale: ~{:.0} m/px", meters_per_pixel(ctx.lat, meta.actual_zoom)),
            ctx.sync_line.to_string(),
        ];

        let mut y = panel_y + 10;
        for line in lines {
            self.text(img, panel_x + 10, y, FONT_SMALL, BLACK, &line);
            y += 17;
        }
    }

    fn draw_route(&self, img: &mut GrayImage, ctx: &MapContext) {
        if ctx.route.len() < 2 {
            return;
        }

        let project = |wp: &Waypoint| {
            geo_to_screen(
                wp.latitude,
                wp.longitude,
                ctx.lat,
                ctx.lon,
                ctx.zoom,
                self.width,
                self.height,
            )
        };
        let on_screen = |(x, y): (i64, i64)| {
            x >= 0 && y >= 0 && x < i64::from(self.width) && y < i64::from(self.height)
        };

        for pair in ctx.route.windows(2) {
            let a = project(&pair[0]);
            let b = project(&pair[1]);
            if !on_screen(a) && !on_screen(b) {
                continue;
            }
            for (dx, dy) in [(0i64, 0i64), (0, 1), (1, 0), (0, -1), (-1, 0)] {
                draw_line_segment_mut(
                    img,
                    ((a.0 + dx) as f32, (a.1 + dy) as f32),
                    ((b.0 + dx) as f32, (b.1 + dy) as f32),
                    BLACK,
                );
            }
        }

        for wp in ctx.route {
            let p = project(wp);
            if on_screen(p) {
                draw_filled_circle_mut(img, (p.0 as i32, p.1 as i32), 3, BLACK);
            }
        }
    }

    fn draw_rounded_rect(&self, img: &mut GrayImage, x: i32, y: i32, w: u32, h: u32, radius: i32) {
        let r = radius;
        let (w_i, h_i) = (w as i32, h as i32);

        draw_filled_rect_mut(img, Rect::at(x + r, y).of_size(w - 2 * r as u32, h), WHITE);
        draw_filled_rect_mut(img, Rect::at(x, y + r).of_size(w, h - 2 * r as u32), WHITE);
        for (cx, cy) in [
            (x + r, y + r),
            (x + w_i - r - 1, y + r),
            (x + r, y + h_i - r - 1),
            (x + w_i - r - 1, y + h_i - r - 1),
        ] {
            draw_filled_circle_mut(img, (cx, cy), r, WHITE);
        }

        // Outline: straight edges plus quarter arcs.
        draw_line_segment_mut(img, ((x + r) as f32, y as f32), ((x + w_i - r) as f32, y as f32), BLACK);
        draw_line_segment_mut(
            img,
            ((x + r) as f32, (y + h_i - 1) as f32),
            ((x + w_i - r) as f32, (y + h_i - 1) as f32),
            BLACK,
        );
        draw_line_segment_mut(img, (x as f32, (y + r) as f32), (x as f32, (y + h_i - r) as f32), BLACK);
        draw_line_segment_mut(
            img,
            ((x + w_i - 1) as f32, (y + r) as f32),
            ((x + w_i - 1) as f32, (y + h_i - r) as f32),
            BLACK,
        );
        for ((cx, cy), (a0, a1)) in [
            ((x + r, y + r), (180.0, 270.0)),
            ((x + w_i - r - 1, y + r), (270.0, 360.0)),
            ((x + w_i - r - 1, y + h_i - r - 1), (0.0, 90.0)),
            ((x + r, y + h_i - r - 1), (90.0, 180.0)),
        ] {
            draw_quarter_arc(img, cx, cy, r, a0, a1);
        }
    }
}

/// Ground resolution at the equator-scaled latitude, meters per pixel.
fn meters_per_pixel(lat: f64, zoom: u8) -> f64 {
    156_543.034 * lat.to_radians().cos() / 2f64.powi(i32::from(zoom))
}

/// Plot a circular arc between two angles (degrees, screen convention:
/// 0 = +x, growing clockwise).
fn draw_quarter_arc(img: &mut GrayImage, cx: i32, cy: i32, radius: i32, a0: f64, a1: f64) {
    let steps = (radius * 3).max(8);
    for i in 0..=steps {
        let angle = (a0 + (a1 - a0) * f64::from(i) / f64::from(steps)).to_radians();
        let x = cx + (f64::from(radius) * angle.cos()).round() as i32;
        let y = cy + (f64::from(radius) * angle.sin()).round() as i32;
        if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
            img.put_pixel(x as u32, y as u32, BLACK);
        }
    }
}
