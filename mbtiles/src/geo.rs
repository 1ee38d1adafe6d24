//! Web Mercator tile addressing (the "slippy map" scheme).

use std::f64::consts::PI;

/// Edge length of a raster tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Latitudes beyond this are not representable in Web Mercator.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_8;

/// Clamp a latitude to the usable Web Mercator range.
pub fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT)
}

/// Wrap a longitude into [-180, 180).
pub fn wrap_lon(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == 180.0 { -180.0 } else { wrapped }
}

/// Convert lat/lon (degrees) to fractional XYZ tile coordinates at `zoom`.
pub fn lonlat_to_tile(lat_deg: f64, lon_deg: f64, zoom: u8) -> (f64, f64) {
    let lat_rad = clamp_lat(lat_deg).to_radians();
    let n = 2f64.powi(i32::from(zoom));
    let x = (wrap_lon(lon_deg) + 180.0) / 360.0 * n;
    let y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n;
    (x, y)
}

/// Convert XYZ tile coordinates back to the lon/lat (degrees) of the tile's
/// north-west corner.
pub fn tile_to_lonlat(x: f64, y: f64, zoom: u8) -> (f64, f64) {
    let n = 2f64.powi(i32::from(zoom));
    let lon = x / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    (lon, lat)
}

/// Convert an XYZ row index to the TMS row stored in an archive (and back;
/// the flip is its own inverse).
pub fn tms_flip(y: u32, zoom: u8) -> u32 {
    (1u32 << zoom) - 1 - y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tms_flip_is_an_involution() {
        for zoom in 0..=24u8 {
            let max = (1u64 << zoom) - 1;
            for y in [0, max / 2, max] {
                let y = y as u32;
                assert_eq!(tms_flip(tms_flip(y, zoom), zoom), y, "zoom {zoom}, y {y}");
            }
        }
    }

    #[test]
    fn projection_is_monotone() {
        let zoom = 12;
        let mut prev_x = f64::NEG_INFINITY;
        for lon in [-179.0, -90.0, -0.5, 0.0, 0.5, 90.0, 179.0] {
            let (x, _) = lonlat_to_tile(0.0, lon, zoom);
            assert!(x >= prev_x, "x must not decrease with lon");
            prev_x = x;
        }

        let mut prev_y = f64::INFINITY;
        for lat in [-84.0, -45.0, 0.0, 45.0, 84.0] {
            let (_, y) = lonlat_to_tile(lat, 0.0, zoom);
            assert!(y <= prev_y, "y must not increase with lat");
            prev_y = y;
        }
    }

    #[test]
    fn projection_round_trips_through_tile_corner() {
        let (x, y) = lonlat_to_tile(52.3676, 4.9041, 14);
        let (lon, lat) = tile_to_lonlat(x, y, 14);
        assert!((lon - 4.9041).abs() < 1e-9);
        assert!((lat - 52.3676).abs() < 1e-9);
    }

    #[test]
    fn polar_latitudes_clamp_instead_of_diverging() {
        let (_, y) = lonlat_to_tile(89.9, 0.0, 10);
        assert!(y >= 0.0);
        let (_, y) = lonlat_to_tile(-89.9, 0.0, 10);
        assert!(y <= 1024.0);
    }

    #[test]
    fn longitudes_wrap() {
        assert!((wrap_lon(190.0) - -170.0).abs() < 1e-12);
        assert!((wrap_lon(-190.0) - 170.0).abs() < 1e-12);
        assert!((wrap_lon(360.0) - 0.0).abs() < 1e-12);
    }
}
