use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::compass::CompassSample;
use crate::gnss::Fix;

/// A compass sample older than this loses to the GNSS course.
const COMPASS_FRESHNESS: Duration = Duration::from_secs(5);

const SPEED_CHANGE_THRESHOLD_KMH: f64 = 2.0;
const HEADING_CHANGE_THRESHOLD_DEG: f64 = 15.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    SignificantChange,
    Periodic,
    TripStart,
    TripStop,
}

#[derive(Debug, Clone, Copy)]
pub struct LogbookTrigger {
    pub fix: Fix,
    pub reason: TriggerReason,
}

/// Smallest rotation between two headings, always in [0, 180].
pub(crate) fn angular_diff(h1: f64, h2: f64) -> f64 {
    let d = (h1 - h2).abs() % 360.0;
    d.min(360.0 - d)
}

/// Great-circle distance in meters.
pub(crate) fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * a.sqrt().atan2((1.0 - a).sqrt()) * EARTH_RADIUS_M
}

/// Initial bearing from point 1 to point 2, degrees in [0, 360).
pub(crate) fn initial_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_lambda = (lon2 - lon1).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

#[derive(Debug, Clone, Copy)]
struct PrevPosition {
    lat: f64,
    lon: f64,
    at: Instant,
}

/// Owns the latest fix and compass sample, derives speed/bearing when the
/// receiver does not report them, and decides when the logbook gets a new
/// entry. Everything else reads copies through the accessors.
pub struct TelemetryCore {
    fix: Mutex<Fix>,
    compass: Mutex<Option<CompassSample>>,
    prev_position: Mutex<Option<PrevPosition>>,
    prev_speed: Mutex<f64>,
    prev_heading: Mutex<f64>,
    last_entry_at: Mutex<Option<Instant>>,
    periodic_interval: Duration,
}

impl TelemetryCore {
    pub fn new(periodic_interval: Duration) -> Self {
        Self {
            fix: Mutex::new(Fix::default()),
            compass: Mutex::new(None),
            prev_position: Mutex::new(None),
            prev_speed: Mutex::new(0.0),
            prev_heading: Mutex::new(0.0),
            last_entry_at: Mutex::new(None),
            periodic_interval,
        }
    }

    /// Called by the GNSS reader for every position report. Fills in ground
    /// speed and course from positional deltas when the sentence stream did
    /// not provide them.
    pub fn publish_fix(&self, mut fix: Fix) {
        if fix.has_fix() {
            let mut prev = self.prev_position.lock().unwrap();
            if let Some(p) = *prev {
                let dt = p.at.elapsed().as_secs_f64();
                if dt > 0.0 {
                    let meters = haversine_m(p.lat, p.lon, fix.latitude, fix.longitude);
                    if fix.speed_kmh == 0.0 {
                        fix.speed_kmh = meters / dt * 3.6;
                    }
                    if fix.heading_deg == 0.0 && meters > 1.0 {
                        fix.heading_deg =
                            initial_bearing(p.lat, p.lon, fix.latitude, fix.longitude);
                    }
                }
            }
            *prev = Some(PrevPosition {
                lat: fix.latitude,
                lon: fix.longitude,
                at: Instant::now(),
            });
        }

        *self.fix.lock().unwrap() = fix;
        trace!(lat = fix.latitude, lon = fix.longitude, quality = fix.fix_quality, "fix published");
    }

    pub fn publish_compass(&self, sample: CompassSample) {
        trace!(
            heading = sample.heading_deg,
            tilt = sample.tilt_compensated,
            accel = ?sample.accel,
            mag = ?sample.mag,
            "compass published"
        );
        *self.compass.lock().unwrap() = Some(sample);
    }

    pub fn latest_fix(&self) -> Fix {
        *self.fix.lock().unwrap()
    }

    pub fn latest_compass(&self) -> Option<CompassSample> {
        *self.compass.lock().unwrap()
    }

    /// Compass heading while the sample is fresh, GNSS course otherwise.
    pub fn current_heading(&self) -> Option<f64> {
        if let Some(sample) = self.latest_compass() {
            if sample.taken_at.elapsed() <= COMPASS_FRESHNESS {
                return Some(sample.heading_deg);
            }
        }
        let fix = self.latest_fix();
        (fix.has_fix() && fix.heading_deg > 0.0).then_some(fix.heading_deg)
    }

    /// Decide whether `fix` warrants a logbook entry this tick.
    ///
    /// A jump in speed or heading always fires; the periodic timer fires only
    /// while a trip is active. Firing updates the change baselines.
    pub fn on_new_fix(&self, fix: &Fix, trip_active: bool) -> Option<LogbookTrigger> {
        if !fix.has_fix() {
            return None;
        }

        let mut prev_speed = self.prev_speed.lock().unwrap();
        let mut prev_heading = self.prev_heading.lock().unwrap();

        let speed_changed = (fix.speed_kmh - *prev_speed).abs() >= SPEED_CHANGE_THRESHOLD_KMH;
        let heading_changed =
            angular_diff(fix.heading_deg, *prev_heading) >= HEADING_CHANGE_THRESHOLD_DEG;

        if speed_changed || heading_changed {
            *prev_speed = fix.speed_kmh;
            *prev_heading = fix.heading_deg;
            *self.last_entry_at.lock().unwrap() = Some(Instant::now());
            return Some(LogbookTrigger {
                fix: *fix,
                reason: TriggerReason::SignificantChange,
            });
        }

        if trip_active {
            let mut last = self.last_entry_at.lock().unwrap();
            let due = last.is_none_or(|at| at.elapsed() >= self.periodic_interval);
            if due {
                *last = Some(Instant::now());
                return Some(LogbookTrigger {
                    fix: *fix,
                    reason: TriggerReason::Periodic,
                });
            }
        }

        None
    }

    /// Manual trigger for trip start/stop bookkeeping entries.
    pub fn trip_event(&self, reason: TriggerReason) -> Option<LogbookTrigger> {
        let fix = self.latest_fix();
        if !fix.has_fix() {
            return None;
        }
        *self.last_entry_at.lock().unwrap() = Some(Instant::now());
        Some(LogbookTrigger { fix, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(speed: f64, heading: f64) -> Fix {
        Fix {
            latitude: 52.0,
            longitude: 4.0,
            speed_kmh: speed,
            heading_deg: heading,
            fix_quality: 1,
            satellites: 7,
            ..Fix::default()
        }
    }

    fn core_with_baseline(speed: f64, heading: f64) -> TelemetryCore {
        let core = TelemetryCore::new(Duration::from_secs(60));
        // First observation always differs from the zero baseline; let it
        // fire to establish the requested baseline.
        core.on_new_fix(&fix(speed, heading), false);
        core
    }

    #[test]
    fn speed_jump_triggers() {
        let core = core_with_baseline(5.0, 100.0);
        let trigger = core.on_new_fix(&fix(7.1, 105.0), false).unwrap();
        assert_eq!(trigger.reason, TriggerReason::SignificantChange);
    }

    #[test]
    fn small_drift_does_not_trigger() {
        let core = core_with_baseline(5.0, 100.0);
        assert!(core.on_new_fix(&fix(6.0, 114.0), false).is_none());
    }

    #[test]
    fn heading_jump_triggers() {
        let core = core_with_baseline(5.0, 100.0);
        let trigger = core.on_new_fix(&fix(6.0, 116.0), false).unwrap();
        assert_eq!(trigger.reason, TriggerReason::SignificantChange);
    }

    #[test]
    fn baselines_move_when_fired() {
        let core = core_with_baseline(5.0, 100.0);
        core.on_new_fix(&fix(7.1, 105.0), false).unwrap();
        // Relative to the new baseline (7.1, 105) this is a small drift.
        assert!(core.on_new_fix(&fix(7.5, 110.0), false).is_none());
    }

    #[test]
    fn heading_wrap_measures_short_way_around() {
        assert!((angular_diff(350.0, 10.0) - 20.0).abs() < 1e-12);
        assert!((angular_diff(0.0, 180.0) - 180.0).abs() < 1e-12);
        for (a, b) in [(0.0, 359.0), (90.0, 271.0), (15.0, 345.0)] {
            assert!(angular_diff(a, b) <= 180.0);
        }

        let core = core_with_baseline(5.0, 355.0);
        // 355 -> 5 is only 10 degrees.
        assert!(core.on_new_fix(&fix(5.0, 5.0), false).is_none());
    }

    #[test]
    fn no_fix_never_triggers() {
        let core = TelemetryCore::new(Duration::from_secs(60));
        let mut dead = fix(50.0, 200.0);
        dead.fix_quality = 0;
        assert!(core.on_new_fix(&dead, true).is_none());
    }

    #[test]
    fn periodic_fires_only_with_active_trip() {
        let core = TelemetryCore::new(Duration::from_millis(0));
        core.on_new_fix(&fix(5.0, 100.0), false);

        // Interval elapsed, but no active trip: nothing.
        assert!(core.on_new_fix(&fix(5.0, 100.0), false).is_none());

        let trigger = core.on_new_fix(&fix(5.0, 100.0), true).unwrap();
        assert_eq!(trigger.reason, TriggerReason::Periodic);
    }

    #[test]
    fn compass_preferred_over_gnss_when_fresh() {
        let core = TelemetryCore::new(Duration::from_secs(60));
        core.publish_fix(fix(5.0, 123.0));
        assert_eq!(core.current_heading(), Some(123.0));

        core.publish_compass(CompassSample {
            heading_deg: 200.0,
            accel: [0.0, 0.0, 1.0],
            mag: [0.3, 0.0, 0.0],
            tilt_compensated: true,
            taken_at: Instant::now(),
        });
        assert_eq!(core.current_heading(), Some(200.0));
    }

    #[test]
    fn stale_compass_loses_to_gnss() {
        let core = TelemetryCore::new(Duration::from_secs(60));
        core.publish_fix(fix(5.0, 123.0));
        core.publish_compass(CompassSample {
            heading_deg: 200.0,
            accel: [0.0, 0.0, 1.0],
            mag: [0.3, 0.0, 0.0],
            tilt_compensated: true,
            taken_at: Instant::now() - Duration::from_secs(10),
        });
        assert_eq!(core.current_heading(), Some(123.0));
    }

    #[test]
    fn derived_speed_fills_missing_rmc_data() {
        let core = TelemetryCore::new(Duration::from_secs(60));
        let mut first = fix(0.0, 0.0);
        first.latitude = 52.0;
        first.longitude = 4.0;
        core.publish_fix(first);

        // ~111 m north of the first point; dt is tiny so the derived speed
        // must be large and the bearing close to due north.
        let mut second = fix(0.0, 0.0);
        second.latitude = 52.001;
        second.longitude = 4.0;
        core.publish_fix(second);

        let fix = core.latest_fix();
        assert!(fix.speed_kmh > 0.0);
        assert!(fix.heading_deg < 1.0 || fix.heading_deg > 359.0);
    }

    #[test]
    fn haversine_and_bearing_sanity() {
        // Amsterdam to Utrecht, roughly 35 km to the southeast.
        let d = haversine_m(52.3676, 4.9041, 52.0907, 5.1214);
        assert!((30_000.0..40_000.0).contains(&d));

        let b = initial_bearing(52.3676, 4.9041, 52.0907, 5.1214);
        assert!((120.0..160.0).contains(&b));
    }
}
