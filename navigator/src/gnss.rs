use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::telemetry::TelemetryCore;

/// One GNSS position solution. `fix_quality > 0` means the coordinates are
/// usable.
#[derive(Debug, Clone, Copy)]
pub struct Fix {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub satellites: u32,
    pub fix_quality: u8,
}

impl Default for Fix {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            speed_kmh: 0.0,
            heading_deg: 0.0,
            satellites: 0,
            fix_quality: 0,
        }
    }
}

impl Fix {
    pub fn has_fix(&self) -> bool {
        self.fix_quality > 0
    }
}

const KNOTS_TO_KMH: f64 = 1.852;

/// Apply one NMEA sentence to the running fix. Returns true when the
/// sentence was a position report (GGA), i.e. the fix is worth publishing.
///
/// Field rules: empty fields keep the previous value, except `fix_quality`
/// which every GGA restates. Unparsable numbers are dropped silently.
pub(crate) fn apply_sentence(fix: &mut Fix, line: &str) -> bool {
    let Some(body) = line.strip_prefix('$') else {
        return false;
    };
    let body = body.split('*').next().unwrap_or(body);
    let parts: Vec<&str> = body.split(',').collect();

    // Any GNSS talker is fine: GP, GN, GL, ... but only those.
    if parts[0].len() != 5 || !parts[0].starts_with('G') || !parts[0].is_ascii() {
        return false;
    }

    match &parts[0][2..] {
        "GGA" if parts.len() >= 10 => {
            if let Some(lat) = parse_coordinate(parts.get(2), parts.get(3), 2) {
                fix.latitude = lat;
            }
            if let Some(lon) = parse_coordinate(parts.get(4), parts.get(5), 3) {
                fix.longitude = lon;
            }
            fix.fix_quality = parts
                .get(6)
                .and_then(|v| v.parse::<u8>().ok())
                .unwrap_or(0);
            if let Some(sats) = parts.get(7).and_then(|v| v.parse::<u32>().ok()) {
                fix.satellites = sats;
            }
            if let Some(alt) = parts.get(9).and_then(|v| v.parse::<f64>().ok()) {
                fix.altitude = alt;
            }
            fix.timestamp = Utc::now();
            true
        }
        "RMC" if parts.len() >= 9 => {
            if let Some(knots) = parts.get(7).and_then(|v| v.parse::<f64>().ok()) {
                fix.speed_kmh = knots * KNOTS_TO_KMH;
            }
            if let Some(course) = parts.get(8).and_then(|v| v.parse::<f64>().ok()) {
                fix.heading_deg = course;
            }
            false
        }
        _ => false,
    }
}

/// Parse an NMEA ddmm.mmmm / dddmm.mmmm coordinate with its hemisphere.
fn parse_coordinate(value: Option<&&str>, hemisphere: Option<&&str>, deg_digits: usize) -> Option<f64> {
    let value = value?;
    if !value.is_ascii() || value.len() <= deg_digits {
        return None;
    }
    let degrees: f64 = value[..deg_digits].parse().ok()?;
    let minutes: f64 = value[deg_digits..].parse().ok()?;
    let mut coordinate = degrees + minutes / 60.0;
    if matches!(*hemisphere?, "S" | "W") {
        coordinate = -coordinate;
    }
    Some(coordinate)
}

/// Owns the GNSS serial link and feeds parsed fixes into the telemetry core.
/// The read loop blocks on the port, so it runs on the blocking pool.
pub struct GnssReader {
    running: Arc<AtomicBool>,
}

impl GnssReader {
    pub fn start(
        port_path: &str,
        baud: u32,
        telemetry: Arc<TelemetryCore>,
    ) -> anyhow::Result<Self> {
        let port = serialport::new(port_path, baud)
            .timeout(Duration::from_secs(1))
            .open()
            .with_context(|| format!("failed to open GNSS serial port {port_path}"))?;
        info!(port = port_path, baud, "GNSS receiver online");

        let running = Arc::new(AtomicBool::new(true));
        let loop_running = running.clone();
        tokio::task::spawn_blocking(move || {
            read_loop(port, telemetry, loop_running);
        });

        Ok(Self { running })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn read_loop(
    port: Box<dyn serialport::SerialPort>,
    telemetry: Arc<TelemetryCore>,
    running: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(port);
    let mut fix = Fix::default();
    let mut buf = Vec::with_capacity(128);

    while running.load(Ordering::Relaxed) {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                // EOF from the port; back off instead of spinning.
                std::thread::sleep(Duration::from_secs(1));
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.starts_with('$') {
                    continue;
                }
                if apply_sentence(&mut fix, line) {
                    telemetry.publish_fix(fix);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(err) => {
                warn!(error = %err, "GNSS read error");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
    debug!("GNSS read loop stopped");
}
