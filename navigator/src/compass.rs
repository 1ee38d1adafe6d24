//! LSM303DLHC (GY-511) accelerometer + magnetometer driver and the
//! tilt-compensated heading it produces. Hardware access sits behind the
//! `raspberry_pi` feature; without it the sensor reports unavailable and the
//! system falls back to GNSS heading.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::telemetry::TelemetryCore;

pub const ACCEL_ADDRESS: u16 = 0x19;
pub const MAG_ADDRESS: u16 = 0x1E;

// ±2 g full scale.
const ACCEL_LSB_PER_G: f64 = 16384.0;
// ±1.3 gauss gain: x/y and z use different sensitivities.
const MAG_LSB_PER_GAUSS_XY: f64 = 1100.0;
const MAG_LSB_PER_GAUSS_Z: f64 = 980.0;

const SAMPLE_PERIOD: Duration = Duration::from_millis(100);
const HEADING_SMOOTHING: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct CompassSample {
    /// Smoothed heading, degrees in [0, 360).
    pub heading_deg: f64,
    /// Acceleration in g.
    pub accel: [f64; 3],
    /// Magnetic field in gauss, calibration applied.
    pub mag: [f64; 3],
    pub tilt_compensated: bool,
    pub taken_at: Instant,
}

/// Per-axis magnetometer hard/soft-iron correction.
#[derive(Debug, Clone, Copy)]
pub struct MagCalibration {
    pub offset: [f64; 3],
    pub scale: [f64; 3],
}

impl Default for MagCalibration {
    fn default() -> Self {
        Self {
            offset: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

impl MagCalibration {
    pub fn apply(&self, raw: [f64; 3]) -> [f64; 3] {
        [
            (raw[0] - self.offset[0]) * self.scale[0],
            (raw[1] - self.offset[1]) * self.scale[1],
            (raw[2] - self.offset[2]) * self.scale[2],
        ]
    }
}

pub(crate) fn normalize_deg(deg: f64) -> f64 {
    deg.rem_euclid(360.0)
}

/// Heading from accelerometer gravity and the magnetic field vector.
/// Returns the heading and whether tilt compensation was applied; a zero
/// gravity vector degrades to the flat two-axis formula.
pub(crate) fn tilt_compensated_heading(accel: [f64; 3], mag: [f64; 3]) -> (f64, bool) {
    let [ax, ay, az] = accel;
    let [mx, my, mz] = mag;

    let norm = (ax * ax + ay * ay + az * az).sqrt();
    if norm == 0.0 {
        return (normalize_deg(my.atan2(mx).to_degrees()), false);
    }

    let (ax, ay, az) = (ax / norm, ay / norm, az / norm);
    let roll = ay.atan2(az);
    let pitch = (-ax).atan2((ay * ay + az * az).sqrt());

    let mx_comp = mx * pitch.cos() + mz * pitch.sin();
    let my_comp =
        mx * roll.sin() * pitch.sin() + my * roll.cos() - mz * roll.sin() * pitch.cos();

    (normalize_deg(my_comp.atan2(mx_comp).to_degrees()), true)
}

pub(crate) fn accel_raw_to_g(raw: [i16; 3]) -> [f64; 3] {
    [
        f64::from(raw[0]) / ACCEL_LSB_PER_G,
        f64::from(raw[1]) / ACCEL_LSB_PER_G,
        f64::from(raw[2]) / ACCEL_LSB_PER_G,
    ]
}

pub(crate) fn mag_raw_to_gauss(raw: [i16; 3]) -> [f64; 3] {
    [
        f64::from(raw[0]) / MAG_LSB_PER_GAUSS_XY,
        f64::from(raw[1]) / MAG_LSB_PER_GAUSS_XY,
        f64::from(raw[2]) / MAG_LSB_PER_GAUSS_Z,
    ]
}

#[cfg(feature = "raspberry_pi")]
mod bus {
    use super::{ACCEL_ADDRESS, MAG_ADDRESS};
    use rppal::i2c::I2c;

    // Accelerometer registers.
    const ACCEL_CTRL_REG1_A: u8 = 0x20;
    const ACCEL_CTRL_REG4_A: u8 = 0x23;
    const ACCEL_OUT_X_L_A: u8 = 0x28;

    // Magnetometer registers.
    const MAG_CRA_REG_M: u8 = 0x00;
    const MAG_CRB_REG_M: u8 = 0x01;
    const MAG_MR_REG_M: u8 = 0x02;
    const MAG_OUT_X_H_M: u8 = 0x03;

    pub struct Lsm303 {
        i2c: I2c,
    }

    impl Lsm303 {
        pub fn open() -> anyhow::Result<Self> {
            let mut i2c = I2c::new()?;

            // Accelerometer: 50 Hz, all axes, ±2 g.
            i2c.set_slave_address(ACCEL_ADDRESS)?;
            i2c.smbus_write_byte(ACCEL_CTRL_REG1_A, 0x47)?;
            i2c.smbus_write_byte(ACCEL_CTRL_REG4_A, 0x00)?;

            // Magnetometer: 15 Hz, ±1.3 gauss, continuous conversion.
            i2c.set_slave_address(MAG_ADDRESS)?;
            i2c.smbus_write_byte(MAG_CRA_REG_M, 0x10)?;
            i2c.smbus_write_byte(MAG_CRB_REG_M, 0x20)?;
            i2c.smbus_write_byte(MAG_MR_REG_M, 0x00)?;

            std::thread::sleep(std::time::Duration::from_millis(100));
            Ok(Self { i2c })
        }

        pub fn read_accel_raw(&mut self) -> anyhow::Result<[i16; 3]> {
            self.i2c.set_slave_address(ACCEL_ADDRESS)?;
            let mut data = [0u8; 6];
            // 0x80 enables register auto-increment on this part.
            self.i2c.write_read(&[ACCEL_OUT_X_L_A | 0x80], &mut data)?;
            Ok([
                i16::from_le_bytes([data[0], data[1]]),
                i16::from_le_bytes([data[2], data[3]]),
                i16::from_le_bytes([data[4], data[5]]),
            ])
        }

        pub fn read_mag_raw(&mut self) -> anyhow::Result<[i16; 3]> {
            self.i2c.set_slave_address(MAG_ADDRESS)?;
            let mut data = [0u8; 6];
            self.i2c.write_read(&[MAG_OUT_X_H_M], &mut data)?;
            // Big-endian, and the register order is X, Z, Y.
            Ok([
                i16::from_be_bytes([data[0], data[1]]),
                i16::from_be_bytes([data[4], data[5]]),
                i16::from_be_bytes([data[2], data[3]]),
            ])
        }
    }
}

#[cfg(not(feature = "raspberry_pi"))]
mod bus {
    pub struct Lsm303;

    impl Lsm303 {
        pub fn open() -> anyhow::Result<Self> {
            anyhow::bail!("compass bus not available in this build")
        }

        pub fn read_accel_raw(&mut self) -> anyhow::Result<[i16; 3]> {
            anyhow::bail!("compass bus not available in this build")
        }

        pub fn read_mag_raw(&mut self) -> anyhow::Result<[i16; 3]> {
            anyhow::bail!("compass bus not available in this build")
        }
    }
}

/// Polls the sensor at ~10 Hz, applies calibration, smooths the heading over
/// the last five samples, and publishes into the telemetry core.
pub struct CompassReader {
    running: Arc<AtomicBool>,
    calibration: Arc<Mutex<MagCalibration>>,
    raw_mag: Arc<Mutex<[f64; 3]>>,
}

impl CompassReader {
    /// Returns `Err` when the sensor is not on the bus; the caller is
    /// expected to continue without a compass.
    pub fn start(telemetry: Arc<TelemetryCore>) -> anyhow::Result<Self> {
        let mut device = bus::Lsm303::open()?;
        info!("GY-511 compass online");

        let running = Arc::new(AtomicBool::new(true));
        let calibration = Arc::new(Mutex::new(MagCalibration::default()));
        let raw_mag = Arc::new(Mutex::new([0.0; 3]));

        let loop_running = running.clone();
        let loop_calibration = calibration.clone();
        let loop_raw_mag = raw_mag.clone();
        tokio::task::spawn_blocking(move || {
            let mut history: VecDeque<f64> = VecDeque::with_capacity(HEADING_SMOOTHING);

            while loop_running.load(Ordering::Relaxed) {
                match (device.read_accel_raw(), device.read_mag_raw()) {
                    (Ok(accel_raw), Ok(mag_raw)) => {
                        let accel = accel_raw_to_g(accel_raw);
                        let raw = mag_raw_to_gauss(mag_raw);
                        *loop_raw_mag.lock().unwrap() = raw;
                        let mag = loop_calibration.lock().unwrap().apply(raw);

                        let (heading, tilt_compensated) = tilt_compensated_heading(accel, mag);
                        if history.len() == HEADING_SMOOTHING {
                            history.pop_front();
                        }
                        history.push_back(heading);
                        let smoothed = history.iter().sum::<f64>() / history.len() as f64;

                        telemetry.publish_compass(CompassSample {
                            heading_deg: smoothed,
                            accel,
                            mag,
                            tilt_compensated,
                            taken_at: Instant::now(),
                        });
                    }
                    (Err(err), _) | (_, Err(err)) => {
                        debug!(error = %err, "compass read failed");
                        std::thread::sleep(Duration::from_millis(500));
                    }
                }
                std::thread::sleep(SAMPLE_PERIOD);
            }
            debug!("compass loop stopped");
        });

        Ok(Self {
            running,
            calibration,
            raw_mag,
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Min/max calibration: the operator rotates the device through all
    /// orientations for `duration` while raw extremes are tracked. Blocks
    /// the caller for the whole window; only ever run on explicit request.
    pub async fn calibrate(&self, duration: Duration) -> MagCalibration {
        info!(seconds = duration.as_secs(), "magnetometer calibration started, rotate the device");

        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        let started = Instant::now();

        while started.elapsed() < duration {
            let raw = *self.raw_mag.lock().unwrap();
            for axis in 0..3 {
                min[axis] = min[axis].min(raw[axis]);
                max[axis] = max[axis].max(raw[axis]);
            }
            tokio::time::sleep(SAMPLE_PERIOD).await;
        }

        let calibration = calibration_from_extremes(min, max);
        *self.calibration.lock().unwrap() = calibration;
        info!(offset = ?calibration.offset, scale = ?calibration.scale, "magnetometer calibrated");
        if calibration.scale.iter().any(|s| !s.is_finite()) {
            warn!("degenerate calibration range on at least one axis");
        }
        calibration
    }
}

fn calibration_from_extremes(min: [f64; 3], max: [f64; 3]) -> MagCalibration {
    let mut offset = [0.0; 3];
    let mut range = [0.0; 3];
    for axis in 0..3 {
        offset[axis] = (max[axis] + min[axis]) / 2.0;
        range[axis] = max[axis] - min[axis];
    }
    let mean_range = (range[0] + range[1] + range[2]) / 3.0;

    let mut scale = [1.0; 3];
    for axis in 0..3 {
        if range[axis] > 0.0 {
            scale[axis] = mean_range / range[axis];
        }
    }
    MagCalibration { offset, scale }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_device_field_along_x_reads_zero() {
        // Device level, field along +X: heading 0.
        let (heading, compensated) = tilt_compensated_heading([0.0, 0.0, 1.0], [0.3, 0.0, 0.0]);
        assert!(compensated);
        assert!(heading.abs() < 1e-9);
    }

    #[test]
    fn flat_device_mag_along_y_reads_ninety() {
        let (heading, compensated) = tilt_compensated_heading([0.0, 0.0, 1.0], [0.0, 0.3, 0.0]);
        assert!(compensated);
        assert!((heading - 90.0).abs() < 1e-9);
    }

    #[test]
    fn zero_gravity_falls_back_to_flat_formula() {
        let (heading, compensated) = tilt_compensated_heading([0.0, 0.0, 0.0], [0.0, -0.3, 0.0]);
        assert!(!compensated);
        assert!((heading - 270.0).abs() < 1e-9);
    }

    #[test]
    fn tilt_does_not_break_normalization() {
        // 30 degrees of pitch; the heading must stay in [0, 360).
        let (heading, compensated) =
            tilt_compensated_heading([0.5, 0.0, 0.866], [0.25, 0.1, -0.1]);
        assert!(compensated);
        assert!((0.0..360.0).contains(&heading));
    }

    #[test]
    fn raw_scaling_matches_sensor_ranges() {
        assert!((accel_raw_to_g([16384, 0, -16384])[0] - 1.0).abs() < 1e-12);
        assert!((accel_raw_to_g([16384, 0, -16384])[2] + 1.0).abs() < 1e-12);
        assert!((mag_raw_to_gauss([1100, 1100, 980])[0] - 1.0).abs() < 1e-12);
        assert!((mag_raw_to_gauss([1100, 1100, 980])[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn calibration_centers_and_balances_axes() {
        let cal = calibration_from_extremes([-1.0, -0.5, -2.0], [3.0, 0.5, 2.0]);
        assert_eq!(cal.offset, [1.0, 0.0, 0.0]);

        // Ranges 4, 1, 4 -> mean 3; scales 0.75, 3.0, 0.75.
        assert!((cal.scale[0] - 0.75).abs() < 1e-12);
        assert!((cal.scale[1] - 3.0).abs() < 1e-12);
        assert!((cal.scale[2] - 0.75).abs() < 1e-12);

        let corrected = cal.apply([3.0, 0.5, 2.0]);
        assert!((corrected[0] - 1.5).abs() < 1e-12);
        assert!((corrected[1] - 1.5).abs() < 1e-12);
        assert!((corrected[2] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn degenerate_axis_keeps_unit_scale() {
        let cal = calibration_from_extremes([0.0, -1.0, -1.0], [0.0, 1.0, 1.0]);
        assert_eq!(cal.scale[0], 1.0);
    }
}
