pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which inertial sensor produced a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorKind {
    Accel,
    Gyro,
    Mag,
}

impl SensorKind {
    /// Label used in raw sensor logs.
    pub fn label(&self) -> &'static str {
        match self {
            SensorKind::Accel => "ACCEL",
            SensorKind::Gyro => "GYRO",
            SensorKind::Mag => "MAG",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "ACCEL" => Some(SensorKind::Accel),
            "GYRO" => Some(SensorKind::Gyro),
            "MAG" => Some(SensorKind::Mag),
            _ => None,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One accelerometer, gyroscope or magnetometer reading in the device body frame.
///
/// `timestamp` is monotonic milliseconds, shared with [`GpsFix`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp: u64,
    pub kind: SensorKind,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SensorSample {
    pub fn new(kind: SensorKind, timestamp: u64, x: f64, y: f64, z: f64) -> Self {
        Self { timestamp, kind, x, y, z }
    }

    pub fn accel(timestamp: u64, x: f64, y: f64, z: f64) -> Self {
        Self::new(SensorKind::Accel, timestamp, x, y, z)
    }

    pub fn gyro(timestamp: u64, x: f64, y: f64, z: f64) -> Self {
        Self::new(SensorKind::Gyro, timestamp, x, y, z)
    }

    pub fn mag(timestamp: u64, x: f64, y: f64, z: f64) -> Self {
        Self::new(SensorKind::Mag, timestamp, x, y, z)
    }

    pub fn vector(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
}

/// GPS location fix. Latitude/longitude in degrees, altitude in meters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub timestamp: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub bearing: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl GpsFix {
    pub fn new(timestamp: u64, latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            altitude,
            speed: None,
            bearing: None,
            accuracy: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// (0, 0) is the platform's "no fix" sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }

    pub fn is_valid(&self) -> bool {
        !self.is_sentinel()
            && self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.altitude.is_finite()
    }
}

/// Roll/pitch/yaw in radians, derived from an [`Orientation`] for output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EulerAngles {
    pub roll: f64,
    pub pitch: f64,
    /// Always in [0, 2π).
    pub yaw: f64,
}

/// Device attitude as a unit quaternion rotating body-frame vectors into the
/// world frame (x/y horizontal, z up). Composition is `Rz(yaw)·Ry(pitch)·Rx(roll)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    quaternion: Quat,
}

impl Orientation {
    pub fn identity() -> Self {
        Self { quaternion: Quat::identity() }
    }

    pub fn from_quaternion(quaternion: Quat) -> Self {
        Self { quaternion }
    }

    pub fn from_euler(roll: f64, pitch: f64, yaw: f64) -> Self {
        Self { quaternion: Quat::from_euler_angles(roll, pitch, yaw) }
    }

    pub fn quaternion(&self) -> &Quat {
        &self.quaternion
    }

    pub fn euler(&self) -> EulerAngles {
        let (roll, pitch, yaw) = self.quaternion.euler_angles();
        EulerAngles { roll, pitch, yaw: wrap_two_pi(yaw) }
    }

    /// Body frame → world frame.
    pub fn rotate(&self, body: &Vec3) -> Vec3 {
        self.quaternion * body
    }

    /// World frame → body frame.
    pub fn inverse_rotate(&self, world: &Vec3) -> Vec3 {
        self.quaternion.inverse_transform_vector(world)
    }

    pub fn rotation_matrix(&self) -> Mat3 {
        self.quaternion.to_rotation_matrix().into_inner()
    }

    /// Norm of the underlying quaternion; 1 within float tolerance.
    pub fn norm(&self) -> f64 {
        self.quaternion.quaternion().norm()
    }

    pub fn is_finite(&self) -> bool {
        self.quaternion.coords.iter().all(|c| c.is_finite())
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self::identity()
    }
}

/// Position/velocity/attitude of one recording session.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationState {
    /// Local ENU position relative to the reference fix [m]
    pub position: Vec3,
    /// World-frame velocity [m/s]
    pub velocity: Vec3,
    pub orientation: Orientation,
}

impl NavigationState {
    pub fn new() -> Self {
        Self {
            position: Vec3::zeros(),
            velocity: Vec3::zeros(),
            orientation: Orientation::identity(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }
}

impl Default for NavigationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Live output row: `{timestamp, position.x, position.y, position.z}`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub timestamp: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl PositionRecord {
    pub fn new(timestamp: u64, position: &Vec3) -> Self {
        Self { timestamp, x: position.x, y: position.y, z: position.z }
    }
}

/// Orientation sample of the batch pass, indexed by accelerometer timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrientationRecord {
    pub timestamp: u64,
    pub orientation: Orientation,
}

/// Corrected output row of the batch pass.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub timestamp: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl TrajectoryRecord {
    pub fn new(timestamp: u64, position: &Vec3, orientation: &Orientation) -> Self {
        let euler = orientation.euler();
        Self {
            timestamp,
            x: position.x,
            y: position.y,
            z: position.z,
            roll: euler.roll,
            pitch: euler.pitch,
            yaw: euler.yaw,
        }
    }

    pub fn position(&self) -> PositionRecord {
        PositionRecord { timestamp: self.timestamp, x: self.x, y: self.y, z: self.z }
    }
}
