use log::debug;
use nalgebra::Unit;
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;

use crate::types::{
    is_finite_vec, wrap_pi, wrap_two_pi, Orientation, Quat, SensorKind, SensorSample, Vec3,
};

/// How magnetometer samples correct the heading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingMode {
    /// Tilt-compensated compass heading blended into yaw.
    #[default]
    TiltCompensated,
    /// First-order corrective rotation from the gravity and magnetic-north
    /// cross products (uses the latest accelerometer vector).
    VectorCorrection,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttitudeParams {
    /// Complementary weight on the propagated estimate
    pub alpha: f64,
    /// Gyro rates below this magnitude are not integrated [rad/s]
    pub gyro_epsilon: f64,
    /// Accel/mag vectors shorter than this are rejected
    pub min_vector_norm: f64,
    pub declination_rad: f64,
    pub heading_mode: HeadingMode,
    /// Gyro gaps longer than this re-baseline instead of integrating [s]
    pub max_dt_secs: f64,
    /// Constant rate subtracted from gyro z before integration [rad/s]
    pub yaw_rate_bias: f64,
}

impl Default for AttitudeParams {
    fn default() -> Self {
        Self {
            alpha: 0.98,
            gyro_epsilon: 0.01,
            min_vector_norm: 0.1,
            declination_rad: 0.0,
            heading_mode: HeadingMode::TiltCompensated,
            max_dt_secs: 1.0,
            yaw_rate_bias: 0.0,
        }
    }
}

/// Outcome of feeding one sample to the estimator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttitudeUpdate {
    Applied,
    /// Gyro timing baseline set (first sample, zero interval or long gap); no rotation
    Baseline,
    /// Gyro rate under `gyro_epsilon`; baseline advanced, no rotation
    BelowThreshold,
    /// Measurement unusable; orientation untouched
    Rejected(&'static str),
    /// Gyro timestamp went backwards; orientation and baseline untouched
    NonMonotonic { previous: u64, current: u64 },
}

impl AttitudeUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, AttitudeUpdate::Applied)
    }
}

/// Complementary-filter AHRS on a unit quaternion.
///
/// Accelerometer samples pull roll/pitch toward the gravity tilt, gyroscope
/// samples propagate the full attitude, magnetometer samples pull the heading.
#[derive(Clone, Debug)]
pub struct AttitudeEstimator {
    params: AttitudeParams,
    orientation: Orientation,
    last_gyro_ts: Option<u64>,
    last_accel: Option<Vec3>,
}

impl AttitudeEstimator {
    pub fn new(params: AttitudeParams) -> Self {
        Self::with_orientation(params, Orientation::identity())
    }

    pub fn with_orientation(params: AttitudeParams, orientation: Orientation) -> Self {
        Self {
            params,
            orientation,
            last_gyro_ts: None,
            last_accel: None,
        }
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn params(&self) -> &AttitudeParams {
        &self.params
    }

    pub fn reset(&mut self) {
        self.orientation = Orientation::identity();
        self.last_gyro_ts = None;
        self.last_accel = None;
    }

    /// Fuse one sample into the running orientation.
    pub fn update(&mut self, sample: &SensorSample) -> AttitudeUpdate {
        let outcome = match sample.kind {
            SensorKind::Accel => self.update_accel(sample),
            SensorKind::Gyro => self.update_gyro(sample),
            SensorKind::Mag => self.update_mag(sample),
        };
        if !outcome.is_applied() {
            debug!("[ahrs] {} @{} not applied: {:?}", sample.kind, sample.timestamp, outcome);
        }
        outcome
    }

    fn update_accel(&mut self, sample: &SensorSample) -> AttitudeUpdate {
        let accel = sample.vector();
        if let Err(reason) = self.check_vector(&accel) {
            return AttitudeUpdate::Rejected(reason);
        }
        self.last_accel = Some(accel);

        let (accel_roll, accel_pitch) = tilt_from_accel(&accel);
        let (roll, pitch, yaw) = self.orientation.quaternion().euler_angles();
        let alpha = self.params.alpha;
        let roll = alpha * roll + (1.0 - alpha) * accel_roll;
        let pitch = alpha * pitch + (1.0 - alpha) * accel_pitch;

        self.commit(Quat::from_euler_angles(roll, pitch, yaw), "accel tilt produced non-finite attitude")
    }

    fn update_gyro(&mut self, sample: &SensorSample) -> AttitudeUpdate {
        let rate = Vec3::new(sample.x, sample.y, sample.z - self.params.yaw_rate_bias);
        if !is_finite_vec(&rate) {
            return AttitudeUpdate::Rejected("non-finite gyro rate");
        }

        let Some(previous) = self.last_gyro_ts else {
            self.last_gyro_ts = Some(sample.timestamp);
            return AttitudeUpdate::Baseline;
        };
        if sample.timestamp < previous {
            return AttitudeUpdate::NonMonotonic { previous, current: sample.timestamp };
        }
        self.last_gyro_ts = Some(sample.timestamp);

        let dt = (sample.timestamp - previous) as f64 / 1000.0;
        if dt == 0.0 || dt > self.params.max_dt_secs {
            return AttitudeUpdate::Baseline;
        }

        let rate_mag = rate.norm();
        if rate_mag < self.params.gyro_epsilon {
            return AttitudeUpdate::BelowThreshold;
        }

        let axis = Unit::new_unchecked(rate / rate_mag);
        let dq = Quat::from_axis_angle(&axis, rate_mag * dt);
        let mut q = dq * self.orientation.quaternion();
        q.renormalize();
        self.commit(q, "gyro step produced non-finite attitude")
    }

    fn update_mag(&mut self, sample: &SensorSample) -> AttitudeUpdate {
        let mag = sample.vector();
        if let Err(reason) = self.check_vector(&mag) {
            return AttitudeUpdate::Rejected(reason);
        }
        match self.params.heading_mode {
            HeadingMode::TiltCompensated => self.blend_heading(&mag),
            HeadingMode::VectorCorrection => self.vector_correction(&mag),
        }
    }

    fn blend_heading(&mut self, mag: &Vec3) -> AttitudeUpdate {
        let (roll, pitch, yaw) = self.orientation.quaternion().euler_angles();
        let mag_yaw = heading_from_mag(mag, roll, pitch, self.params.declination_rad);

        // Shortest arc so the blend never swings the long way round 0/2π
        let innovation = wrap_pi(mag_yaw - wrap_two_pi(yaw));
        let yaw = wrap_two_pi(yaw + (1.0 - self.params.alpha) * innovation);

        self.commit(Quat::from_euler_angles(roll, pitch, yaw), "heading blend produced non-finite attitude")
    }

    fn vector_correction(&mut self, mag: &Vec3) -> AttitudeUpdate {
        let Some(accel) = self.last_accel else {
            return AttitudeUpdate::Rejected("no accelerometer reference");
        };
        let q = *self.orientation.quaternion();
        let accel_hat = accel / accel.norm();
        let mag_hat = mag / mag.norm();

        // Gravity and magnetic north as the current attitude predicts them in body frame.
        // Magnetic north sits `declination` counter-clockwise of world +y (north).
        let gravity_pred = q.inverse_transform_vector(&Vec3::z());
        let mag_world = q * mag_hat;
        let horizontal = (mag_world.x * mag_world.x + mag_world.y * mag_world.y).sqrt();
        let declination = self.params.declination_rad;
        let north_ref = Vec3::new(
            -horizontal * declination.sin(),
            horizontal * declination.cos(),
            mag_world.z,
        );
        let mag_pred = q.inverse_transform_vector(&north_ref);

        let error_body = accel_hat.cross(&gravity_pred) + mag_hat.cross(&mag_pred);
        let error_world = q * error_body;
        let dq = Quat::from_scaled_axis(error_world * (1.0 - self.params.alpha));
        let mut corrected = dq * q;
        corrected.renormalize();
        self.commit(corrected, "vector correction produced non-finite attitude")
    }

    fn check_vector(&self, v: &Vec3) -> Result<(), &'static str> {
        if !is_finite_vec(v) {
            return Err("non-finite vector");
        }
        if v.norm() <= self.params.min_vector_norm {
            return Err("vector norm below threshold");
        }
        Ok(())
    }

    fn commit(&mut self, candidate: Quat, reason: &'static str) -> AttitudeUpdate {
        let candidate = Orientation::from_quaternion(candidate);
        if !candidate.is_finite() {
            return AttitudeUpdate::Rejected(reason);
        }
        self.orientation = candidate;
        AttitudeUpdate::Applied
    }
}

impl Default for AttitudeEstimator {
    fn default() -> Self {
        Self::new(AttitudeParams::default())
    }
}

/// Roll and pitch implied by a specific-force vector at rest.
pub fn tilt_from_accel(accel: &Vec3) -> (f64, f64) {
    let (ax, ay, az) = (accel.x, accel.y, accel.z);
    let roll = ay.atan2((ax * ax + az * az).sqrt());
    let pitch = (-ax).atan2((ay * ay + az * az).sqrt());
    (roll, pitch)
}

/// Tilt-compensated heading as an ENU yaw in [0, 2π), declination applied.
///
/// `atan2(-magYh, magXh)` is the body x angle measured from magnetic north;
/// north is world +y, so a quarter turn maps it onto the yaw that
/// [`Orientation`] and the GPS projection share (0 = east, π/2 = north).
pub fn heading_from_mag(mag: &Vec3, roll: f64, pitch: f64, declination_rad: f64) -> f64 {
    let (sin_r, cos_r) = roll.sin_cos();
    let (sin_p, cos_p) = pitch.sin_cos();
    let mag_x_h = mag.x * cos_p + mag.y * sin_r * sin_p + mag.z * cos_r * sin_p;
    let mag_y_h = mag.y * cos_r - mag.z * sin_r;
    wrap_two_pi((-mag_y_h).atan2(mag_x_h) + FRAC_PI_2 + declination_rad)
}
