use log::debug;

use crate::types::{is_finite_vec, world_up, NavigationState, Orientation, Vec3};

/// Standard gravity used for removal [m/s²]
pub const GRAVITY: f64 = 9.81;

/// Result of offering one accelerometer sample to the integrator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StrapdownStep {
    /// State advanced by `dt` seconds
    Advanced { dt: f64 },
    /// First sample, zero interval or long gap: timing baseline only
    Baseline,
    /// Non-finite acceleration; state and baseline untouched
    Rejected,
    NonMonotonic { previous: u64, current: u64 },
}

/// Rotate `accel_body` into the world frame and remove gravity.
pub fn net_world_accel(accel_body: &Vec3, orientation: &Orientation, gravity: f64) -> Vec3 {
    orientation.rotate(accel_body) - world_up() * gravity
}

/// One dead-reckoning step with an explicit `dt`.
///
/// Velocity is first order, position second order on the updated velocity:
/// `v += a·dt`, then `p += v·dt + ½·a·dt²`.
pub fn integrate(
    accel_body: &Vec3,
    orientation: &Orientation,
    dt: f64,
    gravity: f64,
    state: &mut NavigationState,
) -> Vec3 {
    let net = net_world_accel(accel_body, orientation, gravity);
    state.velocity += net * dt;
    state.position += state.velocity * dt + net * (0.5 * dt * dt);
    state.orientation = *orientation;
    net
}

/// Timestamp-driven wrapper around [`integrate`].
///
/// No drift bounding happens here; dead-reckoning error grows until the GPS
/// corrector pulls it back.
#[derive(Clone, Debug)]
pub struct StrapdownIntegrator {
    gravity: f64,
    max_dt_secs: f64,
    last_timestamp: Option<u64>,
}

impl StrapdownIntegrator {
    pub fn new(gravity: f64, max_dt_secs: f64) -> Self {
        Self {
            gravity,
            max_dt_secs,
            last_timestamp: None,
        }
    }

    pub fn reset(&mut self) {
        self.last_timestamp = None;
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.last_timestamp
    }

    pub fn step(
        &mut self,
        timestamp: u64,
        accel_body: &Vec3,
        orientation: &Orientation,
        state: &mut NavigationState,
    ) -> StrapdownStep {
        if !is_finite_vec(accel_body) || !orientation.is_finite() {
            debug!("[strapdown] @{} rejected non-finite input", timestamp);
            return StrapdownStep::Rejected;
        }

        let Some(previous) = self.last_timestamp else {
            self.last_timestamp = Some(timestamp);
            return StrapdownStep::Baseline;
        };
        if timestamp < previous {
            return StrapdownStep::NonMonotonic { previous, current: timestamp };
        }
        self.last_timestamp = Some(timestamp);

        let dt = (timestamp - previous) as f64 / 1000.0;
        if dt == 0.0 || dt > self.max_dt_secs {
            return StrapdownStep::Baseline;
        }

        integrate(accel_body, orientation, dt, self.gravity, state);
        StrapdownStep::Advanced { dt }
    }
}

impl Default for StrapdownIntegrator {
    fn default() -> Self {
        Self::new(GRAVITY, 1.0)
    }
}
