//! Offline recomputation of a finished session
//!
//! Runs over the complete buffered streams once recording has stopped: a
//! session-global yaw drift rate is estimated from the magnetometer, the
//! attitude is replayed with that rate removed from gyro z, then the
//! trajectory is dead-reckoned from the replayed attitude. IMU only; GPS
//! fixes in the buffer are not used.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FusionError, FusionResult};
use crate::filters::attitude::{heading_from_mag, AttitudeEstimator, AttitudeParams};
use crate::filters::strapdown::StrapdownIntegrator;
use crate::sensor_fusion::FusionConfig;
use crate::session::SessionBuffer;
use crate::types::{
    is_finite_vec, NavigationState, Orientation, OrientationRecord, PositionRecord, SensorSample,
    TrajectoryRecord,
};

/// Accelerometer samples processed between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub struct BatchOutput {
    /// Yaw bias removed from every gyro sample [rad/s]
    pub drift_rate: f64,
    pub orientations: Vec<OrientationRecord>,
    pub trajectory: Vec<TrajectoryRecord>,
}

impl BatchOutput {
    pub fn positions(&self) -> Vec<PositionRecord> {
        self.trajectory.iter().map(|t| t.position()).collect()
    }
}

/// Batch recomputation pass. Stateless between runs, so repeated runs over
/// the same buffer give identical output.
#[derive(Clone, Debug)]
pub struct BatchRecompute {
    params: AttitudeParams,
    gravity: f64,
    max_dt_secs: f64,
}

impl BatchRecompute {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            params: config.attitude_params(),
            gravity: config.gravity,
            max_dt_secs: config.max_dt_secs,
        }
    }

    /// Session-global yaw drift: (last mag heading − first mag heading)
    /// divided by the number of gyro samples.
    ///
    /// Both headings are taken level (roll = pitch = 0) and the difference is
    /// not wrapped. Dividing by sample count rather than elapsed time mixes
    /// sampling rate into the rate; kept so corrected logs stay comparable
    /// with earlier recordings.
    pub fn drift_rate(&self, buffer: &SessionBuffer) -> f64 {
        let gyro_count = buffer.gyro().len();
        if gyro_count == 0 {
            return 0.0;
        }
        let usable = |s: &&SensorSample| {
            let v = s.vector();
            is_finite_vec(&v) && v.norm() > self.params.min_vector_norm
        };
        let (Some(first), Some(last)) = (
            buffer.mag().iter().find(usable),
            buffer.mag().iter().rev().find(usable),
        ) else {
            return 0.0;
        };

        let declination = self.params.declination_rad;
        let first_yaw = heading_from_mag(&first.vector(), 0.0, 0.0, declination);
        let last_yaw = heading_from_mag(&last.vector(), 0.0, 0.0, declination);
        let total_drift = last_yaw - first_yaw;
        debug!("[batch] total yaw drift {:.4} rad over {} gyro samples", total_drift, gyro_count);
        total_drift / gyro_count as f64
    }

    /// Replay the attitude with three cursors: the accelerometer stream is the
    /// clock, gyro and mag samples up to each accel timestamp are caught up
    /// after it. One orientation per accel sample.
    pub fn recompute_orientation(&self, buffer: &SessionBuffer, drift_rate: f64) -> Vec<OrientationRecord> {
        replay_orientation(self.params, buffer, drift_rate).collect()
    }

    /// Dead-reckon from the accel stream using, for each sample, the last
    /// orientation at or before it. One record per accel sample.
    pub fn recompute_trajectory(
        &self,
        buffer: &SessionBuffer,
        orientations: &[OrientationRecord],
    ) -> Vec<TrajectoryRecord> {
        replay_trajectory(self.integrator(), buffer, orientations).collect()
    }

    pub fn run(&self, buffer: &SessionBuffer) -> BatchOutput {
        let drift_rate = self.drift_rate(buffer);
        let orientations = self.recompute_orientation(buffer, drift_rate);
        let trajectory = self.recompute_trajectory(buffer, &orientations);
        finish(drift_rate, orientations, trajectory)
    }

    /// As [`run`](Self::run), but returns `FusionError::Cancelled` as soon as
    /// `cancel` is observed set.
    pub fn run_cancellable(&self, buffer: &SessionBuffer, cancel: &AtomicBool) -> FusionResult<BatchOutput> {
        let drift_rate = self.drift_rate(buffer);
        let orientations = collect_until_cancelled(replay_orientation(self.params, buffer, drift_rate), cancel)?;
        let trajectory =
            collect_until_cancelled(replay_trajectory(self.integrator(), buffer, &orientations), cancel)?;
        Ok(finish(drift_rate, orientations, trajectory))
    }

    fn integrator(&self) -> StrapdownIntegrator {
        StrapdownIntegrator::new(self.gravity, self.max_dt_secs)
    }
}

fn replay_orientation(
    params: AttitudeParams,
    buffer: &SessionBuffer,
    drift_rate: f64,
) -> impl Iterator<Item = OrientationRecord> + '_ {
    let mut estimator = AttitudeEstimator::new(AttitudeParams { yaw_rate_bias: drift_rate, ..params });
    let (gyro, mag) = (buffer.gyro(), buffer.mag());
    let (mut gyro_idx, mut mag_idx) = (0, 0);

    buffer.accel().iter().map(move |accel| {
        let now = accel.timestamp;
        estimator.update(accel);

        while gyro_idx < gyro.len() && gyro[gyro_idx].timestamp <= now {
            estimator.update(&gyro[gyro_idx]);
            gyro_idx += 1;
        }
        while mag_idx < mag.len() && mag[mag_idx].timestamp <= now {
            estimator.update(&mag[mag_idx]);
            mag_idx += 1;
        }

        OrientationRecord { timestamp: now, orientation: estimator.orientation() }
    })
}

fn replay_trajectory<'a>(
    mut integrator: StrapdownIntegrator,
    buffer: &'a SessionBuffer,
    orientations: &'a [OrientationRecord],
) -> impl Iterator<Item = TrajectoryRecord> + 'a {
    let mut state = NavigationState::new();
    let mut cursor: Option<usize> = None;

    buffer.accel().iter().map(move |accel| {
        let now = accel.timestamp;
        let mut next = cursor.map_or(0, |c| c + 1);
        while next < orientations.len() && orientations[next].timestamp <= now {
            cursor = Some(next);
            next += 1;
        }
        let orientation = cursor
            .map(|c| orientations[c].orientation)
            .unwrap_or_else(Orientation::identity);

        integrator.step(now, &accel.vector(), &orientation, &mut state);
        TrajectoryRecord::new(now, &state.position, &orientation)
    })
}

fn finish(
    drift_rate: f64,
    orientations: Vec<OrientationRecord>,
    trajectory: Vec<TrajectoryRecord>,
) -> BatchOutput {
    info!(
        "[batch] recomputed {} orientations, {} positions (drift rate {:.6})",
        orientations.len(),
        trajectory.len(),
        drift_rate
    );
    BatchOutput { drift_rate, orientations, trajectory }
}

/// Collect `items`, polling `cancel` every [`CANCEL_CHECK_INTERVAL`] items.
fn collect_until_cancelled<T>(items: impl Iterator<Item = T>, cancel: &AtomicBool) -> FusionResult<Vec<T>> {
    let mut out = Vec::with_capacity(items.size_hint().0);
    for (index, item) in items.enumerate() {
        if index % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            info!("[batch] cancelled at sample {}", index);
            return Err(FusionError::Cancelled);
        }
        out.push(item);
    }
    Ok(out)
}

impl Default for BatchRecompute {
    fn default() -> Self {
        Self::new(&FusionConfig::default())
    }
}
