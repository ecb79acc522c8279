// sensor_fusion.rs: Live fusion core for roadtag
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - the capture layer delivering samples
//   - File I/O
//
// It takes sensor samples and GPS fixes in, mutates one NavigationState, and
// reports what happened as events. The async pipeline and the replay binaries
// both drive it the same way.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FusionError, FusionResult};
use crate::filters::attitude::{AttitudeEstimator, AttitudeParams, AttitudeUpdate, HeadingMode};
use crate::filters::gps_aided::{CorrectionOutcome, GpsCorrector};
use crate::filters::strapdown::{StrapdownIntegrator, StrapdownStep};
use crate::rate_limit::OutputGate;
use crate::types::{
    EulerAngles, GpsFix, NavigationState, PositionRecord, SensorKind, SensorSample, Vec3,
};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // ── Attitude ──
    pub alpha: f64,
    pub gyro_epsilon: f64,
    pub min_vector_norm: f64,
    pub magnetic_declination_rad: f64,
    pub heading_mode: HeadingMode,

    // ── Strapdown ──
    pub gravity: f64,
    pub max_dt_secs: f64,

    // ── GPS aiding ──
    pub gps_alpha: f64,

    // ── Output / plumbing ──
    pub output_interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.98,
            gyro_epsilon: 0.01,
            min_vector_norm: 0.1,
            magnetic_declination_rad: 0.0,
            heading_mode: HeadingMode::TiltCompensated,
            gravity: 9.81,
            max_dt_secs: 1.0,
            gps_alpha: 0.1,
            output_interval_ms: 10,
            channel_capacity: 1024,
        }
    }
}

impl FusionConfig {
    /// Load from JSON; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> FusionResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: FusionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FusionResult<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(FusionError::Config(format!("{} must be in [0, 1], got {}", name, v)))
            }
        };
        unit("alpha", self.alpha)?;
        unit("gps_alpha", self.gps_alpha)?;

        if !(self.gravity > 0.0) {
            return Err(FusionError::Config(format!("gravity must be positive, got {}", self.gravity)));
        }
        if !(self.max_dt_secs > 0.0) {
            return Err(FusionError::Config(format!(
                "max_dt_secs must be positive, got {}",
                self.max_dt_secs
            )));
        }
        if !(self.gyro_epsilon >= 0.0) || !(self.min_vector_norm >= 0.0) {
            return Err(FusionError::Config("thresholds must be non-negative".to_string()));
        }
        if !self.magnetic_declination_rad.is_finite() {
            return Err(FusionError::Config("magnetic_declination_rad must be finite".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(FusionError::Config("channel_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn attitude_params(&self) -> AttitudeParams {
        AttitudeParams {
            alpha: self.alpha,
            gyro_epsilon: self.gyro_epsilon,
            min_vector_norm: self.min_vector_norm,
            declination_rad: self.magnetic_declination_rad,
            heading_mode: self.heading_mode,
            max_dt_secs: self.max_dt_secs,
            yaw_rate_bias: 0.0,
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    /// Rate-limited live output row
    PositionOutput(PositionRecord),
    MeasurementSkipped { kind: SensorKind, timestamp: u64, reason: &'static str },
    NonMonotonic { kind: SensorKind, previous: u64, current: u64 },
    ReferenceFixSet { latitude: f64, longitude: f64, altitude: f64 },
    GpsRejected { timestamp: u64, latitude: f64, longitude: f64 },
    GpsCorrected { timestamp: u64, local: Vec3 },
}

// ─── Counters ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionStats {
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub mag_samples: u64,
    pub skipped_samples: u64,
    pub gps_accepted: u64,
    pub gps_rejected: u64,
    pub records_emitted: u64,
    /// Live records the output sink failed to take
    pub sink_errors: u64,
}

// ─── Fusion output snapshot ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusionSnapshot {
    pub state: NavigationState,
    pub euler: EulerAngles,
    pub reference: Option<GpsFix>,
    pub last_timestamp: Option<u64>,
}

// ─── The main fusion struct ──────────────────────────────────────────────────

/// Single-writer live fusion: attitude, dead reckoning and GPS aiding over
/// one shared [`NavigationState`]. Callers must serialize access; the async
/// pipeline does so by owning it on one task.
pub struct SensorFusion {
    config: FusionConfig,
    attitude: AttitudeEstimator,
    strapdown: StrapdownIntegrator,
    gps: GpsCorrector,
    gate: OutputGate,
    state: NavigationState,
    stats: FusionStats,
    last_timestamp: Option<u64>,
}

impl SensorFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            attitude: AttitudeEstimator::new(config.attitude_params()),
            strapdown: StrapdownIntegrator::new(config.gravity, config.max_dt_secs),
            gps: GpsCorrector::new(config.gps_alpha),
            gate: OutputGate::new(config.output_interval_ms),
            state: NavigationState::new(),
            stats: FusionStats::default(),
            last_timestamp: None,
            config,
        }
    }

    /// Back to zero state; the reference fix is forgotten.
    pub fn reset(&mut self) {
        self.attitude.reset();
        self.strapdown.reset();
        self.gps.reset();
        self.gate.reset();
        self.state.reset();
        self.stats = FusionStats::default();
        self.last_timestamp = None;
    }

    // ── Sensor feeds ─────────────────────────────────────────────────────

    /// Feed one inertial sample. Accelerometer samples also drive the
    /// strapdown step and, rate-limited, the live output.
    pub fn feed_sample(&mut self, sample: &SensorSample) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        match sample.kind {
            SensorKind::Accel => self.stats.accel_samples += 1,
            SensorKind::Gyro => self.stats.gyro_samples += 1,
            SensorKind::Mag => self.stats.mag_samples += 1,
        }
        self.touch(sample.timestamp);

        let attitude_skipped = match self.attitude.update(sample) {
            AttitudeUpdate::Rejected(reason) => {
                self.stats.skipped_samples += 1;
                events.push(FusionEvent::MeasurementSkipped {
                    kind: sample.kind,
                    timestamp: sample.timestamp,
                    reason,
                });
                true
            }
            AttitudeUpdate::NonMonotonic { previous, current } => {
                warn!("[fusion] {} timestamp went backwards: {} -> {}", sample.kind, previous, current);
                self.stats.skipped_samples += 1;
                events.push(FusionEvent::NonMonotonic { kind: sample.kind, previous, current });
                true
            }
            AttitudeUpdate::Applied | AttitudeUpdate::Baseline | AttitudeUpdate::BelowThreshold => false,
        };
        self.state.orientation = self.attitude.orientation();

        if sample.kind == SensorKind::Accel {
            events.extend(self.dead_reckon(sample, attitude_skipped));
        }
        events
    }

    /// `already_reported`: the attitude step skipped this sample and said so.
    fn dead_reckon(&mut self, sample: &SensorSample, already_reported: bool) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        let orientation = self.attitude.orientation();
        match self.strapdown.step(sample.timestamp, &sample.vector(), &orientation, &mut self.state) {
            StrapdownStep::Advanced { .. } => {
                if self.gate.ready(sample.timestamp) {
                    self.stats.records_emitted += 1;
                    events.push(FusionEvent::PositionOutput(PositionRecord::new(
                        sample.timestamp,
                        &self.state.position,
                    )));
                }
            }
            StrapdownStep::Baseline => {}
            StrapdownStep::Rejected if already_reported => {}
            StrapdownStep::Rejected => {
                self.stats.skipped_samples += 1;
                events.push(FusionEvent::MeasurementSkipped {
                    kind: SensorKind::Accel,
                    timestamp: sample.timestamp,
                    reason: "non-finite acceleration",
                });
            }
            StrapdownStep::NonMonotonic { previous, current } => {
                warn!("[fusion] ACCEL timestamp went backwards: {} -> {}", previous, current);
                self.stats.skipped_samples += 1;
                events.push(FusionEvent::NonMonotonic { kind: SensorKind::Accel, previous, current });
            }
        }
        events
    }

    /// Feed one GPS fix. Never emits a position record.
    pub fn feed_gps(&mut self, fix: &GpsFix) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        self.touch(fix.timestamp);

        match self.gps.correct(fix, &mut self.state) {
            CorrectionOutcome::Rejected => {
                self.stats.gps_rejected += 1;
                events.push(FusionEvent::GpsRejected {
                    timestamp: fix.timestamp,
                    latitude: fix.latitude,
                    longitude: fix.longitude,
                });
            }
            CorrectionOutcome::ReferenceSet => {
                self.stats.gps_accepted += 1;
                events.push(FusionEvent::ReferenceFixSet {
                    latitude: fix.latitude,
                    longitude: fix.longitude,
                    altitude: fix.altitude,
                });
            }
            CorrectionOutcome::Corrected { local } => {
                self.stats.gps_accepted += 1;
                debug!(
                    "[fusion] GPS @{} local=({:.2}, {:.2}, {:.2}) pos=({:.2}, {:.2}, {:.2})",
                    fix.timestamp, local.x, local.y, local.z,
                    self.state.position.x, self.state.position.y, self.state.position.z
                );
                events.push(FusionEvent::GpsCorrected { timestamp: fix.timestamp, local });
            }
        }
        events
    }

    /// The downstream sink refused a live record; fusion carries on.
    pub fn record_sink_error(&mut self) {
        self.stats.sink_errors += 1;
    }

    fn touch(&mut self, timestamp: u64) {
        self.last_timestamp = Some(self.last_timestamp.map_or(timestamp, |t| t.max(timestamp)));
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn state(&self) -> &NavigationState {
        &self.state
    }

    pub fn stats(&self) -> &FusionStats {
        &self.stats
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn reference(&self) -> Option<&GpsFix> {
        self.gps.reference().map(|r| r.fix())
    }

    pub fn get_snapshot(&self) -> FusionSnapshot {
        FusionSnapshot {
            state: self.state,
            euler: self.state.orientation.euler(),
            reference: self.reference().copied(),
            last_timestamp: self.last_timestamp,
        }
    }

    pub fn log_summary(&self) {
        let s = &self.stats;
        info!(
            "[fusion] accel={} gyro={} mag={} skipped={} gps={}/{} records={} sink_errors={} speed={:.2} m/s",
            s.accel_samples, s.gyro_samples, s.mag_samples, s.skipped_samples,
            s.gps_accepted, s.gps_accepted + s.gps_rejected, s.records_emitted, s.sink_errors,
            self.state.speed()
        );
    }
}

impl Default for SensorFusion {
    fn default() -> Self {
        Self::new(FusionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn positions(events: &[FusionEvent]) -> Vec<PositionRecord> {
        events
            .iter()
            .filter_map(|e| match e {
                FusionEvent::PositionOutput(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_stationary_accel_stays_at_origin() {
        let mut fusion = SensorFusion::default();
        let mut records = Vec::new();
        for i in 0..500u64 {
            records.extend(positions(&fusion.feed_sample(&SensorSample::accel(i * 5, 0.0, 0.0, 9.81))));
        }
        assert!(!records.is_empty());
        for r in &records {
            assert_eq!((r.x, r.y, r.z), (0.0, 0.0, 0.0));
        }
        assert_eq!(fusion.state().velocity, Vec3::zeros());
    }

    #[test]
    fn test_output_rate_limited() {
        let mut fusion = SensorFusion::default();
        let mut count = 0;
        // 200 Hz for one second
        for i in 0..200u64 {
            count += positions(&fusion.feed_sample(&SensorSample::accel(i * 5, 0.0, 0.0, 9.81))).len();
        }
        // First sample is baseline only; 5..995 gated at 10 ms
        assert_eq!(count, 100);
        assert_eq!(fusion.stats().records_emitted, 100);
    }

    #[test]
    fn test_gps_correction_emits_no_record() {
        let mut fusion = SensorFusion::default();
        let events = fusion.feed_gps(&GpsFix::new(0, 48.0, 11.0, 500.0));
        assert!(matches!(events[0], FusionEvent::ReferenceFixSet { .. }));
        let events = fusion.feed_gps(&GpsFix::new(1000, 48.0001, 11.0, 500.0));
        assert!(matches!(events[0], FusionEvent::GpsCorrected { .. }));
        assert!(positions(&events).is_empty());
        assert_abs_diff_eq!(fusion.state().position.y, 1.112, epsilon = 1e-3);
    }

    #[test]
    fn test_sentinel_fix_reported() {
        let mut fusion = SensorFusion::default();
        let events = fusion.feed_gps(&GpsFix::new(0, 0.0, 0.0, 0.0));
        assert!(matches!(events[0], FusionEvent::GpsRejected { .. }));
        assert!(fusion.reference().is_none());
        assert_eq!(fusion.stats().gps_rejected, 1);
    }

    #[test]
    fn test_nan_sample_skipped_and_state_preserved() {
        let mut fusion = SensorFusion::default();
        fusion.feed_sample(&SensorSample::accel(0, 0.0, 0.0, 9.81));
        fusion.feed_sample(&SensorSample::accel(10, 0.0, 0.0, 9.81));
        let before = *fusion.state();
        let events = fusion.feed_sample(&SensorSample::accel(20, f64::NAN, 0.0, 9.81));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FusionEvent::MeasurementSkipped { kind: SensorKind::Accel, timestamp: 20, .. }));
        assert_eq!(fusion.stats().skipped_samples, 1);
        assert_eq!(*fusion.state(), before);
    }

    #[test]
    fn test_northward_motion_and_gps_share_axes() {
        let mut fusion = SensorFusion::default();
        fusion.feed_gps(&GpsFix::new(0, 48.0, 11.0, 500.0));

        // Level device, body x toward magnetic north: the field reads on +x only
        let north_mag = |ts| SensorSample::mag(ts, 20.0, 0.0, 0.0);
        for i in 0..1000u64 {
            fusion.feed_sample(&north_mag(i));
        }
        assert_abs_diff_eq!(fusion.state().orientation.euler().yaw, std::f64::consts::FRAC_PI_2, epsilon = 1e-6);

        // Accelerate forward for 2 s with the heading held by the compass
        for i in 0..=200u64 {
            let ts = 1000 + i * 10;
            fusion.feed_sample(&SensorSample::accel(ts, 1.0, 0.0, 9.81));
            fusion.feed_sample(&north_mag(ts));
        }
        let inertial = fusion.state().position;
        assert!(inertial.y > 0.1, "north motion expected on +y, got {:?}", inertial);
        assert_abs_diff_eq!(inertial.x, 0.0, epsilon = 1e-6);

        // 2 m north of the reference
        let north_deg = (2.0 / crate::geodetic::EARTH_RADIUS_M).to_degrees();
        let events = fusion.feed_gps(&GpsFix::new(3100, 48.0 + north_deg, 11.0, 500.0));
        let FusionEvent::GpsCorrected { local, .. } = events[0] else {
            panic!("expected a correction, got {:?}", events);
        };
        assert_abs_diff_eq!(local.x, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(local.y, 2.0, epsilon = 1e-6);

        let corrected = fusion.state().position;
        assert_abs_diff_eq!(corrected.x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(corrected.y, 0.9 * inertial.y + 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_backwards_gyro_reported() {
        let mut fusion = SensorFusion::default();
        fusion.feed_sample(&SensorSample::gyro(100, 0.0, 0.0, 0.5));
        let events = fusion.feed_sample(&SensorSample::gyro(50, 0.0, 0.0, 0.5));
        assert_eq!(
            events,
            vec![FusionEvent::NonMonotonic { kind: SensorKind::Gyro, previous: 100, current: 50 }]
        );
    }

    #[test]
    fn test_config_defaults_fill_missing_json_fields() {
        let config: FusionConfig = serde_json::from_str(r#"{"alpha": 0.9}"#).unwrap();
        assert_eq!(config.alpha, 0.9);
        assert_eq!(config.gps_alpha, 0.1);
        assert_eq!(config.output_interval_ms, 10);
        assert_eq!(config.heading_mode, HeadingMode::TiltCompensated);
    }

    #[test]
    fn test_config_validation() {
        assert!(FusionConfig::default().validate().is_ok());
        let bad = FusionConfig { gps_alpha: 1.5, ..FusionConfig::default() };
        assert!(matches!(bad.validate(), Err(FusionError::Config(_))));
        let bad = FusionConfig { gravity: 0.0, ..FusionConfig::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_reset_forgets_reference() {
        let mut fusion = SensorFusion::default();
        fusion.feed_gps(&GpsFix::new(0, 10.0, 10.0, 0.0));
        fusion.feed_sample(&SensorSample::accel(0, 1.0, 0.0, 9.81));
        fusion.reset();
        assert!(fusion.reference().is_none());
        assert_eq!(*fusion.stats(), FusionStats::default());
        assert_eq!(fusion.get_snapshot().last_timestamp, None);
    }
}
