use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::geodetic::haversine_distance;
use crate::sensor_fusion::{FusionConfig, FusionEvent, SensorFusion};
use crate::types::{GpsFix, SensorKind, SensorSample};

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created or stopped; samples are ignored
    Idle,
    /// Buffering and fusing samples
    Recording,
}

/// Session metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
    pub state: SessionState,
    pub accel_sample_count: u64,
    pub gyro_sample_count: u64,
    pub mag_sample_count: u64,
    pub gps_accepted: u64,
    pub gps_rejected: u64,
    pub records_emitted: u64,
    #[serde(default)]
    pub sink_errors: u64,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    /// Straight-line distance between first and last accepted fix
    pub distance_meters: f64,
}

impl SessionMetadata {
    fn new(state: SessionState) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("session_{}", now.timestamp_millis()),
            start_time: now.to_rfc3339(),
            end_time: None,
            state,
            accel_sample_count: 0,
            gyro_sample_count: 0,
            mag_sample_count: 0,
            gps_accepted: 0,
            gps_rejected: 0,
            records_emitted: 0,
            sink_errors: 0,
            first_timestamp: None,
            last_timestamp: None,
            distance_meters: 0.0,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }

    fn observe(&mut self, timestamp: u64) {
        self.first_timestamp = Some(self.first_timestamp.map_or(timestamp, |t| t.min(timestamp)));
        self.last_timestamp = Some(self.last_timestamp.map_or(timestamp, |t| t.max(timestamp)));
    }
}

/// One element of a session in capture order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionItem {
    Sample(SensorSample),
    Gps(GpsFix),
}

impl SessionItem {
    pub fn timestamp(&self) -> u64 {
        match self {
            SessionItem::Sample(s) => s.timestamp,
            SessionItem::Gps(f) => f.timestamp,
        }
    }
}

/// Per-stream, timestamp-ordered, append-only sample store.
///
/// Equal timestamps are accepted; a timestamp older than the stream's last
/// one is refused so the batch pass never sees a negative interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionBuffer {
    accel: Vec<SensorSample>,
    gyro: Vec<SensorSample>,
    mag: Vec<SensorSample>,
    gps: Vec<GpsFix>,
}

impl SessionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from recorded streams, checking kinds and ordering.
    pub fn from_samples<I, G>(samples: I, fixes: G) -> FusionResult<Self>
    where
        I: IntoIterator<Item = SensorSample>,
        G: IntoIterator<Item = GpsFix>,
    {
        let mut buffer = Self::new();
        for sample in samples {
            buffer.push_sample(sample)?;
        }
        for fix in fixes {
            buffer.push_gps(fix)?;
        }
        Ok(buffer)
    }

    pub fn push_sample(&mut self, sample: SensorSample) -> FusionResult<()> {
        let stream = match sample.kind {
            SensorKind::Accel => &mut self.accel,
            SensorKind::Gyro => &mut self.gyro,
            SensorKind::Mag => &mut self.mag,
        };
        if let Some(last) = stream.last() {
            if sample.timestamp < last.timestamp {
                warn!(
                    "[session] {} sample out of order: {} after {}",
                    sample.kind, sample.timestamp, last.timestamp
                );
                return Err(FusionError::NonMonotonicTimestamp {
                    stream: sample.kind.label().to_string(),
                    previous: last.timestamp,
                    current: sample.timestamp,
                });
            }
        }
        stream.push(sample);
        Ok(())
    }

    pub fn push_gps(&mut self, fix: GpsFix) -> FusionResult<()> {
        if let Some(last) = self.gps.last() {
            if fix.timestamp < last.timestamp {
                warn!("[session] GPS fix out of order: {} after {}", fix.timestamp, last.timestamp);
                return Err(FusionError::NonMonotonicTimestamp {
                    stream: "GPS".to_string(),
                    previous: last.timestamp,
                    current: fix.timestamp,
                });
            }
        }
        self.gps.push(fix);
        Ok(())
    }

    pub fn accel(&self) -> &[SensorSample] {
        &self.accel
    }

    pub fn gyro(&self) -> &[SensorSample] {
        &self.gyro
    }

    pub fn mag(&self) -> &[SensorSample] {
        &self.mag
    }

    pub fn gps(&self) -> &[GpsFix] {
        &self.gps
    }

    pub fn sample_count(&self) -> usize {
        self.accel.len() + self.gyro.len() + self.mag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0 && self.gps.is_empty()
    }

    pub fn clear(&mut self) {
        self.accel.clear();
        self.gyro.clear();
        self.mag.clear();
        self.gps.clear();
    }

    /// All streams merged by timestamp. Ties keep accel, gyro, mag, GPS order.
    pub fn chronological(&self) -> Vec<SessionItem> {
        let mut items: Vec<SessionItem> = self
            .accel
            .iter()
            .chain(&self.gyro)
            .chain(&self.mag)
            .map(|s| SessionItem::Sample(*s))
            .chain(self.gps.iter().map(|f| SessionItem::Gps(*f)))
            .collect();
        // stable: ties keep stream order
        items.sort_by_key(|item| item.timestamp());
        items
    }
}

/// One recording: lifecycle, buffered raw data and the live fusion state.
pub struct Session {
    metadata: SessionMetadata,
    buffer: SessionBuffer,
    fusion: SensorFusion,
    first_fix: Option<GpsFix>,
}

impl Session {
    /// Create new session in Idle state
    pub fn new(config: FusionConfig) -> Self {
        Self {
            metadata: SessionMetadata::new(SessionState::Idle),
            buffer: SessionBuffer::new(),
            fusion: SensorFusion::new(config),
            first_fix: None,
        }
    }

    /// Idle → Recording. Clears buffers and zeroes the navigation state.
    pub fn start_recording(&mut self) -> FusionResult<()> {
        if self.metadata.state == SessionState::Recording {
            return Err(FusionError::AlreadyRecording);
        }
        self.metadata = SessionMetadata::new(SessionState::Recording);
        self.buffer.clear();
        self.fusion.reset();
        self.first_fix = None;
        info!("[session] {} recording started", self.metadata.session_id);
        Ok(())
    }

    /// Recording → Idle. Hands back the buffered streams for the batch pass.
    pub fn stop_recording(&mut self) -> FusionResult<SessionBuffer> {
        if self.metadata.state != SessionState::Recording {
            return Err(FusionError::NotRecording);
        }
        self.metadata.state = SessionState::Idle;
        self.metadata.end_time = Some(Utc::now().to_rfc3339());
        info!(
            "[session] {} recording stopped: {} samples, {} fixes, {:.1} s",
            self.metadata.session_id,
            self.buffer.sample_count(),
            self.buffer.gps().len(),
            self.metadata.duration_ms() as f64 / 1000.0
        );
        self.fusion.log_summary();
        Ok(std::mem::take(&mut self.buffer))
    }

    pub fn state(&self) -> SessionState {
        self.metadata.state
    }

    pub fn is_recording(&self) -> bool {
        self.metadata.state == SessionState::Recording
    }

    /// Buffer and fuse one inertial sample. Ignored while idle.
    pub fn push_sample(&mut self, sample: SensorSample) -> FusionResult<Vec<FusionEvent>> {
        if !self.is_recording() {
            return Ok(Vec::new());
        }
        self.buffer.push_sample(sample)?;
        self.metadata.observe(sample.timestamp);
        let events = self.fusion.feed_sample(&sample);
        self.sync_counts();
        Ok(events)
    }

    /// Buffer and fuse one GPS fix. Ignored while idle.
    pub fn push_gps(&mut self, fix: GpsFix) -> FusionResult<Vec<FusionEvent>> {
        if !self.is_recording() {
            return Ok(Vec::new());
        }
        self.buffer.push_gps(fix)?;
        self.metadata.observe(fix.timestamp);
        let events = self.fusion.feed_gps(&fix);

        if fix.is_valid() {
            let first = *self.first_fix.get_or_insert(fix);
            self.metadata.distance_meters =
                haversine_distance(first.latitude, first.longitude, fix.latitude, fix.longitude);
        }
        self.sync_counts();
        Ok(events)
    }

    fn sync_counts(&mut self) {
        let stats = self.fusion.stats();
        self.metadata.accel_sample_count = stats.accel_samples;
        self.metadata.gyro_sample_count = stats.gyro_samples;
        self.metadata.mag_sample_count = stats.mag_samples;
        self.metadata.gps_accepted = stats.gps_accepted;
        self.metadata.gps_rejected = stats.gps_rejected;
        self.metadata.records_emitted = stats.records_emitted;
        self.metadata.sink_errors = stats.sink_errors;
    }

    /// Count a live record the output sink refused.
    pub fn record_sink_error(&mut self) {
        self.fusion.record_sink_error();
        self.sync_counts();
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn buffer(&self) -> &SessionBuffer {
        &self.buffer
    }

    pub fn fusion(&self) -> &SensorFusion {
        &self.fusion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_session_state_transitions() {
        let mut session = Session::new(FusionConfig::default());
        assert_eq!(session.state(), SessionState::Idle);

        session.start_recording().unwrap();
        assert!(session.is_recording());

        let buffer = session.stop_recording().unwrap();
        assert!(buffer.is_empty());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.metadata().end_time.is_some());
    }

    #[test]
    fn test_invalid_state_transitions() {
        let mut session = Session::new(FusionConfig::default());
        assert!(matches!(session.stop_recording(), Err(FusionError::NotRecording)));
        session.start_recording().unwrap();
        assert!(matches!(session.start_recording(), Err(FusionError::AlreadyRecording)));
    }

    #[test]
    fn test_samples_ignored_while_idle() {
        let mut session = Session::new(FusionConfig::default());
        let events = session.push_sample(SensorSample::accel(0, 0.0, 0.0, 9.81)).unwrap();
        assert!(events.is_empty());
        assert!(session.buffer().is_empty());
    }

    #[test]
    fn test_start_resets_state() {
        let mut session = Session::new(FusionConfig::default());
        session.start_recording().unwrap();
        session.push_gps(GpsFix::new(0, 47.0, 8.0, 400.0)).unwrap();
        for i in 0..20u64 {
            session.push_sample(SensorSample::accel(i * 10, 2.0, 0.0, 9.81)).unwrap();
        }
        assert!(session.fusion().state().position.x > 0.0);
        session.stop_recording().unwrap();

        session.start_recording().unwrap();
        assert_eq!(session.fusion().state().position, Vec3::zeros());
        assert!(session.fusion().reference().is_none());
        assert!(session.buffer().is_empty());
        assert_eq!(session.metadata().accel_sample_count, 0);
    }

    #[test]
    fn test_out_of_order_sample_refused() {
        let mut buffer = SessionBuffer::new();
        buffer.push_sample(SensorSample::gyro(100, 0.0, 0.0, 0.0)).unwrap();
        buffer.push_sample(SensorSample::gyro(100, 0.0, 0.0, 0.0)).unwrap();
        // other streams keep their own order
        buffer.push_sample(SensorSample::accel(10, 0.0, 0.0, 9.81)).unwrap();
        let err = buffer.push_sample(SensorSample::gyro(90, 0.0, 0.0, 0.0)).unwrap_err();
        assert!(matches!(
            err,
            FusionError::NonMonotonicTimestamp { previous: 100, current: 90, .. }
        ));
        assert_eq!(buffer.gyro().len(), 2);
    }

    #[test]
    fn test_chronological_merge() {
        let buffer = SessionBuffer::from_samples(
            vec![
                SensorSample::accel(0, 0.0, 0.0, 9.81),
                SensorSample::accel(20, 0.0, 0.0, 9.81),
                SensorSample::gyro(10, 0.0, 0.0, 0.0),
                SensorSample::mag(20, 1.0, 0.0, 0.0),
            ],
            vec![GpsFix::new(15, 1.0, 1.0, 0.0)],
        )
        .unwrap();
        let order: Vec<u64> = buffer.chronological().iter().map(|i| i.timestamp()).collect();
        assert_eq!(order, vec![0, 10, 15, 20, 20]);
        assert!(matches!(buffer.chronological()[3], SessionItem::Sample(s) if s.kind == SensorKind::Accel));
    }

    #[test]
    fn test_metadata_stats() {
        let mut session = Session::new(FusionConfig::default());
        session.start_recording().unwrap();
        session.push_gps(GpsFix::new(1000, 0.0, 0.0, 0.0)).unwrap();
        session.push_gps(GpsFix::new(2000, 10.0, 20.0, 0.0)).unwrap();
        session.push_gps(GpsFix::new(3000, 10.001, 20.0, 0.0)).unwrap();
        session.push_sample(SensorSample::mag(500, 20.0, 0.0, -40.0)).unwrap();

        let meta = session.metadata();
        assert_eq!(meta.gps_accepted, 2);
        assert_eq!(meta.gps_rejected, 1);
        assert_eq!(meta.mag_sample_count, 1);
        assert_eq!(meta.duration_ms(), 2500);
        assert_abs_diff_eq!(meta.distance_meters, 111.19, epsilon = 0.01);
    }
}
