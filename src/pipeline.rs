// pipeline.rs: Single-owner async fusion task
//
// All samples and fixes flow through one ordered channel into one task that
// owns the Session (and with it the NavigationState). No locks: the task is
// the only writer, so a GPS fix landing between two inertial samples always
// sees a whole state.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::batch::{BatchOutput, BatchRecompute};
use crate::error::{FusionError, FusionResult};
use crate::sensor_fusion::{FusionConfig, FusionEvent};
use crate::session::{Session, SessionItem, SessionMetadata};
use crate::types::{GpsFix, PositionRecord, SensorSample, TrajectoryRecord};

// ─── Output sink ─────────────────────────────────────────────────────────────

/// Downstream persistence for fused output.
pub trait RecordSink: Send {
    /// One rate-limited live record.
    fn append(&mut self, record: &PositionRecord) -> FusionResult<()>;

    /// Replace everything written for the session with the corrected trajectory.
    fn replace_all(&mut self, trajectory: &[TrajectoryRecord]) -> FusionResult<()>;
}

/// Keeps everything in memory; used by tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub live: Vec<PositionRecord>,
    pub corrected: Vec<TrajectoryRecord>,
    pub replacements: usize,
}

impl RecordSink for MemorySink {
    fn append(&mut self, record: &PositionRecord) -> FusionResult<()> {
        self.live.push(*record);
        Ok(())
    }

    fn replace_all(&mut self, trajectory: &[TrajectoryRecord]) -> FusionResult<()> {
        self.corrected = trajectory.to_vec();
        self.replacements += 1;
        Ok(())
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionInput {
    Start,
    Sample(SensorSample),
    Gps(GpsFix),
    /// End the recording and run the batch pass
    Stop,
}

impl From<SessionItem> for FusionInput {
    fn from(item: SessionItem) -> Self {
        match item {
            SessionItem::Sample(s) => FusionInput::Sample(s),
            SessionItem::Gps(f) => FusionInput::Gps(f),
        }
    }
}

/// What one recording produced.
#[derive(Clone, Debug)]
pub struct SessionReport {
    pub metadata: SessionMetadata,
    /// `None` when the batch pass was cancelled
    pub batch: Option<BatchOutput>,
}

pub struct PipelineOutcome<S> {
    pub sink: S,
    pub sessions: Vec<SessionReport>,
}

// ─── Handle ──────────────────────────────────────────────────────────────────

pub struct FusionHandle<S> {
    tx: mpsc::Sender<FusionInput>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<FusionResult<PipelineOutcome<S>>>,
}

impl<S: RecordSink + 'static> FusionHandle<S> {
    pub async fn send(&self, input: FusionInput) -> FusionResult<()> {
        self.tx.send(input).await.map_err(|_| FusionError::ChannelClosed)
    }

    pub async fn start(&self) -> FusionResult<()> {
        self.send(FusionInput::Start).await
    }

    pub async fn sample(&self, sample: SensorSample) -> FusionResult<()> {
        self.send(FusionInput::Sample(sample)).await
    }

    pub async fn gps(&self, fix: GpsFix) -> FusionResult<()> {
        self.send(FusionInput::Gps(fix)).await
    }

    pub async fn stop(&self) -> FusionResult<()> {
        self.send(FusionInput::Stop).await
    }

    /// Abort the batch pass in flight, or the next one if none is running.
    /// The request is consumed by that one pass.
    pub fn cancel_batch(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Close the input side and wait for the task. A recording still open is
    /// stopped (and batch-corrected) first.
    pub async fn shutdown(self) -> FusionResult<PipelineOutcome<S>> {
        drop(self.tx);
        self.task.await.map_err(|e| {
            warn!("[pipeline] fusion task failed: {}", e);
            FusionError::ChannelClosed
        })?
    }
}

/// Spawn the fusion task on the current tokio runtime.
pub fn spawn_fusion<S: RecordSink + 'static>(config: FusionConfig, sink: S) -> FusionHandle<S> {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let cancel = Arc::new(AtomicBool::new(false));
    let actor = FusionActor {
        session: Session::new(config.clone()),
        batch: BatchRecompute::new(&config),
        sink,
        cancel: Arc::clone(&cancel),
        sessions: Vec::new(),
    };
    let task = tokio::spawn(actor.run(rx));
    FusionHandle { tx, cancel, task }
}

// ─── Actor ───────────────────────────────────────────────────────────────────

struct FusionActor<S> {
    session: Session,
    batch: BatchRecompute,
    sink: S,
    cancel: Arc<AtomicBool>,
    sessions: Vec<SessionReport>,
}

impl<S: RecordSink + 'static> FusionActor<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<FusionInput>) -> FusionResult<PipelineOutcome<S>> {
        while let Some(input) = rx.recv().await {
            match input {
                FusionInput::Start => {
                    if let Err(e) = self.session.start_recording() {
                        warn!("[pipeline] start ignored: {}", e);
                    }
                }
                FusionInput::Sample(sample) => {
                    let events = self.session.push_sample(sample);
                    self.dispatch(events);
                }
                FusionInput::Gps(fix) => {
                    let events = self.session.push_gps(fix);
                    self.dispatch(events);
                }
                FusionInput::Stop => self.finish().await?,
            }
        }

        if self.session.is_recording() {
            info!("[pipeline] input closed while recording, stopping");
            self.finish().await?;
        }
        Ok(PipelineOutcome { sink: self.sink, sessions: self.sessions })
    }

    /// Forward live records to the sink. Neither rejected input nor a failed
    /// write stops the session.
    fn dispatch(&mut self, events: FusionResult<Vec<FusionEvent>>) {
        let events = match events {
            Ok(events) => events,
            Err(e) => {
                warn!("[pipeline] dropped input: {}", e);
                return;
            }
        };
        for event in events {
            if let FusionEvent::PositionOutput(record) = event {
                if let Err(e) = self.sink.append(&record) {
                    warn!("[pipeline] live record @{} not written: {}", record.timestamp, e);
                    self.session.record_sink_error();
                }
            }
        }
    }

    async fn finish(&mut self) -> FusionResult<()> {
        let buffer = match self.session.stop_recording() {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("[pipeline] stop ignored: {}", e);
                return Ok(());
            }
        };

        let batch = self.batch.clone();
        let cancel = Arc::clone(&self.cancel);
        let result = tokio::task::spawn_blocking(move || batch.run_cancellable(&buffer, &cancel))
            .await
            .map_err(|e| FusionError::Sink(format!("batch task failed: {}", e)))?;
        self.cancel.store(false, Ordering::Relaxed);

        let batch = match result {
            Ok(output) => {
                if let Err(e) = self.sink.replace_all(&output.trajectory) {
                    warn!("[pipeline] corrected trajectory not written: {}", e);
                    self.session.record_sink_error();
                }
                Some(output)
            }
            Err(FusionError::Cancelled) => {
                warn!("[pipeline] batch pass cancelled; live output kept");
                None
            }
            Err(e) => return Err(e),
        };
        self.sessions.push(SessionReport { metadata: self.session.metadata().clone(), batch });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_replaces_live_output() {
        let handle = spawn_fusion(FusionConfig::default(), MemorySink::default());
        handle.start().await.unwrap();
        for i in 0..100u64 {
            handle.sample(SensorSample::accel(i * 5, 0.0, 0.0, 9.81)).await.unwrap();
        }
        handle.stop().await.unwrap();
        let outcome = handle.shutdown().await.unwrap();

        assert_eq!(outcome.sink.live.len(), 50);
        assert_eq!(outcome.sink.corrected.len(), 100);
        assert_eq!(outcome.sink.replacements, 1);
        assert_eq!(outcome.sessions.len(), 1);
        assert!(outcome.sessions[0].batch.is_some());
    }

    #[tokio::test]
    async fn test_samples_before_start_ignored() {
        let handle = spawn_fusion(FusionConfig::default(), MemorySink::default());
        handle.sample(SensorSample::accel(0, 0.0, 0.0, 9.81)).await.unwrap();
        handle.sample(SensorSample::accel(50, 0.0, 0.0, 9.81)).await.unwrap();
        let outcome = handle.shutdown().await.unwrap();
        assert!(outcome.sink.live.is_empty());
        assert!(outcome.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_while_recording_runs_batch() {
        let handle = spawn_fusion(FusionConfig::default(), MemorySink::default());
        handle.start().await.unwrap();
        handle.sample(SensorSample::accel(0, 0.0, 0.0, 9.81)).await.unwrap();
        handle.sample(SensorSample::accel(10, 0.0, 0.0, 9.81)).await.unwrap();
        let outcome = handle.shutdown().await.unwrap();
        assert_eq!(outcome.sessions.len(), 1);
        assert_eq!(outcome.sink.corrected.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_batch_keeps_live_output() {
        let handle = spawn_fusion(FusionConfig::default(), MemorySink::default());
        handle.start().await.unwrap();
        for i in 0..10u64 {
            handle.sample(SensorSample::accel(i * 20, 0.5, 0.0, 9.81)).await.unwrap();
        }
        handle.cancel_batch();
        handle.stop().await.unwrap();
        let outcome = handle.shutdown().await.unwrap();
        assert_eq!(outcome.sink.replacements, 0);
        assert_eq!(outcome.sink.live.len(), 9);
        assert!(outcome.sessions[0].batch.is_none());
    }

    /// Refuses the first `failures` writes of each kind.
    #[derive(Default)]
    struct FlakySink {
        inner: MemorySink,
        append_failures: usize,
        replace_failures: usize,
    }

    impl RecordSink for FlakySink {
        fn append(&mut self, record: &PositionRecord) -> FusionResult<()> {
            if self.append_failures > 0 {
                self.append_failures -= 1;
                return Err(FusionError::Sink("disk full".to_string()));
            }
            self.inner.append(record)
        }

        fn replace_all(&mut self, trajectory: &[TrajectoryRecord]) -> FusionResult<()> {
            if self.replace_failures > 0 {
                self.replace_failures -= 1;
                return Err(FusionError::Sink("disk full".to_string()));
            }
            self.inner.replace_all(trajectory)
        }
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_end_session() {
        let sink = FlakySink { append_failures: 1, ..FlakySink::default() };
        let handle = spawn_fusion(FusionConfig::default(), sink);
        handle.start().await.unwrap();
        for i in 0..100u64 {
            handle.sample(SensorSample::accel(i * 10, 0.0, 0.0, 9.81)).await.unwrap();
        }
        handle.stop().await.unwrap();
        let outcome = handle.shutdown().await.unwrap();

        assert_eq!(outcome.sink.inner.live.len(), 98);
        assert_eq!(outcome.sink.inner.corrected.len(), 100);
        let report = &outcome.sessions[0];
        assert!(report.batch.is_some());
        assert_eq!(report.metadata.sink_errors, 1);
        assert_eq!(report.metadata.accel_sample_count, 100);
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_report() {
        let sink = FlakySink { replace_failures: 1, ..FlakySink::default() };
        let handle = spawn_fusion(FusionConfig::default(), sink);
        handle.start().await.unwrap();
        handle.sample(SensorSample::accel(0, 0.0, 0.0, 9.81)).await.unwrap();
        handle.sample(SensorSample::accel(10, 0.0, 0.0, 9.81)).await.unwrap();
        handle.stop().await.unwrap();
        let outcome = handle.shutdown().await.unwrap();

        assert!(outcome.sink.inner.corrected.is_empty());
        assert!(outcome.sessions[0].batch.is_some());
        assert_eq!(outcome.sessions[0].metadata.sink_errors, 1);
    }

    #[tokio::test]
    async fn test_cancel_applies_to_one_recording() {
        let handle = spawn_fusion(FusionConfig::default(), MemorySink::default());
        handle.start().await.unwrap();
        handle.sample(SensorSample::accel(0, 0.0, 0.0, 9.81)).await.unwrap();
        handle.cancel_batch();
        handle.stop().await.unwrap();

        handle.start().await.unwrap();
        for i in 0..5u64 {
            handle.sample(SensorSample::accel(i * 10, 0.0, 0.0, 9.81)).await.unwrap();
        }
        handle.stop().await.unwrap();
        let outcome = handle.shutdown().await.unwrap();

        assert_eq!(outcome.sessions.len(), 2);
        assert!(outcome.sessions[0].batch.is_none());
        assert!(outcome.sessions[1].batch.is_some());
        assert_eq!(outcome.sink.replacements, 1);
        assert_eq!(outcome.sink.corrected.len(), 5);
    }

    #[tokio::test]
    async fn test_out_of_order_sample_does_not_stop_pipeline() {
        let handle = spawn_fusion(FusionConfig::default(), MemorySink::default());
        handle.start().await.unwrap();
        handle.sample(SensorSample::accel(100, 0.0, 0.0, 9.81)).await.unwrap();
        handle.sample(SensorSample::accel(50, 0.0, 0.0, 9.81)).await.unwrap();
        handle.sample(SensorSample::accel(200, 0.0, 0.0, 9.81)).await.unwrap();
        handle.stop().await.unwrap();
        let outcome = handle.shutdown().await.unwrap();
        assert_eq!(outcome.sink.corrected.len(), 2);
        assert_eq!(outcome.sessions[0].metadata.accel_sample_count, 2);
    }
}
