/// "Emit if elapsed ≥ interval" gate for live output records.
///
/// Works on sample timestamps, not wall-clock time, so replays produce the
/// same output as live capture.
#[derive(Clone, Debug)]
pub struct OutputGate {
    interval_ms: u64,
    last_emit: Option<u64>,
}

impl OutputGate {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms, last_emit: None }
    }

    /// True (and the gate re-arms) when at least `interval_ms` has elapsed
    /// since the last emission. A timestamp older than the last emission
    /// never passes.
    pub fn ready(&mut self, timestamp: u64) -> bool {
        let open = match self.last_emit {
            None => true,
            Some(last) => timestamp >= last && timestamp - last >= self.interval_ms,
        };
        if open {
            self.last_emit = Some(timestamp);
        }
        open
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_limits_rate() {
        let mut gate = OutputGate::new(10);
        let passed: Vec<u64> = (0..50u64).map(|i| i * 2).filter(|&ts| gate.ready(ts)).collect();
        assert_eq!(passed, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);
    }

    #[test]
    fn test_zero_interval_passes_everything() {
        let mut gate = OutputGate::new(0);
        assert!(gate.ready(5));
        assert!(gate.ready(5));
        assert!(gate.ready(6));
    }

    #[test]
    fn test_backwards_timestamp_blocked() {
        let mut gate = OutputGate::new(10);
        assert!(gate.ready(100));
        assert!(!gate.ready(50));
        assert!(gate.ready(110));
        gate.reset();
        assert!(gate.ready(0));
    }
}
