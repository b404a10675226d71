//! Rate-limited progress reporting for a single transfer.
//!
//! Progress messages are advisory, but Git LFS reads them line by line while
//! the transfer runs, so they go through the same [`ResultWriter`] channel as
//! results instead of touching stdout directly.
//!
//! [`ResultWriter`]: crate::writer::ResultWriter

use crossbeam_channel::Sender;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::messages::ProgressMessage;
use crate::writer::WriterMessage;

/// Thresholds deciding when a progress update is worth emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressGate {
    pub min_interval: Duration,
    pub min_bytes: u64,
}

impl Default for ProgressGate {
    fn default() -> Self {
        ProgressGate {
            min_interval: Duration::from_millis(200),
            min_bytes: 256 * 1024,
        }
    }
}

impl ProgressGate {
    /// Whether a non-forced update should go out now.
    ///
    /// `elapsed` is `None` before the first emission.
    fn allows(&self, elapsed: Option<Duration>, since_last: u64, so_far: u64, total: u64) -> bool {
        let interval_ok = elapsed.map_or(true, |e| e >= self.min_interval);
        let reached_total = total > 0 && so_far >= total;
        (interval_ok && since_last >= self.min_bytes) || reached_total
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    bytes_so_far: u64,
    last_emitted: u64,
    last_emit: Option<Instant>,
}

/// Progress tracker bound to one in-flight object.
///
/// `report` may be called from an I/O callback on another thread than the one
/// that calls `finalize`; all state sits behind one mutex, and the send to the
/// writer happens while it is held so updates for an object stay ordered.
pub struct ProgressReporter {
    oid: String,
    size: u64,
    gate: ProgressGate,
    sink: Sender<WriterMessage>,
    state: Mutex<ProgressState>,
}

impl ProgressReporter {
    pub fn new(oid: impl Into<String>, size: u64, gate: ProgressGate, sink: Sender<WriterMessage>) -> Self {
        ProgressReporter {
            oid: oid.into(),
            size,
            gate,
            sink,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Record `delta` more bytes. Returns whether an update was emitted.
    ///
    /// Zero and negative deltas are ignored.
    pub fn report(&self, delta: i64) -> bool {
        if delta <= 0 {
            return false;
        }
        let mut state = self.lock();
        state.bytes_so_far = state.bytes_so_far.saturating_add(delta as u64);
        self.maybe_emit(&mut state, false)
    }

    /// Force the running total to the declared size (when known) and emit
    /// whatever has not been reported yet.
    pub fn finalize(&self) -> bool {
        let mut state = self.lock();
        if self.size > 0 {
            state.bytes_so_far = self.size;
        }
        self.maybe_emit(&mut state, true)
    }

    /// Bytes recorded so far.
    pub fn bytes_so_far(&self) -> u64 {
        self.lock().bytes_so_far
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        // A poisoned lock only means another reporter call panicked; the
        // counters themselves are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn maybe_emit(&self, state: &mut ProgressState, force: bool) -> bool {
        if state.bytes_so_far <= state.last_emitted {
            return false;
        }
        let since_last = state.bytes_so_far - state.last_emitted;

        if !force {
            let elapsed = state.last_emit.map(|t| t.elapsed());
            if !self.gate.allows(elapsed, since_last, state.bytes_so_far, self.size) {
                return false;
            }
        }

        let message = ProgressMessage::new(self.oid.clone(), state.bytes_so_far, since_last);
        if self.sink.send(WriterMessage::Progress(message)).is_err() {
            tracing::debug!(oid = %self.oid, "result writer gone, dropping progress update");
            return false;
        }
        state.last_emitted = state.bytes_so_far;
        state.last_emit = Some(Instant::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::sync::Arc;
    use std::thread;

    fn drain(rx: &Receiver<WriterMessage>) -> Vec<ProgressMessage> {
        rx.try_iter()
            .filter_map(|m| match m {
                WriterMessage::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_zero_and_negative_deltas_never_emit() {
        let (tx, rx) = unbounded();
        let gate = ProgressGate {
            min_interval: Duration::ZERO,
            min_bytes: 0,
        };
        let reporter = ProgressReporter::new("oid", 100, gate, tx);

        assert!(!reporter.report(0));
        assert!(!reporter.report(-5));
        assert_eq!(reporter.bytes_so_far(), 0);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_coalesces_bursts_and_finalizes_to_size() {
        let (tx, rx) = unbounded();
        let total: u64 = 1_000_000;
        let reporter = ProgressReporter::new("oid", total, ProgressGate::default(), tx);

        let chunk = 3_333i64;
        let mut sent = 0u64;
        for _ in 0..300 {
            let delta = chunk.min((total - sent) as i64);
            reporter.report(delta);
            sent += delta as u64;
        }
        // 300 * 3333 = 999_900, leaving the tail for finalize.
        reporter.finalize();

        let messages = drain(&rx);
        assert!(!messages.is_empty());
        assert!(messages.len() < 30, "too many updates: {}", messages.len());

        let mut previous = 0;
        for m in &messages {
            assert!(m.bytes_so_far >= previous);
            assert!(m.bytes_since_last > 0);
            assert_eq!(m.bytes_so_far - previous, m.bytes_since_last);
            previous = m.bytes_so_far;
        }
        assert_eq!(messages.last().unwrap().bytes_so_far, total);
    }

    #[test]
    fn test_reaching_total_emits_immediately() {
        let (tx, rx) = unbounded();
        let gate = ProgressGate {
            min_interval: Duration::from_secs(3600),
            min_bytes: u64::MAX,
        };
        let reporter = ProgressReporter::new("oid", 10, gate, tx);

        assert!(!reporter.report(4));
        assert!(reporter.report(6));
        // Nothing left for finalize to say.
        assert!(!reporter.finalize());

        let messages = drain(&rx);
        assert_eq!(messages, vec![ProgressMessage::new("oid", 10, 10)]);
    }

    #[test]
    fn test_finalize_with_unknown_size_flushes_remainder() {
        let (tx, rx) = unbounded();
        let gate = ProgressGate {
            min_interval: Duration::from_secs(3600),
            min_bytes: 1024,
        };
        let reporter = ProgressReporter::new("oid", 0, gate, tx);

        assert!(reporter.report(2048));
        assert!(!reporter.report(10));
        assert!(reporter.finalize());

        let messages = drain(&rx);
        assert_eq!(
            messages,
            vec![
                ProgressMessage::new("oid", 2048, 2048),
                ProgressMessage::new("oid", 2058, 10)
            ]
        );
    }

    #[test]
    fn test_interval_gate() {
        let (tx, rx) = unbounded();
        let gate = ProgressGate {
            min_interval: Duration::from_millis(50),
            min_bytes: 1,
        };
        let reporter = ProgressReporter::new("oid", 0, gate, tx);

        assert!(reporter.report(1));
        assert!(!reporter.report(1));
        thread::sleep(Duration::from_millis(60));
        assert!(reporter.report(1));
        assert_eq!(drain(&rx).len(), 2);
    }

    #[test]
    fn test_concurrent_reports_stay_monotonic() {
        let (tx, rx) = unbounded();
        let gate = ProgressGate {
            min_interval: Duration::ZERO,
            min_bytes: 0,
        };
        let reporter = Arc::new(ProgressReporter::new("oid", 4 * 1000, gate, tx));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reporter = Arc::clone(&reporter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        reporter.report(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        reporter.finalize();

        let messages = drain(&rx);
        let mut previous = 0;
        let mut total_delta = 0;
        for m in &messages {
            assert!(m.bytes_so_far > previous);
            previous = m.bytes_so_far;
            total_delta += m.bytes_since_last;
        }
        assert_eq!(previous, 4000);
        assert_eq!(total_delta, 4000);
    }
}
