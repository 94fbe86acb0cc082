//! Pull side of the ring: ordered delivery with transient-fault recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CameraError, Result};
use crate::frame::RawFrame;
use crate::ring::{FrameRing, Popped};

/// Run of consecutive transfer faults. Only a good frame ends a run.
#[derive(Debug, Clone)]
pub(crate) struct FailureTracker {
    threshold: usize,
    window: Duration,
    count: usize,
    started: Option<Instant>,
}

impl FailureTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            count: 0,
            started: None,
        }
    }

    /// Record a fault at `now`. Returns `true` once the run reaches
    /// `threshold` faults or has lasted for the whole window.
    pub fn record(&mut self, now: Instant) -> bool {
        let started = *self.started.get_or_insert(now);
        self.count += 1;
        self.count >= self.threshold || now.saturating_duration_since(started) >= self.window
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.started = None;
    }

    pub const fn len(&self) -> usize {
        self.count
    }
}

/// Counters kept by the retriever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RetrievalCounters {
    pub delivered: u64,
    pub transient_faults: u64,
    pub incomplete: u64,
}

#[derive(Debug)]
pub(crate) struct FrameRetriever {
    ring: Arc<FrameRing>,
    current: Option<(usize, RawFrame)>,
    failures: FailureTracker,
    last_sequence: Option<u64>,
    counters: RetrievalCounters,
}

impl FrameRetriever {
    pub fn new(ring: Arc<FrameRing>, failures: FailureTracker) -> Self {
        Self {
            ring,
            current: None,
            failures,
            last_sequence: None,
            counters: RetrievalCounters::default(),
        }
    }

    /// Wait for the next good frame, releasing the previous one first.
    ///
    /// `None` waits forever (until cancellation or failure). Faulted slots
    /// are recycled and counted; enough of them in a row escalate to
    /// `StreamError`. Returns the sequence number of the frame now held.
    pub fn wait_next(&mut self, timeout: Option<Duration>) -> Result<u64> {
        self.release();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let ready = match self.ring.pop(deadline) {
                Popped::Frame(ready) => ready,
                Popped::TimedOut => return Err(CameraError::Timeout(timeout.unwrap_or_default())),
                Popped::Cancelled => return Err(CameraError::Cancelled),
                Popped::Failed(reason) => return Err(CameraError::StreamError(reason)),
            };
            let sequence = ready.frame.sequence();

            if let Some(status) = ready.fault {
                self.ring.release(ready.index, ready.frame);
                self.counters.transient_faults += 1;
                if self.failures.record(Instant::now()) {
                    let count = self.failures.len();
                    tracing::warn!(count, ?status, "too many consecutive transfer faults");
                    return Err(CameraError::StreamError(format!(
                        "{count} consecutive transfer faults (last: {status:?}) within {:?}",
                        self.failures.window
                    )));
                }
                tracing::debug!(sequence, ?status, "skipping faulted frame");
                continue;
            }

            if self.last_sequence.is_some_and(|last| sequence <= last) {
                tracing::debug!(sequence, "discarding out-of-order frame");
                self.ring.release(ready.index, ready.frame);
                continue;
            }
            if let Some(last) = self.last_sequence {
                if sequence > last + 1 {
                    tracing::debug!(skipped = sequence - last - 1, "frames dropped before delivery");
                }
            }

            self.failures.reset();
            self.last_sequence = Some(sequence);
            self.counters.delivered += 1;
            if !ready.frame.received_fully() {
                self.counters.incomplete += 1;
            }
            self.current = Some((ready.index, ready.frame));
            return Ok(sequence);
        }
    }

    /// The frame handed out by the last successful `wait_next`.
    pub fn current(&self) -> Option<&RawFrame> {
        self.current.as_ref().map(|(_, frame)| frame)
    }

    /// Return the held frame to the ring.
    pub fn release(&mut self) {
        if let Some((index, frame)) = self.current.take() {
            self.ring.release(index, frame);
        }
    }

    /// Forget the fault streak, e.g. after a stream restart.
    pub fn reset_failures(&mut self) {
        self.failures.reset();
    }

    pub const fn counters(&self) -> RetrievalCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMetadata;
    use crate::traits::TransferStatus;

    fn meta(sequence: u64) -> FrameMetadata {
        FrameMetadata {
            sequence,
            received_fully: true,
            ..FrameMetadata::default()
        }
    }

    fn retriever(threshold: usize) -> (FrameRetriever, Arc<FrameRing>) {
        let ring = Arc::new(FrameRing::new(8, 16));
        let retriever = FrameRetriever::new(
            Arc::clone(&ring),
            FailureTracker::new(threshold, Duration::from_secs(2)),
        );
        (retriever, ring)
    }

    const NOW: Option<Duration> = Some(Duration::ZERO);

    #[test]
    fn test_failure_tracker_threshold() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new(3, Duration::from_secs(2));
        assert!(!tracker.record(start));
        assert!(!tracker.record(start + Duration::from_millis(50)));
        assert!(tracker.record(start + Duration::from_millis(100)));
        tracker.reset();
        assert_eq!(tracker.len(), 0);
        assert!(!tracker.record(start + Duration::from_millis(150)));
    }

    #[test]
    fn test_failure_tracker_run_outlasting_window() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new(10, Duration::from_millis(100));
        assert!(!tracker.record(start));
        assert!(!tracker.record(start + Duration::from_millis(60)));
        // Slow faults still belong to the same run
        assert!(tracker.record(start + Duration::from_millis(120)));
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn test_good_frame_restarts_run_timer() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new(10, Duration::from_millis(100));
        assert!(!tracker.record(start));
        tracker.reset();
        assert!(!tracker.record(start + Duration::from_millis(150)));
        assert!(!tracker.record(start + Duration::from_millis(200)));
    }

    #[test]
    fn test_delivers_in_order_and_releases_previous() {
        let (mut retriever, ring) = retriever(3);
        ring.push(&[1], meta(0), None);
        ring.push(&[2], meta(1), None);

        assert_eq!(retriever.wait_next(NOW).expect("first frame"), 0);
        assert_eq!(retriever.current().expect("held").data(), &[1]);
        assert_eq!(retriever.wait_next(NOW).expect("second frame"), 1);
        assert!(matches!(retriever.wait_next(NOW), Err(CameraError::Timeout(_))));
        assert!(retriever.current().is_none());
        assert_eq!(retriever.counters().delivered, 2);
    }

    #[test]
    fn test_transient_faults_are_absorbed() {
        let (mut retriever, ring) = retriever(3);
        ring.push(&[], meta(0), Some(TransferStatus::Overrun));
        ring.push(&[], meta(1), Some(TransferStatus::Stall));
        ring.push(&[5], meta(2), None);

        assert_eq!(retriever.wait_next(NOW).expect("good frame"), 2);
        assert_eq!(retriever.counters().transient_faults, 2);
        assert_eq!(retriever.failures.len(), 0);
    }

    #[test]
    fn test_consecutive_faults_escalate() {
        let (mut retriever, ring) = retriever(3);
        for seq in 0..3 {
            ring.push(&[], meta(seq), Some(TransferStatus::Stall));
        }
        ring.push(&[5], meta(3), None);
        let err = retriever.wait_next(NOW).expect_err("three stalls in a row");
        assert!(matches!(err, CameraError::StreamError(_)));
        assert!(err.is_fatal_to_session());
    }

    #[test]
    fn test_good_frame_breaks_streak() {
        let (mut retriever, ring) = retriever(3);
        for seq in 0..6 {
            let fault = (seq % 3 != 2).then_some(TransferStatus::Stall);
            ring.push(&[], meta(seq), fault);
        }
        assert_eq!(retriever.wait_next(NOW).expect("frame 2"), 2);
        assert_eq!(retriever.wait_next(NOW).expect("frame 5"), 5);
    }

    #[test]
    fn test_stale_sequence_never_redelivered() {
        let (mut retriever, ring) = retriever(3);
        ring.push(&[1], meta(4), None);
        ring.push(&[1], meta(4), None);
        ring.push(&[1], meta(2), None);
        ring.push(&[1], meta(7), None);
        assert_eq!(retriever.wait_next(NOW).expect("frame 4"), 4);
        assert_eq!(retriever.wait_next(NOW).expect("frame 7"), 7);
    }

    #[test]
    fn test_cancel_and_failure_map_to_errors() {
        let (mut retriever, ring) = retriever(3);
        ring.fail("babble".to_owned());
        assert!(matches!(
            retriever.wait_next(NOW),
            Err(CameraError::StreamError(reason)) if reason == "babble"
        ));
        ring.cancel();
        assert!(matches!(retriever.wait_next(None), Err(CameraError::Cancelled)));
    }

    #[test]
    fn test_incomplete_frames_are_counted() {
        let (mut retriever, ring) = retriever(3);
        ring.push(
            &[1],
            FrameMetadata {
                received_fully: false,
                ..meta(0)
            },
            None,
        );
        retriever.wait_next(NOW).expect("partial frame is still delivered");
        assert!(!retriever.current().expect("held").received_fully());
        assert_eq!(retriever.counters().incomplete, 1);
    }
}
