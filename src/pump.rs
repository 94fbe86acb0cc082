//! Background worker moving completed transfers into the frame ring.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::frame::FrameMetadata;
use crate::negotiate::NegotiatedStreamParams;
use crate::ring::FrameRing;
use crate::traits::{Mode, TransferQueue, TransferStatus};

const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Tuning of the pump loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PumpConfig {
    /// Transfers kept in flight.
    pub transfers: usize,
    /// Longest single wait for a completion before re-checking the stop flag.
    pub poll_interval: Duration,
}

/// Handle to the running pump thread.
#[derive(Debug)]
pub(crate) struct EventPump {
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Submit the initial transfers and spawn the pump thread.
    pub fn start(
        mut queue: Box<dyn TransferQueue>,
        params: &NegotiatedStreamParams,
        ring: Arc<FrameRing>,
        sequence: Arc<AtomicU64>,
        config: PumpConfig,
    ) -> Result<Self> {
        for _ in 0..config.transfers.max(1) {
            if let Err(err) = queue.submit() {
                if let Err(cancel_err) = queue.cancel_all() {
                    tracing::warn!(error = %cancel_err, "failed to cancel submitted transfers");
                }
                return Err(err);
            }
        }

        let stop_signal = Arc::new(AtomicBool::new(false));
        let worker = PumpWorker {
            queue,
            ring,
            sequence,
            stop_signal: Arc::clone(&stop_signal),
            mode: params.mode,
            max_frame_bytes: params.max_frame_bytes as usize,
            poll_interval: config.poll_interval,
        };

        let thread = thread::Builder::new()
            .name(format!("uvc-pump-{}x{}", params.mode.width, params.mode.height))
            .spawn(move || worker.run())?;

        Ok(Self {
            stop_signal,
            thread: Some(thread),
        })
    }

    /// Whether the pump thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to stop and wait until it has cancelled every
    /// outstanding transfer.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::warn!("event pump thread panicked");
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PumpWorker {
    queue: Box<dyn TransferQueue>,
    ring: Arc<FrameRing>,
    sequence: Arc<AtomicU64>,
    stop_signal: Arc<AtomicBool>,
    mode: Mode,
    max_frame_bytes: usize,
    poll_interval: Duration,
}

impl PumpWorker {
    fn run(mut self) {
        tracing::info!(mode = %self.mode, "event pump started");

        while !self.stop_signal.load(Ordering::SeqCst) && !self.ring.is_cancelled() {
            if let Err(err) = self.pump_once() {
                tracing::warn!(error = %err, "transport failed, stopping stream");
                self.ring.fail(err.to_string());
                break;
            }
        }

        if let Err(err) = self.queue.cancel_all() {
            tracing::warn!(error = %err, "failed to cancel outstanding transfers");
        }
        tracing::info!(mode = %self.mode, "event pump stopped");
    }

    fn pump_once(&mut self) -> Result<()> {
        let Some(completion) = self.queue.wait_completion(self.poll_interval)? else {
            return Ok(());
        };

        let status = completion.status;
        let payload = completion
            .data
            .get(..self.max_frame_bytes)
            .unwrap_or(completion.data);
        let truncated = payload.len() < completion.data.len();
        let fault = status.is_fault().then_some(status);

        let metadata = FrameMetadata {
            width: self.mode.width,
            height: self.mode.height,
            format: self.mode.format,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: completion.timestamp,
            bytes_used: payload.len(),
            received_fully: status == TransferStatus::Completed
                && !truncated
                && is_complete_payload(&self.mode, payload),
        };
        if !metadata.received_fully && fault.is_none() {
            tracing::debug!(
                sequence = metadata.sequence,
                bytes = payload.len(),
                "partial frame received"
            );
        }
        self.ring.push(payload, metadata, fault);

        if let Some(status) = fault {
            tracing::debug!(?status, "re-arming transfer after transient fault");
            self.queue.rearm()
        } else {
            self.queue.submit()
        }
    }
}

/// Whether a payload carries a whole frame of `mode`.
///
/// Uncompressed frames must match the format's frame size exactly; MJPEG
/// frames must end with the JPEG end-of-image marker (trailing zero
/// padding is ignored).
pub(crate) fn is_complete_payload(mode: &Mode, payload: &[u8]) -> bool {
    match mode.format.frame_bytes(mode.width, mode.height) {
        Some(expected) => payload.len() == expected,
        None => {
            let end = payload
                .iter()
                .rposition(|&byte| byte != 0)
                .map_or(0, |last| last + 1);
            payload.get(..end).is_some_and(|data| data.ends_with(&JPEG_EOI))
        }
    }
}
