//! The capture session: open, negotiate, stream, close.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::controls::{Control, ControlRegistry};
use crate::convert::FrameConverter;
use crate::decoder::ImageDecoder;
use crate::error::{CameraError, Result};
use crate::frame::RawFrame;
use crate::modes::ModeTable;
use crate::negotiate::{BandwidthFactor, ModeNegotiator, NegotiatedStreamParams};
use crate::pump::{EventPump, PumpConfig};
use crate::retriever::{FailureTracker, FrameRetriever};
use crate::ring::FrameRing;
use crate::traits::{Decoder, DeviceDescriptor, DeviceHandle, Mode, Transport};

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device is open.
    Closed,
    /// The device is being opened.
    Opening,
    /// The device is open and waiting for a mode.
    Negotiating,
    /// Frames are flowing.
    Streaming,
    /// Resources are being released.
    Closing,
    /// The stream failed; only `close` is useful.
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Negotiating => "negotiating",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Faulted => "faulted",
        })
    }
}

/// Counters over the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames handed to the caller.
    pub frames_delivered: u64,
    /// Faulted transfers absorbed by recovery.
    pub transient_faults: u64,
    /// Frames overwritten in the ring before they were retrieved.
    pub frames_dropped: u64,
    /// Delivered frames that were only partially received.
    pub incomplete_frames: u64,
    /// Frames the decoder rejected.
    pub decode_failures: u64,
}

/// Closes a session from another thread.
///
/// A `get_frame` blocked on the session returns `Cancelled` promptly; the
/// session finishes its cleanup on that call (or on the next call, or when
/// dropped). A closer is bound to the open/close cycle it was taken in and
/// does nothing once the session has been closed and opened again.
#[derive(Debug, Clone)]
pub struct SessionCloser {
    ring: Arc<FrameRing>,
    lifetime: u64,
}

impl SessionCloser {
    /// Request the session to close.
    pub fn close(&self) {
        if !self.ring.cancel_lifetime(self.lifetime) {
            tracing::debug!("close request for an already closed session ignored");
        }
    }

    /// Whether a close was requested, or the session closed since this
    /// handle was taken.
    pub fn is_closed(&self) -> bool {
        self.ring.lifetime() != self.lifetime || self.ring.is_cancelled()
    }
}

struct OpenDevice {
    descriptor: DeviceDescriptor,
    handle: Box<dyn DeviceHandle>,
    controls: ControlRegistry,
    params: Option<NegotiatedStreamParams>,
    pump: Option<EventPump>,
}

/// One open camera and its stream.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use uvc_capture::mock::{MockDevice, MockTransport};
/// use uvc_capture::{BandwidthFactor, CaptureSession, Mode, PixelFormat, SessionConfig};
///
/// # fn main() -> uvc_capture::Result<()> {
/// let transport = Arc::new(MockTransport::new(vec![MockDevice::new("mock-0")]));
/// let device = uvc_capture::list_devices(transport.as_ref())?.remove(0);
///
/// let mut session = CaptureSession::new(transport, SessionConfig::default());
/// session.open(&device)?;
/// session.set_mode(Mode::new(640, 480, 30, PixelFormat::Yuyv), BandwidthFactor::new(1.3)?)?;
/// let frame = session.get_frame(Duration::from_secs(1))?;
/// println!("frame {} ({} bytes)", frame.sequence(), frame.bytes_used());
/// session.close();
/// # Ok(())
/// # }
/// ```
pub struct CaptureSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state: SessionState,
    negotiator: ModeNegotiator,
    converter: FrameConverter,
    ring: Arc<FrameRing>,
    retriever: FrameRetriever,
    sequence: Arc<AtomicU64>,
    device: Option<OpenDevice>,
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state)
            .field("device", &self.device.as_ref().map(|d| d.descriptor.uid.as_str()))
            .field("mode", &self.negotiated().map(|p| p.mode))
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// A closed session on `transport`, decoding MJPEG with [`ImageDecoder`].
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let ring = Arc::new(FrameRing::new(config.ring_capacity, 0));
        let retriever = FrameRetriever::new(
            Arc::clone(&ring),
            FailureTracker::new(
                config.recovery.max_consecutive_failures,
                config.recovery.failure_window(),
            ),
        );
        let converter = FrameConverter::new(Arc::new(ImageDecoder))
            .with_partial_frames(config.allow_partial_frames);
        Self {
            transport,
            negotiator: ModeNegotiator::new().with_host_limit(config.host_bandwidth_limit),
            config,
            state: SessionState::Closed,
            converter,
            ring,
            retriever,
            sequence: Arc::new(AtomicU64::new(0)),
            device: None,
        }
    }

    /// Use another decoder for compressed formats.
    #[must_use]
    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.converter =
            FrameConverter::new(decoder).with_partial_frames(self.config.allow_partial_frames);
        self
    }

    /// Current state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Session configuration.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The open device, if any.
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref().map(|device| &device.descriptor)
    }

    /// Parameters of the current stream.
    pub fn negotiated(&self) -> Option<&NegotiatedStreamParams> {
        self.device.as_ref().and_then(|device| device.params.as_ref())
    }

    /// Open `descriptor`. The session must be closed.
    pub fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(self.invalid("open"));
        }
        self.state = SessionState::Opening;
        self.ring.reopen();

        let mut handle = match self.transport.open(descriptor) {
            Ok(handle) => handle,
            Err(err) => {
                self.state = if matches!(err, CameraError::DeviceNotFound(_)) {
                    SessionState::Closed
                } else {
                    SessionState::Faulted
                };
                tracing::warn!(device = %descriptor, error = %err, "failed to open device");
                return Err(err);
            }
        };

        let mut controls =
            ControlRegistry::from_descriptors(&descriptor.controls, self.config.control_range_policy);
        controls.load_current(handle.as_mut());

        self.device = Some(OpenDevice {
            descriptor: descriptor.clone(),
            handle,
            controls,
            params: None,
            pump: None,
        });
        self.state = SessionState::Negotiating;
        tracing::info!(device = %descriptor, "device opened");
        Ok(())
    }

    /// Negotiate `mode` and start streaming it.
    ///
    /// A running stream is stopped and drained first. Negotiation failures
    /// leave the session in `Negotiating`; transport failures while
    /// committing the format fault the session.
    pub fn set_mode(&mut self, mode: Mode, factor: BandwidthFactor) -> Result<()> {
        self.take_close_request()?;
        match self.state {
            SessionState::Negotiating => {}
            SessionState::Streaming => self.stop_stream(),
            _ => return Err(self.invalid("set_mode")),
        }

        let Some(device) = self.device.as_mut() else {
            return Err(self.invalid("set_mode"));
        };

        let params = self.negotiator.negotiate(&device.descriptor, &mode, factor)?;
        if let Err(err) = start_stream(
            device,
            &params,
            &self.ring,
            &self.sequence,
            &self.config,
        ) {
            if !err.is_recoverable() {
                tracing::warn!(%mode, error = %err, "stream start failed");
                self.state = SessionState::Faulted;
            }
            return Err(err);
        }

        self.retriever.reset_failures();
        self.state = SessionState::Streaming;
        tracing::info!(
            %mode,
            alt_setting = params.alt_setting,
            packet_size = params.packet_size,
            "streaming"
        );
        Ok(())
    }

    /// Modes the open device supports.
    pub fn available_modes(&self) -> Result<&ModeTable> {
        self.device
            .as_ref()
            .map(|device| &device.descriptor.modes)
            .ok_or_else(|| self.invalid("available_modes"))
    }

    /// Next frame, waiting at most `timeout`.
    ///
    /// The previous frame is released. The returned reference is valid until
    /// the next retrieval; clone the frame to keep it.
    pub fn get_frame(&mut self, timeout: Duration) -> Result<&RawFrame> {
        self.check_streaming("get_frame")?;
        if let Err(err) = self.retriever.wait_next(Some(timeout)) {
            return Err(self.on_retrieval_error(err));
        }
        self.current_frame()
    }

    /// Next frame, retrying timeouts until a frame arrives, the stream
    /// fails or the session is closed.
    pub fn get_frame_robust(&mut self) -> Result<&RawFrame> {
        let slice = self.config.robust_poll_timeout();
        loop {
            self.check_streaming("get_frame_robust")?;
            match self.retriever.wait_next(Some(slice)) {
                Ok(_) => break,
                Err(CameraError::Timeout(waited)) => {
                    tracing::debug!(?waited, "no frame yet, retrying");
                }
                Err(err) => return Err(self.on_retrieval_error(err)),
            }
        }
        self.current_frame()
    }

    /// Release the held frame before the next retrieval.
    pub fn release_frame(&mut self) {
        self.retriever.release();
    }

    /// All controls with their cached values.
    pub fn controls(&self) -> Result<&[Control]> {
        Ok(self.open_device("controls")?.controls.list())
    }

    /// Control by identifier.
    pub fn control(&self, id: u32) -> Result<&Control> {
        self.open_device("control")?.controls.get(id)
    }

    /// Control by display name.
    pub fn control_by_name(&self, name: &str) -> Result<&Control> {
        self.open_device("control_by_name")?.controls.find_by_name(name)
    }

    /// Cached value of a control.
    pub fn get_control(&self, id: u32) -> Result<i64> {
        self.open_device("get_control")?.controls.get_value(id)
    }

    /// Write a control; returns the committed value.
    pub fn set_control(&mut self, id: u32, value: i64) -> Result<i64> {
        let device = self.open_device_mut("set_control")?;
        device.controls.set_value(device.handle.as_mut(), id, value)
    }

    /// Re-read a control from the device.
    pub fn refresh_control(&mut self, id: u32) -> Result<i64> {
        let device = self.open_device_mut("refresh_control")?;
        device.controls.refresh(device.handle.as_mut(), id)
    }

    /// Converter for frames of this session. Clones share the decode
    /// failure counter with the session.
    pub fn converter(&self) -> FrameConverter {
        self.converter.clone()
    }

    /// Handle that closes this session from another thread.
    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            ring: Arc::clone(&self.ring),
            lifetime: self.ring.lifetime(),
        }
    }

    /// Session counters.
    pub fn stats(&self) -> SessionStats {
        let counters = self.retriever.counters();
        SessionStats {
            frames_delivered: counters.delivered,
            transient_faults: counters.transient_faults,
            frames_dropped: self.ring.stats().dropped,
            incomplete_frames: counters.incomplete,
            decode_failures: self.converter.decode_failures(),
        }
    }

    /// Stop streaming, release the device and reach `Closed`.
    ///
    /// Safe to call repeatedly and from `Faulted`.
    pub fn close(&mut self) {
        self.ring.cancel();
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(mut device) = self.device.take() {
            if let Some(mut pump) = device.pump.take() {
                pump.stop();
            }
            self.retriever.release();
            device.handle.close();
            tracing::info!(device = %device.descriptor, "device closed");
        }
        self.ring.retire();
        self.state = SessionState::Closed;
    }

    /// Finish a close requested through a [`SessionCloser`].
    fn take_close_request(&mut self) -> Result<()> {
        if self.ring.is_cancelled() && self.state != SessionState::Closed {
            self.close();
            return Err(CameraError::Cancelled);
        }
        Ok(())
    }

    fn current_frame(&self) -> Result<&RawFrame> {
        self.retriever
            .current()
            .ok_or_else(|| CameraError::StreamError("no frame held".to_owned()))
    }

    fn check_streaming(&mut self, operation: &'static str) -> Result<()> {
        self.take_close_request()?;
        match self.state {
            SessionState::Streaming => Ok(()),
            SessionState::Closed | SessionState::Closing => Err(CameraError::Cancelled),
            SessionState::Faulted => Err(CameraError::StreamError(
                "session is faulted; close and reopen it".to_owned(),
            )),
            SessionState::Opening | SessionState::Negotiating => Err(self.invalid(operation)),
        }
    }

    fn on_retrieval_error(&mut self, err: CameraError) -> CameraError {
        match &err {
            CameraError::Cancelled => self.close(),
            CameraError::StreamError(reason) => {
                tracing::warn!(%reason, "stream failed, session faulted");
                self.stop_stream();
                self.state = SessionState::Faulted;
            }
            _ => {}
        }
        err
    }

    /// Stop the pump and drain the ring, keeping the device open.
    fn stop_stream(&mut self) {
        if let Some(device) = self.device.as_mut() {
            if let Some(mut pump) = device.pump.take() {
                pump.stop();
            }
            device.params = None;
        }
        self.retriever.release();
        self.ring.reset(0);
        self.state = SessionState::Negotiating;
    }

    fn open_device(&self, operation: &'static str) -> Result<&OpenDevice> {
        if self.ring.is_cancelled() && self.state != SessionState::Closed {
            return Err(CameraError::Cancelled);
        }
        match (self.state, self.device.as_ref()) {
            (SessionState::Negotiating | SessionState::Streaming, Some(device)) => Ok(device),
            _ => Err(self.invalid(operation)),
        }
    }

    fn open_device_mut(&mut self, operation: &'static str) -> Result<&mut OpenDevice> {
        self.take_close_request()?;
        let state = self.state;
        match (state, self.device.as_mut()) {
            (SessionState::Negotiating | SessionState::Streaming, Some(device)) => Ok(device),
            _ => Err(CameraError::InvalidState { operation, state }),
        }
    }

    const fn invalid(&self, operation: &'static str) -> CameraError {
        CameraError::InvalidState {
            operation,
            state: self.state,
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Commit `params` on the device and start the pump.
fn start_stream(
    device: &mut OpenDevice,
    params: &NegotiatedStreamParams,
    ring: &Arc<FrameRing>,
    sequence: &Arc<AtomicU64>,
    config: &SessionConfig,
) -> Result<()> {
    device.handle.set_format(params)?;
    ring.reset(params.max_frame_bytes as usize);
    let queue = device
        .handle
        .start_transfers(params, config.transfers_in_flight)?;
    let pump = EventPump::start(
        queue,
        params,
        Arc::clone(ring),
        Arc::clone(sequence),
        PumpConfig {
            transfers: config.transfers_in_flight,
            poll_interval: config.poll_interval(),
        },
    )?;
    device.params = Some(*params);
    device.pump = Some(pump);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockTransport};
    use crate::traits::PixelFormat;

    fn session() -> (CaptureSession, DeviceDescriptor) {
        let device = MockDevice::new("mock-0").with_frame_interval(Duration::from_millis(2));
        let descriptor = device.descriptor().clone();
        let transport = Arc::new(MockTransport::new(vec![device]));
        let config = SessionConfig {
            poll_interval_ms: 5,
            ..SessionConfig::default()
        };
        (CaptureSession::new(transport, config), descriptor)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Negotiating.to_string(), "negotiating");
        assert_eq!(SessionState::Faulted.to_string(), "faulted");
    }

    #[test]
    fn test_set_mode_requires_open_device() {
        let (mut session, _) = session();
        let err = session
            .set_mode(Mode::new(640, 480, 30, PixelFormat::Yuyv), BandwidthFactor::ONE)
            .expect_err("session is closed");
        assert_eq!(err.to_string(), "set_mode is not valid while the session is closed");
        assert!(matches!(session.get_frame(Duration::ZERO), Err(CameraError::Cancelled)));
    }

    #[test]
    fn test_get_frame_before_mode_is_invalid() {
        let (mut session, descriptor) = session();
        session.open(&descriptor).expect("open");
        assert!(matches!(
            session.get_frame(Duration::ZERO),
            Err(CameraError::InvalidState {
                state: SessionState::Negotiating,
                ..
            })
        ));
        assert!(matches!(
            session.open(&descriptor),
            Err(CameraError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_insufficient_bandwidth_stays_negotiating() {
        let (mut session, descriptor) = session();
        session.open(&descriptor).expect("open");
        let err = session
            .set_mode(Mode::new(1280, 720, 30, PixelFormat::Yuyv), BandwidthFactor::ONE)
            .expect_err("720p YUYV does not fit");
        assert!(matches!(err, CameraError::InsufficientBandwidth { .. }));
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(session.negotiated().is_none());
    }

    #[test]
    fn test_stream_and_close() {
        let (mut session, descriptor) = session();
        session.open(&descriptor).expect("open");
        session
            .set_mode(Mode::new(320, 240, 30, PixelFormat::Yuyv), BandwidthFactor::ONE)
            .expect("set_mode");
        assert_eq!(session.state(), SessionState::Streaming);

        let frame = session.get_frame(Duration::from_secs(2)).expect("frame");
        assert_eq!((frame.width(), frame.height()), (320, 240));
        assert!(frame.received_fully());

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.controls().is_err());
    }
}
