//! End-to-end capture sessions against the mock transport.
//!
//! These run the real event pump thread, ring and retriever; only the USB
//! stack is simulated.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use uvc_capture::mock::{MockDevice, MockFault, MockTransport, TestPattern, CID_GAIN};
use uvc_capture::traits::{DecodedImage, Decoder};
use uvc_capture::validation::{validate_color_bars, validate_frame_sequence};
use uvc_capture::{
    BandwidthFactor, CameraError, CaptureSession, ImageDecoder, Mode, PixelFormat, RangePolicy,
    RawFrame, RecoveryConfig, SessionConfig, SessionState,
};

const VGA_YUYV: Mode = Mode::new(640, 480, 30, PixelFormat::Yuyv);

fn fast_config() -> SessionConfig {
    SessionConfig {
        poll_interval_ms: 5,
        robust_poll_timeout_ms: 200,
        ..SessionConfig::default()
    }
}

fn camera() -> MockDevice {
    MockDevice::new("mock-0").with_frame_interval(Duration::from_millis(5))
}

fn open(device: &MockDevice, config: SessionConfig) -> CaptureSession {
    let transport = Arc::new(MockTransport::new(vec![device.clone()]));
    let mut session = CaptureSession::new(transport, config);
    session.open(device.descriptor()).expect("open should succeed");
    assert_eq!(session.state(), SessionState::Negotiating);
    session
}

fn factor(value: f32) -> BandwidthFactor {
    BandwidthFactor::new(value).expect("valid factor")
}

#[test]
fn test_vga_capture_with_headroom() {
    let device = camera();
    let mut session = open(&device, fast_config());
    session
        .set_mode(VGA_YUYV, factor(1.3))
        .expect("640x480 YUYV fits with 30% headroom");
    let params = session.negotiated().expect("negotiated params");
    assert_eq!(params.alt_setting, 11);
    assert_eq!(params.required_bytes_per_interval, 2996);

    let mut frames: Vec<RawFrame> = Vec::new();
    for _ in 0..10 {
        let frame = session.get_frame_robust().expect("frame should arrive");
        assert_eq!(frame.bytes_used(), 640 * 480 * 2);
        assert!(frame.received_fully());
        frames.push(frame.clone());
    }
    validate_frame_sequence(&frames).expect("sequence numbers strictly increase");
    validate_color_bars(&frames[0]).expect("mock streams color bars");

    let stats = session.stats();
    assert_eq!(stats.frames_delivered, 10);
    assert_eq!(stats.transient_faults, 0);

    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.get_frame(Duration::ZERO),
        Err(CameraError::Cancelled)
    ));

    let counters = device.counters();
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.closes(), 1);
    assert!(counters.cancellations() >= 1);
}

#[test]
fn test_excess_factor_reports_insufficient_bandwidth() {
    let mut session = open(&camera(), fast_config());
    let err = session
        .set_mode(VGA_YUYV, factor(1.4))
        .expect_err("1.4 exceeds the largest alt-setting");
    assert!(matches!(
        err,
        CameraError::InsufficientBandwidth {
            available: 3060,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Negotiating);

    // Lowering the factor is the remedy
    session.set_mode(VGA_YUYV, factor(1.3)).expect("retry with 1.3");
    assert_eq!(session.state(), SessionState::Streaming);
}

#[test]
fn test_unsupported_mode_keeps_session_negotiating() {
    let mut session = open(&camera(), fast_config());
    let err = session
        .set_mode(Mode::new(3840, 2160, 240, PixelFormat::Yuyv), BandwidthFactor::ONE)
        .expect_err("4K@240 is not in the mode table");
    assert!(matches!(err, CameraError::UnsupportedMode { .. }));
    assert!(err.is_recoverable());
    assert_eq!(session.state(), SessionState::Negotiating);
    assert!(session.available_modes().expect("device is open").contains(&VGA_YUYV));
}

#[test]
fn test_format_commit_failure_faults_session() {
    let device = camera().with_set_format_failure();
    let mut session = open(&device, fast_config());
    let err = session
        .set_mode(VGA_YUYV, factor(1.3))
        .expect_err("device rejects the commit");
    assert!(matches!(err, CameraError::Io(_)));
    assert_eq!(session.state(), SessionState::Faulted);

    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(device.counters().closes(), 1);
}

#[test]
fn test_isolated_stalls_are_absorbed() {
    let device = camera()
        .with_fault_at(1, MockFault::Stall)
        .with_fault_at(2, MockFault::Overrun)
        .with_fault_at(4, MockFault::Stall);
    let mut session = open(&device, fast_config());
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    let mut last = None;
    for _ in 0..5 {
        let sequence = session.get_frame_robust().expect("recovered frame").sequence();
        assert!(last.map_or(true, |prev| sequence > prev));
        last = Some(sequence);
    }
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(device.counters().submits() > 5, "faulted transfers are re-armed");
}

#[test]
fn test_persistent_stalls_fault_the_session() {
    let device = camera().with_persistent_fault(0, MockFault::Stall);
    let config = SessionConfig {
        recovery: RecoveryConfig {
            max_consecutive_failures: 3,
            failure_window_ms: 2000,
        },
        ..fast_config()
    };
    let mut session = open(&device, config);
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    let err = session
        .get_frame_robust()
        .expect_err("every transfer stalls");
    assert!(matches!(err, CameraError::StreamError(_)));
    assert_eq!(session.state(), SessionState::Faulted);
    assert!(session.stats().transient_faults >= 3);

    // Only close helps now
    assert!(matches!(
        session.get_frame(Duration::ZERO),
        Err(CameraError::StreamError(_))
    ));
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(device.counters().closes(), 1);
}

#[test]
fn test_slow_stalled_stream_faults_after_window() {
    let device = MockDevice::new("mock-0")
        .with_frame_interval(Duration::from_millis(60))
        .with_persistent_fault(0, MockFault::Stall);
    let config = SessionConfig {
        recovery: RecoveryConfig {
            max_consecutive_failures: 10,
            failure_window_ms: 100,
        },
        ..fast_config()
    };
    let mut session = open(&device, config);
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    let started = Instant::now();
    let err = session
        .get_frame_robust()
        .expect_err("a stream that only stalls is dead");
    assert!(matches!(err, CameraError::StreamError(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(session.state(), SessionState::Faulted);
    let faults = session.stats().transient_faults;
    assert!((2..10).contains(&faults), "escalated after {faults} faults");
    session.close();
}

#[test]
fn test_disconnect_surfaces_stream_error() {
    let device = camera().with_persistent_fault(3, MockFault::Disconnect);
    let mut session = open(&device, fast_config());
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    let mut delivered = 0;
    let err = loop {
        match session.get_frame_robust() {
            Ok(_) => delivered += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, CameraError::StreamError(_)));
    assert!(delivered <= 3);
    assert_eq!(session.state(), SessionState::Faulted);
}

#[test]
fn test_closer_cancels_blocked_retrieval() {
    let device = MockDevice::new("mock-0").with_frame_interval(Duration::from_secs(60));
    let mut session = open(&device, fast_config());
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    let closer = session.closer();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        closer.close();
    });

    let started = Instant::now();
    let result = session.get_frame(Duration::from_secs(30));
    assert!(matches!(result, Err(CameraError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    canceller.join().expect("canceller thread");

    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.closer().is_closed());
    assert_eq!(device.counters().closes(), 1);
}

#[test]
fn test_close_request_before_set_mode_closes_session() {
    let device = camera();
    let mut session = open(&device, fast_config());
    session.closer().close();

    assert!(matches!(
        session.set_mode(VGA_YUYV, factor(1.3)),
        Err(CameraError::Cancelled)
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.negotiated().is_none());
    assert_eq!(device.counters().submits(), 0);
    assert_eq!(device.counters().closes(), 1);
}

#[test]
fn test_close_request_blocks_control_writes() {
    let device = camera();
    let mut session = open(&device, fast_config());
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");
    let writes_before = device.counters().control_writes();

    session.closer().close();
    assert!(matches!(session.get_control(CID_GAIN), Err(CameraError::Cancelled)));
    assert!(matches!(
        session.set_control(CID_GAIN, 100),
        Err(CameraError::Cancelled)
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(device.counters().control_writes(), writes_before);
    assert_eq!(device.counters().closes(), 1);
}

#[test]
fn test_stale_closer_leaves_reopened_session_alone() {
    let device = camera();
    let mut session = open(&device, fast_config());
    let stale = session.closer();
    session.close();
    assert!(stale.is_closed());

    session.open(device.descriptor()).expect("reopen");
    let current = session.closer();
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    stale.close();
    assert!(!current.is_closed());
    let frame = session
        .get_frame(Duration::from_secs(2))
        .expect("reopened session keeps streaming");
    assert_eq!(frame.width(), 640);
    assert_eq!(session.state(), SessionState::Streaming);

    current.close();
    assert!(matches!(
        session.get_frame(Duration::from_secs(2)),
        Err(CameraError::Cancelled)
    ));
    assert_eq!(device.counters().opens(), 2);
    assert_eq!(device.counters().closes(), 2);
}

#[test]
fn test_timeout_is_recoverable() {
    let device = MockDevice::new("mock-0").with_frame_interval(Duration::from_secs(60));
    let mut session = open(&device, fast_config());
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    let err = session
        .get_frame(Duration::from_millis(20))
        .expect_err("no frame within 20ms");
    assert!(matches!(err, CameraError::Timeout(_)));
    assert!(err.is_recoverable());
    assert_eq!(session.state(), SessionState::Streaming);
}

#[test]
fn test_renegotiation_keeps_sequence_increasing() {
    let mut session = open(&camera(), fast_config());
    session.set_mode(VGA_YUYV, factor(1.3)).expect("first mode");
    let before = session.get_frame_robust().expect("frame").sequence();

    let small = Mode::new(320, 240, 30, PixelFormat::Gray8);
    session.set_mode(small, BandwidthFactor::ONE).expect("second mode");
    let frame = session.get_frame_robust().expect("frame after renegotiation");
    assert_eq!((frame.width(), frame.format()), (320, PixelFormat::Gray8));
    assert!(frame.sequence() > before);
    assert_eq!(frame.bytes_used(), 320 * 240);
}

#[test]
fn test_control_out_of_range_is_rejected() {
    let device = camera();
    let mut session = open(&device, fast_config());
    let err = session
        .set_control(CID_GAIN, 300)
        .expect_err("gain range is 0..=255");
    assert!(matches!(
        err,
        CameraError::ControlOutOfRange {
            value: 300,
            max: 255,
            ..
        }
    ));
    assert_eq!(session.get_control(CID_GAIN).expect("cached gain"), 64);
    assert_eq!(device.control_value(CID_GAIN), Some(64));

    assert_eq!(session.set_control(CID_GAIN, 100).expect("in range"), 100);
    assert_eq!(session.get_control(CID_GAIN).expect("cached gain"), 100);
    assert_eq!(device.control_value(CID_GAIN), Some(100));
    assert_eq!(session.control_by_name("gain").expect("by name").id, CID_GAIN);
}

#[test]
fn test_control_clamp_policy() {
    let device = camera();
    let config = SessionConfig {
        control_range_policy: RangePolicy::Clamp,
        ..fast_config()
    };
    let mut session = open(&device, config);
    assert_eq!(session.set_control(CID_GAIN, 300).expect("clamped"), 255);
    assert_eq!(device.control_value(CID_GAIN), Some(255));
}

#[test]
fn test_failed_control_write_keeps_cached_value() {
    let device = camera().with_failing_control(CID_GAIN);
    let mut session = open(&device, fast_config());
    assert!(matches!(
        session.set_control(CID_GAIN, 10),
        Err(CameraError::ControlError { .. })
    ));
    assert_eq!(session.get_control(CID_GAIN).expect("cached gain"), 64);
    assert!(matches!(
        session.get_control(0xdead),
        Err(CameraError::ControlNotFound(_))
    ));
}

struct CountingDecoder {
    inner: ImageDecoder,
    calls: AtomicUsize,
}

impl Decoder for CountingDecoder {
    fn decode(&self, data: &[u8], width: u32, height: u32) -> uvc_capture::Result<DecodedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(data, width, height)
    }
}

#[test]
fn test_mjpeg_frame_decoded_once() {
    let decoder = Arc::new(CountingDecoder {
        inner: ImageDecoder,
        calls: AtomicUsize::new(0),
    });
    let device = camera().with_pattern(TestPattern::Solid(200, 128, 128));
    let transport = Arc::new(MockTransport::new(vec![device.clone()]));
    let mut session = CaptureSession::new(transport, fast_config())
        .with_decoder(Arc::clone(&decoder) as Arc<dyn Decoder>);
    session.open(device.descriptor()).expect("open");
    session
        .set_mode(Mode::new(640, 480, 30, PixelFormat::Mjpeg), BandwidthFactor::ONE)
        .expect("MJPEG fits");

    let converter = session.converter();
    let frame = session.get_frame_robust().expect("frame");
    let bgr = converter.bgr(frame).expect("decoded color view");
    let [b, g, r] = bgr.pixel(10, 10).expect("pixel in range");
    for channel in [b, g, r] {
        assert!(channel.abs_diff(200) <= 12, "solid gray pixel, got {channel}");
    }
    let mean = converter.gray(frame).expect("gray view").mean();
    assert!((mean - 200.0).abs() < 8.0);
    converter.planar(frame).expect("planar view");

    assert_eq!(decoder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.stats().decode_failures, 0);
}

#[test]
fn test_partial_frame_is_flagged() {
    let device = MockDevice::new("mock-0")
        .with_frame_interval(Duration::from_millis(20))
        .with_fault_at(0, MockFault::Short);
    let mut session = open(&device, fast_config());
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    let converter = session.converter();
    let frame = session.get_frame(Duration::from_secs(2)).expect("partial frame");
    assert_eq!(frame.sequence(), 0);
    assert!(!frame.received_fully());
    assert_eq!(frame.bytes_used(), 640 * 480);
    assert!(matches!(
        converter.gray(frame),
        Err(CameraError::IncompleteFrame { sequence: 0, .. })
    ));

    let frame = session.get_frame(Duration::from_secs(2)).expect("next frame");
    assert!(frame.received_fully());
    assert!(converter.gray(frame).is_ok());
    assert_eq!(session.stats().incomplete_frames, 1);
}

#[test]
fn test_partial_frames_allowed_by_config() {
    let device = MockDevice::new("mock-0")
        .with_frame_interval(Duration::from_millis(20))
        .with_fault_at(0, MockFault::Incomplete);
    let config = SessionConfig {
        allow_partial_frames: true,
        ..fast_config()
    };
    let mut session = open(&device, config);
    session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");

    let converter = session.converter();
    let frame = session.get_frame(Duration::from_secs(2)).expect("partial frame");
    assert!(!frame.received_fully());
    let view = converter
        .to_view(frame, uvc_capture::Representation::Gray)
        .expect("partial frames convert when allowed");
    assert!(!view.is_complete());
    let plane = view.as_gray().expect("gray plane");
    assert_eq!((plane.width(), plane.height()), (640, 480));
    // Missing bottom half reads as zero
    assert_eq!(plane.get(0, 479), Some(0));
}

#[test]
fn test_transport_unavailable() {
    let transport = MockTransport::unavailable();
    assert!(matches!(
        uvc_capture::list_devices(&transport),
        Err(CameraError::TransportUnavailable(_))
    ));
}

#[test]
fn test_open_vanished_device() {
    let device = camera();
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let mut session = CaptureSession::new(transport, fast_config());
    assert!(matches!(
        session.open(device.descriptor()),
        Err(CameraError::DeviceNotFound(_))
    ));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_drop_closes_device() {
    let device = camera();
    {
        let mut session = open(&device, fast_config());
        session.set_mode(VGA_YUYV, factor(1.3)).expect("set_mode");
        session.get_frame_robust().expect("frame");
    }
    assert_eq!(device.counters().closes(), 1);
}
