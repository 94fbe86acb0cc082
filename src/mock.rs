//! In-memory transport for testing without hardware.
//!
//! `MockDevice` describes a camera (modes, alt-settings, controls) and how
//! its stream misbehaves; `MockTransport` enumerates and opens such cameras.
//! Frames carry synthetic test patterns in the negotiated pixel format.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::convert::yuv_to_rgb;
use crate::error::{CameraError, Result};
use crate::frame::{time_monotonic, FrameMetadata, RawFrame};
use crate::modes::{ModeEntry, ModeTable};
use crate::negotiate::NegotiatedStreamParams;
use crate::traits::{
    AltSetting, Completion, ControlDescriptor, ControlKind, ControlRequest, DeviceDescriptor,
    DeviceHandle, MenuEntry, Mode, PixelFormat, TransferQueue, TransferStatus, Transport,
    UsbSpeed,
};

/// `V4L2_CID_EXPOSURE_AUTO`.
pub const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
/// `V4L2_CID_EXPOSURE_ABSOLUTE`.
pub const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
/// `V4L2_CID_FOCUS_ABSOLUTE`.
pub const CID_FOCUS_ABSOLUTE: u32 = 0x009a_090a;
/// `V4L2_CID_GAIN`.
pub const CID_GAIN: u32 = 0x0098_0913;

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// A scripted transfer outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// Endpoint stall, no payload.
    Stall,
    /// Isochronous overrun, no payload.
    Overrun,
    /// Half a frame, reported incomplete by the transport.
    Incomplete,
    /// Half a frame, reported as completed.
    Short,
    /// The device vanishes; the transfer queue fails from now on.
    Disconnect,
}

/// Call counters shared by every clone of a mock device.
#[derive(Debug, Default)]
pub struct MockCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    set_formats: AtomicUsize,
    submits: AtomicUsize,
    cancellations: AtomicUsize,
    control_writes: AtomicUsize,
}

impl MockCounters {
    /// Successful `open` calls.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Handles closed (each handle counts once).
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Committed formats.
    pub fn set_formats(&self) -> usize {
        self.set_formats.load(Ordering::SeqCst)
    }

    /// Transfer submissions, re-arms included.
    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// `cancel_all` calls.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    /// Control writes that reached the device.
    pub fn control_writes(&self) -> usize {
        self.control_writes.load(Ordering::SeqCst)
    }
}

/// Per-stream fault script, indexed by frame number within a stream.
#[derive(Debug, Clone, Default)]
struct FaultScript {
    at: BTreeMap<u64, MockFault>,
    from: Option<(u64, MockFault)>,
}

impl FaultScript {
    fn fault_for(&self, index: u64) -> Option<MockFault> {
        self.at.get(&index).copied().or_else(|| {
            self.from
                .filter(|(start, _)| index >= *start)
                .map(|(_, fault)| fault)
        })
    }
}

/// Mock camera for testing without hardware.
#[derive(Debug, Clone)]
pub struct MockDevice {
    descriptor: DeviceDescriptor,
    pattern: TestPattern,
    frame_interval: Option<Duration>,
    faults: FaultScript,
    failing_controls: Vec<u32>,
    fail_set_format: bool,
    values: Arc<Mutex<HashMap<u32, i64>>>,
    counters: Arc<MockCounters>,
}

impl MockDevice {
    /// A high-speed USB 2.0 camera with a typical mode table and controls.
    #[must_use]
    pub fn new(uid: &str) -> Self {
        let controls = default_controls();
        let values = controls.iter().map(|c| (c.id, c.default)).collect();
        Self {
            descriptor: DeviceDescriptor {
                uid: uid.to_owned(),
                name: "Mock Camera".to_owned(),
                manufacturer: Some("Mock Devices Inc.".to_owned()),
                vendor_id: 0x1d6b,
                product_id: 0x0102,
                serial_number: Some(format!("MOCK-{uid}")),
                bus_number: 1,
                device_address: 2,
                location: format!("mock:{uid}"),
                speed: UsbSpeed::High,
                alt_settings: AltSetting::usb2_high_speed(),
                modes: default_modes(),
                controls,
            },
            pattern: TestPattern::ColorBars,
            frame_interval: None,
            faults: FaultScript::default(),
            failing_controls: Vec::new(),
            fail_set_format: false,
            values: Arc::new(Mutex::new(values)),
            counters: Arc::new(MockCounters::default()),
        }
    }

    /// Set the product name.
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.descriptor.name = name.to_owned();
        self
    }

    /// Replace the mode table.
    #[must_use]
    pub fn with_modes(mut self, modes: ModeTable) -> Self {
        self.descriptor.modes = modes;
        self
    }

    /// Replace the streaming interface's alt-settings (empty for bulk).
    #[must_use]
    pub fn with_alt_settings(mut self, alt_settings: Vec<AltSetting>) -> Self {
        self.descriptor.alt_settings = alt_settings;
        self
    }

    /// Replace the controls; current values start at their defaults.
    #[must_use]
    pub fn with_controls(mut self, controls: Vec<ControlDescriptor>) -> Self {
        let values = controls.iter().map(|c| (c.id, c.default)).collect();
        self.values = Arc::new(Mutex::new(values));
        self.descriptor.controls = controls;
        self
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Deliver frames at this interval instead of the mode's frame rate.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Make frame `index` of every stream fail with `fault`.
    #[must_use]
    pub fn with_fault_at(mut self, index: u64, fault: MockFault) -> Self {
        self.faults.at.insert(index, fault);
        self
    }

    /// Make every frame from `index` on fail with `fault`.
    #[must_use]
    pub const fn with_persistent_fault(mut self, index: u64, fault: MockFault) -> Self {
        self.faults.from = Some((index, fault));
        self
    }

    /// Make writes to control `id` fail.
    #[must_use]
    pub fn with_failing_control(mut self, id: u32) -> Self {
        self.failing_controls.push(id);
        self
    }

    /// Make committing a format fail with an I/O error.
    #[must_use]
    pub const fn with_set_format_failure(mut self) -> Self {
        self.fail_set_format = true;
        self
    }

    /// The descriptor enumeration reports.
    pub const fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Call counters.
    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    /// Value the device currently holds for a control.
    pub fn control_value(&self, id: u32) -> Option<i64> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }
}

/// Transport serving a fixed set of mock cameras.
#[derive(Debug)]
pub struct MockTransport {
    devices: Mutex<Vec<MockDevice>>,
    available: bool,
}

impl MockTransport {
    /// Transport with these cameras attached.
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            available: true,
        }
    }

    /// Transport whose USB subsystem cannot be initialized.
    pub fn unavailable() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            available: false,
        }
    }

    /// Hot-plug a camera.
    pub fn attach(&self, device: MockDevice) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(device);
    }

    /// Unplug a camera.
    pub fn detach(&self, uid: &str) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|device| device.descriptor.uid != uid);
    }
}

impl Transport for MockTransport {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        if !self.available {
            return Err(CameraError::TransportUnavailable(
                "mock USB subsystem is disabled".to_owned(),
            ));
        }
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(devices.iter().map(|device| device.descriptor.clone()).collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceHandle>> {
        if !self.available {
            return Err(CameraError::TransportUnavailable(
                "mock USB subsystem is disabled".to_owned(),
            ));
        }
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let device = devices
            .iter()
            .find(|device| device.descriptor.uid == descriptor.uid)
            .ok_or_else(|| CameraError::DeviceNotFound(descriptor.uid.clone()))?;
        device.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle {
            device: device.clone(),
            format: None,
            closed: false,
        }))
    }
}

struct MockHandle {
    device: MockDevice,
    format: Option<NegotiatedStreamParams>,
    closed: bool,
}

impl DeviceHandle for MockHandle {
    fn set_format(&mut self, params: &NegotiatedStreamParams) -> Result<()> {
        if self.closed {
            return Err(CameraError::StreamError("device handle is closed".to_owned()));
        }
        if self.device.fail_set_format {
            return Err(CameraError::Io(std::io::Error::other(
                "SET_CUR(VS_COMMIT) failed: broken pipe",
            )));
        }
        self.device.counters.set_formats.fetch_add(1, Ordering::SeqCst);
        self.format = Some(*params);
        Ok(())
    }

    fn start_transfers(
        &mut self,
        params: &NegotiatedStreamParams,
        transfers: usize,
    ) -> Result<Box<dyn TransferQueue>> {
        if self.format.as_ref() != Some(params) {
            return Err(CameraError::StreamError("format was not committed".to_owned()));
        }
        let mode = params.mode;
        let interval = self
            .device
            .frame_interval
            .or_else(|| mode.fps.frame_interval())
            .unwrap_or(Duration::from_millis(33));
        Ok(Box::new(MockQueue {
            frame: generate_test_frame(&mode, self.device.pattern)?,
            faults: self.device.faults.clone(),
            counters: Arc::clone(&self.device.counters),
            interval,
            next_due: Instant::now() + interval,
            in_flight: 0,
            max_in_flight: transfers.max(1),
            next_index: 0,
            disconnected: false,
        }))
    }

    fn control_transfer(&mut self, request: &ControlRequest) -> Result<i64> {
        let mut values = self
            .device
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *request {
            ControlRequest::Get { id, .. } => {
                values.get(&id).copied().ok_or(CameraError::ControlError {
                    id,
                    reason: "unknown control".to_owned(),
                })
            }
            ControlRequest::Set { id, value, .. } => {
                if self.device.failing_controls.contains(&id) {
                    return Err(CameraError::ControlError {
                        id,
                        reason: "request error: stall".to_owned(),
                    });
                }
                let slot = values.get_mut(&id).ok_or(CameraError::ControlError {
                    id,
                    reason: "unknown control".to_owned(),
                })?;
                *slot = value;
                self.device
                    .counters
                    .control_writes
                    .fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.device.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MockQueue {
    frame: Vec<u8>,
    faults: FaultScript,
    counters: Arc<MockCounters>,
    interval: Duration,
    next_due: Instant,
    in_flight: usize,
    max_in_flight: usize,
    next_index: u64,
    disconnected: bool,
}

impl TransferQueue for MockQueue {
    fn submit(&mut self) -> Result<()> {
        if self.disconnected {
            return Err(CameraError::StreamError("device disconnected".to_owned()));
        }
        self.counters.submits.fetch_add(1, Ordering::SeqCst);
        self.in_flight = (self.in_flight + 1).min(self.max_in_flight);
        Ok(())
    }

    fn wait_completion(&mut self, timeout: Duration) -> Result<Option<Completion<'_>>> {
        if self.disconnected {
            return Err(CameraError::StreamError("device disconnected".to_owned()));
        }
        if self.in_flight == 0 {
            thread::sleep(timeout);
            return Ok(None);
        }

        let wait = self.next_due.saturating_duration_since(Instant::now());
        if wait > timeout {
            thread::sleep(timeout);
            return Ok(None);
        }
        thread::sleep(wait);
        self.next_due += self.interval;
        self.in_flight -= 1;

        let index = self.next_index;
        self.next_index += 1;
        let half = self.frame.len() / 2;
        let (data, status) = match self.faults.fault_for(index) {
            None => (self.frame.as_slice(), TransferStatus::Completed),
            Some(MockFault::Stall) => (&[][..], TransferStatus::Stall),
            Some(MockFault::Overrun) => (&[][..], TransferStatus::Overrun),
            Some(MockFault::Incomplete) => (
                self.frame.get(..half).unwrap_or_default(),
                TransferStatus::Incomplete,
            ),
            Some(MockFault::Short) => (
                self.frame.get(..half).unwrap_or_default(),
                TransferStatus::Completed,
            ),
            Some(MockFault::Disconnect) => {
                self.disconnected = true;
                return Err(CameraError::StreamError("device disconnected".to_owned()));
            }
        };

        Ok(Some(Completion {
            data,
            status,
            timestamp: time_monotonic(),
        }))
    }

    fn cancel_all(&mut self) -> Result<()> {
        self.in_flight = 0;
        self.counters.cancellations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn default_modes() -> ModeTable {
    let uncompressed = [
        Mode::new(640, 480, 30, PixelFormat::Yuyv),
        Mode::new(640, 480, 15, PixelFormat::Yuyv),
        Mode::new(320, 240, 30, PixelFormat::Yuyv),
        Mode::new(320, 240, 30, PixelFormat::Uyvy),
        Mode::new(320, 240, 30, PixelFormat::Nv12),
        Mode::new(320, 240, 30, PixelFormat::Gray8),
        Mode::new(320, 240, 30, PixelFormat::Bgr24),
        Mode::new(320, 240, 30, PixelFormat::Bayer8),
        Mode::new(1280, 720, 30, PixelFormat::Yuyv),
    ];
    // Compressed payloads are budgeted at a quarter of a raw 4:2:2 frame.
    let compressed = [
        Mode::new(640, 480, 30, PixelFormat::Mjpeg),
        Mode::new(1280, 720, 30, PixelFormat::Mjpeg),
    ]
    .map(|mode| ModeEntry::with_max_frame_bytes(mode, mode.width * mode.height / 2));

    ModeTable::new(uncompressed.into_iter().map(ModeEntry::new).chain(compressed))
}

fn default_controls() -> Vec<ControlDescriptor> {
    let integer = |id: u32, name: &str, (min, max, step, default): (i64, i64, i64, i64)| {
        ControlDescriptor {
            id,
            display_name: name.to_owned(),
            kind: ControlKind::Integer,
            min,
            max,
            step,
            default,
            unit: "camera terminal".to_owned(),
            writable: true,
            menu: Vec::new(),
        }
    };
    vec![
        integer(CID_EXPOSURE_ABSOLUTE, "Exposure Time, Absolute", (3, 2047, 1, 250)),
        integer(CID_FOCUS_ABSOLUTE, "Focus, Absolute", (0, 250, 5, 0)),
        ControlDescriptor {
            unit: "processing unit".to_owned(),
            ..integer(CID_GAIN, "Gain", (0, 255, 1, 64))
        },
        ControlDescriptor {
            kind: ControlKind::Menu,
            menu: vec![
                MenuEntry {
                    value: 1,
                    label: "Manual Mode".to_owned(),
                },
                MenuEntry {
                    value: 3,
                    label: "Aperture Priority Mode".to_owned(),
                },
            ],
            ..integer(CID_EXPOSURE_AUTO, "Auto Exposure", (0, 3, 1, 3))
        },
    ]
}

/// SMPTE color bars in YUV: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black.
const COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

const BLACK: (u8, u8, u8) = (16, 128, 128);

/// YUV value of the pattern in column `x`.
fn sample(pattern: TestPattern, x: u32, width: u32) -> (u8, u8, u8) {
    match pattern {
        TestPattern::ColorBars => {
            let bar_width = (width / 8).max(1);
            let bar = (x / bar_width).min(7) as usize;
            COLOR_BARS.get(bar).copied().unwrap_or(BLACK)
        }
        TestPattern::Gradient => {
            #[allow(clippy::cast_possible_truncation)]
            let luma = ((u64::from(x) * 255) / u64::from(width.max(1))) as u8;
            (luma, 128, 128)
        }
        TestPattern::Solid(y, u, v) => (y, u, v),
    }
}

/// Render a complete frame of `mode` showing `pattern`, as the mock camera
/// would deliver it.
pub fn render_frame(mode: &Mode, pattern: TestPattern, sequence: u64) -> Result<RawFrame> {
    let data = generate_test_frame(mode, pattern)?;
    Ok(RawFrame::from_parts(
        data,
        FrameMetadata {
            width: mode.width,
            height: mode.height,
            format: mode.format,
            sequence,
            timestamp: time_monotonic(),
            bytes_used: 0,
            received_fully: true,
        },
    ))
}

/// Generate one frame of `mode` showing `pattern`.
fn generate_test_frame(mode: &Mode, pattern: TestPattern) -> Result<Vec<u8>> {
    let (width, height) = (mode.width, mode.height);
    // Patterns only vary horizontally; build one row and repeat it.
    let columns: Vec<(u8, u8, u8)> = (0..width).map(|x| sample(pattern, x, width)).collect();
    let rows = height as usize;

    let frame = match mode.format {
        PixelFormat::Yuyv | PixelFormat::Uyvy => {
            let mut row = Vec::with_capacity(width as usize * 2);
            for pair in columns.chunks(2) {
                let (y, u, v) = pair.first().copied().unwrap_or(BLACK);
                if mode.format == PixelFormat::Yuyv {
                    row.extend_from_slice(&[y, u, y, v]);
                } else {
                    row.extend_from_slice(&[u, y, v, y]);
                }
            }
            row.repeat(rows)
        }
        PixelFormat::Nv12 => {
            let luma: Vec<u8> = columns.iter().map(|&(y, _, _)| y).collect();
            let chroma: Vec<u8> = columns
                .chunks(2)
                .flat_map(|pair| {
                    let (_, u, v) = pair.first().copied().unwrap_or(BLACK);
                    [u, v]
                })
                .collect();
            let mut frame = luma.repeat(rows);
            frame.extend(chroma.repeat(rows / 2));
            frame
        }
        PixelFormat::Gray8 | PixelFormat::Bayer8 => {
            columns.iter().map(|&(y, _, _)| y).collect::<Vec<_>>().repeat(rows)
        }
        PixelFormat::Bgr24 => columns
            .iter()
            .flat_map(|&(y, u, v)| {
                let (r, g, b) = yuv_to_rgb(y, u, v);
                [b, g, r]
            })
            .collect::<Vec<_>>()
            .repeat(rows),
        PixelFormat::Mjpeg => {
            let rgb = columns
                .iter()
                .flat_map(|&(y, u, v)| {
                    let (r, g, b) = yuv_to_rgb(y, u, v);
                    [r, g, b]
                })
                .collect::<Vec<_>>()
                .repeat(rows);
            let mut jpeg = Vec::new();
            JpegEncoder::new_with_quality(&mut jpeg, 90)
                .encode(&rgb, width, height, ExtendedColorType::Rgb8)
                .map_err(|err| CameraError::StreamError(format!("mock JPEG encode: {err}")))?;
            jpeg
        }
    };
    Ok(frame)
}
