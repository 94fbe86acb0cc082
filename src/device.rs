//! V4L2 transport using the v4l crate.
//!
//! The uvcvideo driver owns the UVC protocol: it selects the alt-setting
//! when streaming starts and keeps its own transfer queue. This backend
//! maps that onto the engine's traits: modes and controls come from the
//! V4L2 enumeration ioctls, USB identity from sysfs, and completions from
//! dequeued mmap buffers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use v4l::buffer::{Flags as BufferFlags, Type};
use v4l::capability::Flags as CapabilityFlags;
use v4l::control::{Control as V4lControl, Description, MenuItem, Type as V4lControlType, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::fraction::Fraction;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CameraError, Result};
use crate::modes::{ModeEntry, ModeTable};
use crate::negotiate::NegotiatedStreamParams;
use crate::traits::{
    AltSetting, Completion, ControlDescriptor, ControlKind, ControlRequest, DeviceDescriptor,
    DeviceHandle, FourCC, FrameRate, MenuEntry, Mode, PixelFormat, TransferQueue,
    TransferStatus, Transport, UsbSpeed,
};

const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

fn io_error(context: &str, err: &io::Error) -> CameraError {
    CameraError::Io(io::Error::new(err.kind(), format!("{context}: {err}")))
}

/// Transport over the kernel's V4L2 capture devices.
#[derive(Debug, Clone)]
pub struct V4l2Transport {
    sysfs_root: PathBuf,
}

impl Default for V4l2Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Transport {
    /// Transport using the standard sysfs location.
    pub fn new() -> Self {
        Self {
            sysfs_root: PathBuf::from(SYSFS_VIDEO4LINUX),
        }
    }

    fn describe(&self, index: usize, path: &Path) -> Result<Option<DeviceDescriptor>> {
        let device = Device::with_path(path).map_err(|err| io_error("open", &err))?;
        let caps = device
            .query_caps()
            .map_err(|err| io_error("VIDIOC_QUERYCAP", &err))?;
        if !caps.capabilities.contains(CapabilityFlags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(CapabilityFlags::STREAMING)
        {
            tracing::debug!(path = %path.display(), "skipping non-capture node");
            return Ok(None);
        }

        let modes = enumerate_modes(&device)?;
        if modes.is_empty() {
            tracing::debug!(path = %path.display(), "skipping node without usable modes");
            return Ok(None);
        }
        let controls = match device.query_controls() {
            Ok(descriptions) => descriptions.iter().filter_map(control_descriptor).collect(),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "no controls");
                Vec::new()
            }
        };

        let usb = self.usb_info(index);
        let speed = usb.as_ref().map_or(UsbSpeed::High, |usb| usb.speed);
        Ok(Some(DeviceDescriptor {
            uid: path.display().to_string(),
            name: caps.card,
            manufacturer: usb.as_ref().and_then(|usb| usb.manufacturer.clone()),
            vendor_id: usb.as_ref().map_or(0, |usb| usb.vendor_id),
            product_id: usb.as_ref().map_or(0, |usb| usb.product_id),
            serial_number: usb.as_ref().and_then(|usb| usb.serial.clone()),
            bus_number: usb.as_ref().map_or(0, |usb| usb.bus_number),
            device_address: usb.as_ref().map_or(0, |usb| usb.device_address),
            location: path.display().to_string(),
            speed,
            // Non-USB nodes (vivid, platform cameras) reserve no bus bandwidth.
            alt_settings: if usb.is_some() {
                alt_settings_for(speed)
            } else {
                Vec::new()
            },
            modes,
            controls,
        }))
    }

    /// USB identity of `/dev/video{index}`, from the interface's parent in sysfs.
    fn usb_info(&self, index: usize) -> Option<UsbInfo> {
        let interface = fs::canonicalize(self.sysfs_root.join(format!("video{index}/device"))).ok()?;
        read_usb_info(interface.parent()?)
    }
}

impl Transport for V4l2Transport {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        if !self.sysfs_root.is_dir() {
            return Err(CameraError::TransportUnavailable(format!(
                "{} not found (is the videodev module loaded?)",
                self.sysfs_root.display()
            )));
        }

        let mut devices = Vec::new();
        for node in v4l::context::enum_devices() {
            match self.describe(node.index(), node.path()) {
                Ok(Some(descriptor)) => devices.push(descriptor),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %node.path().display(), error = %err, "cannot query device");
                }
            }
        }
        Ok(devices)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceHandle>> {
        let device = Device::with_path(&descriptor.location).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(descriptor.uid.clone()),
            _ => io_error(&format!("open {}", descriptor.location), &err),
        })?;
        tracing::debug!(location = %descriptor.location, "opened V4L2 device");
        Ok(Box::new(V4l2Handle {
            device: Some(device),
        }))
    }
}

struct V4l2Handle {
    device: Option<Device>,
}

impl V4l2Handle {
    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CameraError::StreamError("device handle is closed".to_owned()))
    }
}

impl DeviceHandle for V4l2Handle {
    fn set_format(&mut self, params: &NegotiatedStreamParams) -> Result<()> {
        let device = self.device()?;
        let mode = params.mode;
        let mut format = device
            .format()
            .map_err(|err| io_error("VIDIOC_G_FMT", &err))?;
        format.width = mode.width;
        format.height = mode.height;
        format.fourcc = mode.format.fourcc().into();

        let actual = device
            .set_format(&format)
            .map_err(|err| io_error("VIDIOC_S_FMT", &err))?;
        if actual.width != mode.width
            || actual.height != mode.height
            || FourCC::from(actual.fourcc) != mode.format.fourcc()
        {
            return Err(CameraError::UnsupportedMode {
                mode: format!(
                    "{mode} (driver chose {}x{} {})",
                    actual.width,
                    actual.height,
                    FourCC::from(actual.fourcc)
                ),
            });
        }

        // V4L2 expresses the rate as a frame interval
        let interval = Fraction::new(mode.fps.denominator, mode.fps.numerator);
        device
            .set_params(&Parameters::new(interval))
            .map_err(|err| io_error("VIDIOC_S_PARM", &err))?;
        tracing::debug!(%mode, "committed V4L2 format");
        Ok(())
    }

    fn start_transfers(
        &mut self,
        params: &NegotiatedStreamParams,
        transfers: usize,
    ) -> Result<Box<dyn TransferQueue>> {
        let device = self.device()?;
        let count = u32::try_from(transfers.max(2)).unwrap_or(u32::MAX);
        let stream = Stream::with_buffers(device, Type::VideoCapture, count)
            .map_err(|err| io_error("VIDIOC_REQBUFS", &err))?;
        Ok(Box::new(V4l2Queue {
            stream,
            frame_bytes: params.mode.format.frame_bytes(params.mode.width, params.mode.height),
            in_flight: 0,
        }))
    }

    fn control_transfer(&mut self, request: &ControlRequest) -> Result<i64> {
        let device = self.device()?;
        let control_error = |id: u32, err: &io::Error| CameraError::ControlError {
            id,
            reason: err.to_string(),
        };
        match *request {
            ControlRequest::Get { id, .. } => {
                let control = device.control(id).map_err(|err| control_error(id, &err))?;
                match control.value {
                    Value::Integer(value) => Ok(value),
                    Value::Boolean(value) => Ok(i64::from(value)),
                    other => Err(CameraError::ControlError {
                        id,
                        reason: format!("unsupported control value {other:?}"),
                    }),
                }
            }
            ControlRequest::Set { id, kind, value } => {
                let written = match kind {
                    ControlKind::Boolean => Value::Boolean(value != 0),
                    ControlKind::Integer | ControlKind::Menu => Value::Integer(value),
                };
                device
                    .set_control(V4lControl { id, value: written })
                    .map_err(|err| control_error(id, &err))?;
                // The driver may round; report what the device now holds.
                match device.control(id).map(|control| control.value) {
                    Ok(Value::Integer(actual)) => Ok(actual),
                    Ok(Value::Boolean(actual)) => Ok(i64::from(actual)),
                    _ => Ok(value),
                }
            }
        }
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            tracing::debug!("closed V4L2 device");
        }
    }
}

struct V4l2Queue {
    stream: Stream<'static>,
    frame_bytes: Option<usize>,
    in_flight: usize,
}

impl TransferQueue for V4l2Queue {
    // The mmap stream re-queues each buffer on the next dequeue; submitting
    // only opens room for one more completion.
    fn submit(&mut self) -> Result<()> {
        self.in_flight += 1;
        Ok(())
    }

    fn wait_completion(&mut self, timeout: Duration) -> Result<Option<Completion<'_>>> {
        if self.in_flight == 0 {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        self.stream.set_timeout(timeout);
        let (buffer, meta) = match self.stream.next() {
            Ok(dequeued) => dequeued,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(err) => return Err(CameraError::StreamError(format!("VIDIOC_DQBUF: {err}"))),
        };
        self.in_flight -= 1;

        let used = buffer.len().min(meta.bytesused as usize);
        let data = buffer.get(..used).unwrap_or(buffer);
        let status = if meta.flags.contains(BufferFlags::ERROR) {
            TransferStatus::Incomplete
        } else if used == 0 {
            TransferStatus::Overrun
        } else {
            TransferStatus::Completed
        };
        if self.frame_bytes.is_some_and(|expected| used < expected) {
            tracing::trace!(used, sequence = meta.sequence, "short V4L2 buffer");
        }

        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(Some(Completion {
            data,
            status,
            timestamp: Duration::new(secs, nanos),
        }))
    }

    fn cancel_all(&mut self) -> Result<()> {
        self.in_flight = 0;
        self.stream
            .stop()
            .map_err(|err| CameraError::StreamError(format!("VIDIOC_STREAMOFF: {err}")))
    }
}

/// USB identity read from a device directory in sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UsbInfo {
    vendor_id: u16,
    product_id: u16,
    bus_number: u8,
    device_address: u8,
    speed: UsbSpeed,
    manufacturer: Option<String>,
    serial: Option<String>,
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn read_usb_info(dir: &Path) -> Option<UsbInfo> {
    let hex = |name| u16::from_str_radix(&read_attr(dir, name)?, 16).ok();
    Some(UsbInfo {
        vendor_id: hex("idVendor")?,
        product_id: hex("idProduct")?,
        bus_number: read_attr(dir, "busnum")?.parse().ok()?,
        device_address: read_attr(dir, "devnum")?.parse().ok()?,
        speed: match read_attr(dir, "speed").as_deref() {
            Some("1.5" | "12") => UsbSpeed::Full,
            Some("480") | None => UsbSpeed::High,
            Some(_) => UsbSpeed::Super,
        },
        manufacturer: read_attr(dir, "manufacturer"),
        serial: read_attr(dir, "serial"),
    })
}

/// Alt-settings a UVC camera typically exposes at a given bus speed.
fn alt_settings_for(speed: UsbSpeed) -> Vec<AltSetting> {
    match speed {
        UsbSpeed::High => AltSetting::usb2_high_speed(),
        // Full speed caps isochronous packets at 1023 bytes, one per frame.
        UsbSpeed::Full => AltSetting::usb2_high_speed()
            .into_iter()
            .filter(|alt| alt.transactions == 1)
            .collect(),
        // SuperSpeed budgets are far above any UVC mode; treat as unreserved.
        UsbSpeed::Super => Vec::new(),
    }
}

fn enumerate_modes(device: &Device) -> Result<ModeTable> {
    let formats = device
        .enum_formats()
        .map_err(|err| io_error("VIDIOC_ENUM_FMT", &err))?;
    let mut entries = Vec::new();

    for description in formats {
        let Some(format) = PixelFormat::from_fourcc(description.fourcc.into()) else {
            tracing::debug!(fourcc = %FourCC::from(description.fourcc), "skipping unknown format");
            continue;
        };
        let sizes = device
            .enum_framesizes(description.fourcc)
            .map_err(|err| io_error("VIDIOC_ENUM_FRAMESIZES", &err))?;
        for size in sizes {
            let (width, height) = match size.size {
                FrameSizeEnum::Discrete(discrete) => (discrete.width, discrete.height),
                // Stepwise sizes: only the largest is listed.
                FrameSizeEnum::Stepwise(stepwise) => (stepwise.max_width, stepwise.max_height),
            };
            let intervals = device
                .enum_frameintervals(description.fourcc, width, height)
                .map_err(|err| io_error("VIDIOC_ENUM_FRAMEINTERVALS", &err))?;
            for interval in intervals {
                for rate in frame_rates(&interval.interval) {
                    entries.push(ModeEntry::new(Mode {
                        width,
                        height,
                        fps: rate,
                        format,
                    }));
                }
            }
        }
    }
    Ok(ModeTable::new(entries))
}

/// Frame rates offered by an interval descriptor. Stepwise ranges yield
/// their two extremes.
fn frame_rates(interval: &FrameIntervalEnum) -> Vec<FrameRate> {
    let rate = |fraction: &Fraction| FrameRate::new(fraction.denominator, fraction.numerator);
    match interval {
        FrameIntervalEnum::Discrete(fraction) => vec![rate(fraction)],
        FrameIntervalEnum::Stepwise(stepwise) => {
            let fastest = rate(&stepwise.min);
            let slowest = rate(&stepwise.max);
            if fastest == slowest {
                vec![fastest]
            } else {
                vec![fastest, slowest]
            }
        }
    }
}

/// UVC unit of a control, from its V4L2 control class.
fn control_unit(id: u32) -> &'static str {
    match id >> 16 {
        0x009a => "camera terminal",
        0x0098 => "processing unit",
        _ => "extension unit",
    }
}

fn control_descriptor(description: &Description) -> Option<ControlDescriptor> {
    let kind = match description.typ {
        V4lControlType::Integer | V4lControlType::Integer64 => ControlKind::Integer,
        V4lControlType::Boolean => ControlKind::Boolean,
        V4lControlType::Menu | V4lControlType::IntegerMenu => ControlKind::Menu,
        _ => return None,
    };
    if description.flags.contains(v4l::control::Flags::DISABLED) {
        return None;
    }

    let menu = description
        .items
        .iter()
        .flatten()
        .map(|(value, item)| MenuEntry {
            value: i64::from(*value),
            label: match item {
                MenuItem::Name(name) => name.clone(),
                MenuItem::Value(value) => value.to_string(),
            },
        })
        .collect();

    Some(ControlDescriptor {
        id: description.id,
        display_name: description.name.clone(),
        kind,
        min: description.minimum,
        max: description.maximum,
        step: i64::try_from(description.step).unwrap_or(1),
        default: description.default,
        unit: control_unit(description.id).to_owned(),
        writable: !description.flags.contains(v4l::control::Flags::READ_ONLY),
        menu,
    })
}
