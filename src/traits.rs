//! Core types and collaborator traits for the UVC capture engine.
//!
//! The `Transport` family of traits models the USB stack underneath the
//! engine (enumeration, format selection, transfer queues, control
//! transfers). `Decoder` models the external decompressor used for
//! compressed formats.

use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::modes::ModeTable;
use crate::negotiate::NegotiatedStreamParams;

/// Pixel format code (e.g., YUYV, MJPG, GREY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// NV12 pixel format (4:2:0, Y plane then interleaved UV).
    pub const NV12: Self = Self::new(b"NV12");
    /// 8-bit grayscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// BGR3 pixel format (24-bit packed BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// 8-bit raw Bayer (BGGR).
    pub const BA81: Self = Self::new(b"BA81");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

/// Pixel formats the engine knows how to stream and convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, `Y0 U Y1 V`.
    Yuyv,
    /// Packed YUV 4:2:2, `U Y0 V Y1`.
    Uyvy,
    /// Planar Y followed by interleaved UV at quarter resolution.
    Nv12,
    /// Single 8-bit luma plane.
    Gray8,
    /// Packed 8-bit BGR.
    Bgr24,
    /// Raw 8-bit Bayer mosaic.
    Bayer8,
    /// Motion JPEG, one JPEG image per frame.
    Mjpeg,
}

impl PixelFormat {
    /// Code used on the wire / by the driver.
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Yuyv => FourCC::YUYV,
            Self::Uyvy => FourCC::UYVY,
            Self::Nv12 => FourCC::NV12,
            Self::Gray8 => FourCC::GREY,
            Self::Bgr24 => FourCC::BGR3,
            Self::Bayer8 => FourCC::BA81,
            Self::Mjpeg => FourCC::MJPG,
        }
    }

    /// Map a driver code back to a known format.
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        [
            Self::Yuyv,
            Self::Uyvy,
            Self::Nv12,
            Self::Gray8,
            Self::Bgr24,
            Self::Bayer8,
            Self::Mjpeg,
        ]
        .into_iter()
        .find(|format| format.fourcc() == fourcc)
    }

    /// Whether frames of this format need the decoder.
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Mjpeg)
    }

    /// Short display name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Yuyv => "YUYV",
            Self::Uyvy => "UYVY",
            Self::Nv12 => "NV12",
            Self::Gray8 => "GRAY",
            Self::Bgr24 => "BGR",
            Self::Bayer8 => "BAYER",
            Self::Mjpeg => "MJPEG",
        }
    }

    /// Size in bytes of one complete frame, or `None` for compressed formats.
    pub const fn frame_bytes(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            Self::Yuyv | Self::Uyvy => Some(pixels * 2),
            Self::Nv12 => Some(pixels + pixels / 2),
            Self::Gray8 | Self::Bayer8 => Some(pixels),
            Self::Bgr24 => Some(pixels * 3),
            Self::Mjpeg => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame rate as an exact fraction (frames per second = numerator / denominator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRate {
    /// Frames.
    pub numerator: u32,
    /// Seconds.
    pub denominator: u32,
}

impl FrameRate {
    /// Build a rate from a fraction. A zero denominator is treated as one.
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator: if denominator == 0 { 1 } else { denominator },
        }
    }

    /// Whole frames per second.
    pub const fn from_fps(fps: u32) -> Self {
        Self::new(fps, 1)
    }

    /// Convert a UVC frame interval (units of 100ns) into a rate.
    pub const fn from_interval_100ns(interval: u32) -> Self {
        if interval == 0 {
            return Self::new(0, 1);
        }
        let numerator = 10_000_000;
        let divisor = gcd(numerator, interval);
        Self::new(numerator / divisor, interval / divisor)
    }

    /// Rate as a float.
    pub fn as_f64(self) -> f64 {
        f64::from(self.numerator) / f64::from(self.denominator)
    }

    /// Time between frames, or `None` for a zero rate.
    pub fn frame_interval(self) -> Option<Duration> {
        (self.numerator > 0).then(|| {
            Duration::from_nanos(
                u64::from(self.denominator) * 1_000_000_000 / u64::from(self.numerator),
            )
        })
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

const fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// A streaming mode. Compared by exact field equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame rate.
    pub fps: FrameRate,
    /// Pixel format on the wire.
    pub format: PixelFormat,
}

impl Mode {
    /// Mode with a whole-number frame rate.
    pub const fn new(width: u32, height: u32, fps: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            fps: FrameRate::from_fps(fps),
            format,
        }
    }

    /// Name of the pixel format, e.g. `"MJPEG"`.
    pub const fn format_name(&self) -> &'static str {
        self.format.name()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{} {}",
            self.width, self.height, self.fps, self.format
        )
    }
}

/// USB bus speed of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsbSpeed {
    /// 12 Mbit/s, one service interval per millisecond.
    Full,
    /// 480 Mbit/s, eight microframes per millisecond.
    #[default]
    High,
    /// 5 Gbit/s.
    Super,
}

impl UsbSpeed {
    /// Isochronous service intervals per second.
    pub const fn intervals_per_second(self) -> u32 {
        match self {
            Self::Full => 1_000,
            Self::High | Self::Super => 8_000,
        }
    }
}

/// One alternate setting of the video streaming interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltSetting {
    /// `bAlternateSetting` value.
    pub number: u8,
    /// Max packet size of the isochronous endpoint.
    pub max_packet_size: u16,
    /// Transactions per service interval (high-bandwidth endpoints use 2 or 3).
    pub transactions: u8,
}

impl AltSetting {
    /// Build an alt-setting entry.
    pub const fn new(number: u8, max_packet_size: u16, transactions: u8) -> Self {
        Self {
            number,
            max_packet_size,
            transactions,
        }
    }

    /// Bytes this setting reserves per service interval.
    pub const fn bytes_per_interval(&self) -> u32 {
        self.max_packet_size as u32 * self.transactions as u32
    }

    /// Alt-settings typical of a USB 2.0 high-speed UVC camera.
    pub fn usb2_high_speed() -> Vec<Self> {
        vec![
            Self::new(1, 192, 1),
            Self::new(2, 384, 1),
            Self::new(3, 512, 1),
            Self::new(4, 640, 1),
            Self::new(5, 800, 1),
            Self::new(6, 944, 1),
            Self::new(7, 640, 2),
            Self::new(8, 800, 2),
            Self::new(9, 944, 2),
            Self::new(10, 896, 3),
            Self::new(11, 1020, 3),
        ]
    }
}

/// How a control's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlKind {
    /// Signed integer in `[min, max]`.
    #[default]
    Integer,
    /// On/off, stored as 0 or 1.
    Boolean,
    /// One of an enumerated set of values.
    Menu,
}

/// A named menu value of a menu control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    /// Value written to the device.
    pub value: i64,
    /// Human-readable label.
    pub label: String,
}

/// Static description of a device control, as reported at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    /// Control identifier used in control transfers.
    pub id: u32,
    /// Human-readable name, e.g. "Absolute Exposure Time".
    pub display_name: String,
    /// Value interpretation.
    pub kind: ControlKind,
    /// Minimum value.
    pub min: i64,
    /// Maximum value.
    pub max: i64,
    /// Step between valid values.
    pub step: i64,
    /// Device default.
    pub default: i64,
    /// Unit the control belongs to (camera terminal, processing unit, ...).
    pub unit: String,
    /// Whether the device accepts writes.
    pub writable: bool,
    /// Menu entries for menu controls.
    pub menu: Vec<MenuEntry>,
}

/// Immutable identity and static capabilities of an attached camera.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Stable identifier, unique among attached devices.
    pub uid: String,
    /// Human-readable product name.
    pub name: String,
    /// Manufacturer string, if the device reports one.
    pub manufacturer: Option<String>,
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Serial number, if the device reports one.
    pub serial_number: Option<String>,
    /// USB bus number.
    pub bus_number: u8,
    /// USB device address on the bus.
    pub device_address: u8,
    /// Transport-specific locator (e.g. a device node path).
    pub location: String,
    /// Bus speed.
    pub speed: UsbSpeed,
    /// Alt-settings of the streaming interface. Empty for bulk endpoints.
    pub alt_settings: Vec<AltSetting>,
    /// Supported modes.
    pub modes: ModeTable,
    /// Controls the device exposes.
    pub controls: Vec<ControlDescriptor>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] ({})",
            self.name, self.vendor_id, self.product_id, self.uid
        )
    }
}

/// A control transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Read the current value.
    Get {
        /// Control identifier.
        id: u32,
        /// Value interpretation.
        kind: ControlKind,
    },
    /// Write a new value.
    Set {
        /// Control identifier.
        id: u32,
        /// Value interpretation.
        kind: ControlKind,
        /// Value to write.
        value: i64,
    },
}

/// Outcome the transport reports for one completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Frame delivered.
    Completed,
    /// Frame delivered but the transport knows data is missing.
    Incomplete,
    /// Isochronous overrun; the frame content is unusable.
    Overrun,
    /// Endpoint stalled; the frame content is unusable.
    Stall,
}

impl TransferStatus {
    /// Transient faults that discard the frame and trigger recovery.
    pub const fn is_fault(self) -> bool {
        matches!(self, Self::Overrun | Self::Stall)
    }
}

/// One completed transfer, borrowed from the transport's buffer.
#[derive(Debug)]
pub struct Completion<'a> {
    /// Payload bytes of the frame.
    pub data: &'a [u8],
    /// Transfer outcome.
    pub status: TransferStatus,
    /// Capture time on the transport's monotonic clock.
    pub timestamp: Duration,
}

/// Queue of in-flight streaming transfers for one open device.
///
/// Owned by the event pump thread for the lifetime of a stream.
pub trait TransferQueue: Send {
    /// Submit one transfer request.
    fn submit(&mut self) -> Result<()>;

    /// Re-arm a transfer after a transient fault.
    fn rearm(&mut self) -> Result<()> {
        self.submit()
    }

    /// Wait up to `timeout` for the next completed transfer.
    ///
    /// Returns `Ok(None)` when nothing completed in time.
    fn wait_completion(&mut self, timeout: Duration) -> Result<Option<Completion<'_>>>;

    /// Cancel every outstanding transfer and block until the transport
    /// confirms no buffer will be written anymore.
    fn cancel_all(&mut self) -> Result<()>;
}

/// An open device.
pub trait DeviceHandle: Send {
    /// Commit negotiated stream parameters (format and alt-setting).
    fn set_format(&mut self, params: &NegotiatedStreamParams) -> Result<()>;

    /// Create a transfer queue for the committed format with room for
    /// `transfers` in-flight requests.
    fn start_transfers(
        &mut self,
        params: &NegotiatedStreamParams,
        transfers: usize,
    ) -> Result<Box<dyn TransferQueue>>;

    /// Perform one synchronous control transfer, returning the control value.
    fn control_transfer(&mut self, request: &ControlRequest) -> Result<i64>;

    /// Release the device. Must be safe on a faulted device and when called twice.
    fn close(&mut self);
}

/// The USB stack: enumerates and opens cameras.
pub trait Transport: Send + Sync {
    /// Enumerate attached cameras. Fails with `TransportUnavailable` when the
    /// USB subsystem cannot be initialized.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open a camera previously returned by `enumerate`.
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn DeviceHandle>>;
}

/// Pixels produced by a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPixels {
    /// Packed 8-bit RGB.
    Rgb24(Vec<u8>),
    /// Planar YUV 4:2:0.
    Yuv420 {
        /// Full resolution luma.
        y: Vec<u8>,
        /// Quarter resolution blue-difference chroma.
        u: Vec<u8>,
        /// Quarter resolution red-difference chroma.
        v: Vec<u8>,
    },
}

/// A decompressed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel data.
    pub pixels: DecodedPixels,
}

/// Decompressor for compressed frame formats.
pub trait Decoder: Send + Sync {
    /// Decode one compressed frame. Fails with `DecodeError` on malformed input.
    fn decode(&self, data: &[u8], width: u32, height: u32) -> Result<DecodedImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trip_known_formats() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::YUYV), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::MJPG), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
        assert_eq!(FourCC::NV12.to_string(), "NV12");
    }

    #[test]
    fn test_frame_bytes() {
        assert_eq!(PixelFormat::Yuyv.frame_bytes(640, 480), Some(614_400));
        assert_eq!(PixelFormat::Nv12.frame_bytes(4, 2), Some(12));
        assert_eq!(PixelFormat::Mjpeg.frame_bytes(640, 480), None);
    }

    #[test]
    fn test_frame_rate_from_interval() {
        let rate = FrameRate::from_interval_100ns(333_333);
        assert_eq!(rate, FrameRate::new(10_000_000, 333_333));
        assert!((rate.as_f64() - 30.0).abs() < 0.001);

        assert_eq!(
            FrameRate::from_interval_100ns(333_334),
            FrameRate::new(5_000_000, 166_667)
        );
        assert_eq!(FrameRate::from_interval_100ns(500_000), FrameRate::from_fps(20));
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(
            FrameRate::from_fps(25).frame_interval(),
            Some(Duration::from_millis(40))
        );
        assert_eq!(FrameRate::from_fps(0).frame_interval(), None);
    }

    #[test]
    fn test_mode_display() {
        let mode = Mode::new(640, 480, 30, PixelFormat::Yuyv);
        assert_eq!(mode.to_string(), "640x480@30 YUYV");
        let mode = Mode {
            fps: FrameRate::new(30_000, 1001),
            ..Mode::new(1920, 1080, 30, PixelFormat::Mjpeg)
        };
        assert_eq!(mode.to_string(), "1920x1080@30000/1001 MJPEG");
        assert_eq!(mode.format_name(), "MJPEG");
    }

    #[test]
    fn test_alt_setting_bandwidth() {
        let alt = AltSetting::new(11, 1020, 3);
        assert_eq!(alt.bytes_per_interval(), 3060);
        let table = AltSetting::usb2_high_speed();
        assert!(table
            .windows(2)
            .all(|pair| pair[0].bytes_per_interval() < pair[1].bytes_per_interval()));
    }

    #[test]
    fn test_transfer_status_faults() {
        assert!(TransferStatus::Stall.is_fault());
        assert!(TransferStatus::Overrun.is_fault());
        assert!(!TransferStatus::Incomplete.is_fault());
        assert!(!TransferStatus::Completed.is_fault());
    }
}
