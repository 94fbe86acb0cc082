//! Raw frames handed out by the retriever.

use std::cell::OnceCell;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::convert::yuv_to_rgb;
use crate::traits::{DecodedImage, PixelFormat};

/// Time since the first call in this process, on a monotonic clock.
///
/// Frame timestamps of the mock transport use this clock so they can be
/// compared with caller-side measurements.
pub fn time_monotonic() -> Duration {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed()
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Session-wide capture counter. Gaps mean frames were dropped.
    pub sequence: u64,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Bytes of valid payload in the buffer.
    pub bytes_used: usize,
    /// Whether the whole frame arrived. Partial frames are never complete images.
    pub received_fully: bool,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Yuyv,
            sequence: 0,
            timestamp: Duration::ZERO,
            bytes_used: 0,
            received_fully: false,
        }
    }
}

/// A captured video frame.
///
/// Frames live in ring slots and are recycled; the reference returned by a
/// retrieval is valid until the next retrieval. Clone the frame to keep it.
#[derive(Debug, Clone, Default)]
pub struct RawFrame {
    data: Vec<u8>,
    metadata: FrameMetadata,
    decoded: OnceCell<DecodedImage>,
}

impl RawFrame {
    /// Frame with a fixed-capacity buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Build a frame from owned bytes. `bytes_used` is set from `data`.
    pub fn from_parts(data: Vec<u8>, mut metadata: FrameMetadata) -> Self {
        metadata.bytes_used = data.len();
        Self {
            data,
            metadata,
            decoded: OnceCell::new(),
        }
    }

    /// Overwrite this buffer with a new payload, truncated to `capacity`.
    ///
    /// Returns whether the payload had to be truncated. Any cached decode of
    /// the previous payload is discarded.
    pub(crate) fn refill(&mut self, payload: &[u8], capacity: usize, metadata: FrameMetadata) -> bool {
        let kept = payload.len().min(capacity);
        self.data.clear();
        self.data.extend_from_slice(payload.get(..kept).unwrap_or(payload));
        self.metadata = FrameMetadata {
            bytes_used: kept,
            ..metadata
        };
        self.decoded = OnceCell::new();
        kept < payload.len()
    }

    /// Valid payload bytes.
    pub fn data(&self) -> &[u8] {
        self.data.get(..self.metadata.bytes_used).unwrap_or(&self.data)
    }

    /// Frame metadata.
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Frame width in pixels.
    pub const fn width(&self) -> u32 {
        self.metadata.width
    }

    /// Frame height in pixels.
    pub const fn height(&self) -> u32 {
        self.metadata.height
    }

    /// Pixel format of the payload.
    pub const fn format(&self) -> PixelFormat {
        self.metadata.format
    }

    /// Session-wide sequence number.
    pub const fn sequence(&self) -> u64 {
        self.metadata.sequence
    }

    /// Capture timestamp.
    pub const fn timestamp(&self) -> Duration {
        self.metadata.timestamp
    }

    /// Bytes of valid payload.
    pub const fn bytes_used(&self) -> usize {
        self.metadata.bytes_used
    }

    /// Whether the whole frame arrived.
    pub const fn received_fully(&self) -> bool {
        self.metadata.received_fully
    }

    /// Bytes a complete frame of this format carries, if the format is uncompressed.
    pub const fn expected_bytes(&self) -> Option<usize> {
        self.metadata
            .format
            .frame_bytes(self.metadata.width, self.metadata.height)
    }

    pub(crate) const fn decoded_cell(&self) -> &OnceCell<DecodedImage> {
        &self.decoded
    }

    /// Get RGB values for a pixel of a packed YUV 4:2:2 frame.
    ///
    /// Returns `None` for other formats or out-of-range coordinates. For odd
    /// x coordinates the second luma sample of the pair is used with the
    /// shared chroma values.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        let (y0, u_off, y1, v_off) = match self.metadata.format {
            PixelFormat::Yuyv => (0, 1, 2, 3),
            PixelFormat::Uyvy => (1, 0, 3, 2),
            _ => return None,
        };
        if x >= self.metadata.width || y >= self.metadata.height {
            return None;
        }

        let pair_x = x & !1;
        let offset = ((y as usize * self.metadata.width as usize) + pair_x as usize) * 2;
        let data = self.data();
        let luma = if x % 2 == 0 {
            *data.get(offset + y0)?
        } else {
            *data.get(offset + y1)?
        };
        let u = *data.get(offset + u_off)?;
        let v = *data.get(offset + v_off)?;

        Some(yuv_to_rgb(luma, u, v))
    }
}
