//! Lazy pixel views over raw frames.
//!
//! Uncompressed sources are viewed in place wherever the layout allows it
//! (luma and chroma planes of packed/semi-planar YUV are strided views into
//! the frame buffer). Compressed sources go through the decoder once per
//! frame; the decoded image is cached on the frame and every later view of
//! that frame is derived from the cache.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CameraError, Result};
use crate::frame::RawFrame;
use crate::traits::{DecodedImage, DecodedPixels, Decoder, PixelFormat};

/// Pixel representation a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// Single 8-bit luma plane.
    Gray,
    /// Packed 8-bit BGR.
    Bgr,
    /// Separate Y, U and V planes.
    Planar,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gray => "gray",
            Self::Bgr => "bgr",
            Self::Planar => "planar YUV",
        })
    }
}

/// An 8-bit plane, possibly strided through a shared buffer.
#[derive(Debug, Clone)]
pub struct Plane<'a> {
    data: Cow<'a, [u8]>,
    offset: usize,
    width: u32,
    height: u32,
    row_stride: usize,
    pixel_step: usize,
}

impl<'a> Plane<'a> {
    const fn strided(
        data: Cow<'a, [u8]>,
        offset: usize,
        width: u32,
        height: u32,
        row_stride: usize,
        pixel_step: usize,
    ) -> Self {
        Self {
            data,
            offset,
            width,
            height,
            row_stride,
            pixel_step,
        }
    }

    fn dense(data: Cow<'a, [u8]>, width: u32, height: u32) -> Self {
        Self::strided(data, 0, width, height, width as usize, 1)
    }

    /// Width in samples.
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in samples.
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Whether the plane is a view into the frame buffer rather than a copy.
    pub const fn is_borrowed(&self) -> bool {
        matches!(self.data, Cow::Borrowed(_))
    }

    /// Sample at `(x, y)`.
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = self.offset + y as usize * self.row_stride + x as usize * self.pixel_step;
        self.data.get(index).copied()
    }

    /// Samples of one row.
    pub fn row(&self, y: u32) -> impl Iterator<Item = u8> + '_ {
        (0..self.width).filter_map(move |x| self.get(x, y))
    }

    /// Copy the plane into a dense buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        (0..self.height).flat_map(|y| self.row(y)).collect()
    }

    /// Mean sample value.
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        let count = u64::from(self.width) * u64::from(self.height);
        if count == 0 {
            return 0.0;
        }
        let sum: u64 = (0..self.height)
            .flat_map(|y| self.row(y))
            .map(u64::from)
            .sum();
        sum as f64 / count as f64
    }
}

/// Packed 8-bit BGR image.
#[derive(Debug, Clone)]
pub struct PackedImage<'a> {
    data: Cow<'a, [u8]>,
    width: u32,
    height: u32,
}

impl PackedImage<'_> {
    /// Width in pixels.
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Raw BGR bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Whether the image is a view into the frame buffer rather than a copy.
    pub const fn is_borrowed(&self) -> bool {
        matches!(self.data, Cow::Borrowed(_))
    }

    /// `[b, g, r]` at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = (y as usize * self.width as usize + x as usize) * 3;
        let bgr = self.data.get(index..index + 3)?;
        Some([*bgr.first()?, *bgr.get(1)?, *bgr.get(2)?])
    }
}

/// Chroma resolution relative to luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaSubsampling {
    /// Full resolution chroma.
    Yuv444,
    /// Half horizontal chroma resolution.
    Yuv422,
    /// Half horizontal and vertical chroma resolution.
    Yuv420,
}

/// Y, U and V planes.
#[derive(Debug, Clone)]
pub struct PlanarImage<'a> {
    /// Luma.
    pub y: Plane<'a>,
    /// Blue-difference chroma.
    pub u: Plane<'a>,
    /// Red-difference chroma.
    pub v: Plane<'a>,
    /// Chroma resolution.
    pub subsampling: ChromaSubsampling,
}

/// The pixels of a converted view.
#[derive(Debug, Clone)]
pub enum View<'a> {
    /// Luma plane.
    Gray(Plane<'a>),
    /// Packed color.
    Bgr(PackedImage<'a>),
    /// Planar components.
    Planar(PlanarImage<'a>),
}

/// A derived view of a raw frame. Valid as long as the frame reference is.
#[derive(Debug, Clone)]
pub struct ConvertedView<'a> {
    view: View<'a>,
    sequence: u64,
    complete: bool,
}

impl<'a> ConvertedView<'a> {
    /// The pixels.
    pub const fn view(&self) -> &View<'a> {
        &self.view
    }

    /// Consume into the pixels.
    pub fn into_view(self) -> View<'a> {
        self.view
    }

    /// Sequence number of the source frame.
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// `false` when the source frame was only partially received; missing
    /// samples read as zero.
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// The luma plane, if this is a gray view.
    pub const fn as_gray(&self) -> Option<&Plane<'a>> {
        match &self.view {
            View::Gray(plane) => Some(plane),
            _ => None,
        }
    }

    /// The packed image, if this is a BGR view.
    pub const fn as_bgr(&self) -> Option<&PackedImage<'a>> {
        match &self.view {
            View::Bgr(image) => Some(image),
            _ => None,
        }
    }

    /// The planes, if this is a planar view.
    pub const fn as_planar(&self) -> Option<&PlanarImage<'a>> {
        match &self.view {
            View::Planar(image) => Some(image),
            _ => None,
        }
    }
}

/// Derives pixel views from raw frames.
///
/// Cloning is cheap; clones share the decoder and the failure counter.
#[derive(Clone)]
pub struct FrameConverter {
    decoder: Arc<dyn Decoder>,
    allow_partial: bool,
    decode_failures: Arc<AtomicU64>,
}

impl fmt::Debug for FrameConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameConverter")
            .field("allow_partial", &self.allow_partial)
            .field("decode_failures", &self.decode_failures())
            .finish_non_exhaustive()
    }
}

impl FrameConverter {
    /// Converter refusing partial frames.
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self {
            decoder,
            allow_partial: false,
            decode_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Convert partial frames too, flagging the resulting views as incomplete.
    #[must_use]
    pub const fn with_partial_frames(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }

    /// Number of frames the decoder rejected so far.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Derive `representation` from `frame` without modifying it.
    pub fn to_view<'f>(
        &self,
        frame: &'f RawFrame,
        representation: Representation,
    ) -> Result<ConvertedView<'f>> {
        let complete = frame.received_fully();
        if !complete && !self.allow_partial {
            return Err(incomplete(frame));
        }

        let view = if frame.format().is_compressed() {
            let image = self.decoded(frame)?;
            view_from_decoded(image, representation)
        } else {
            let payload = self.payload(frame)?;
            view_from_uncompressed(frame, payload, representation)
        }?;

        Ok(ConvertedView {
            view,
            sequence: frame.sequence(),
            complete,
        })
    }

    /// Gray view of a frame.
    pub fn gray<'f>(&self, frame: &'f RawFrame) -> Result<Plane<'f>> {
        match self.to_view(frame, Representation::Gray)?.into_view() {
            View::Gray(plane) => Ok(plane),
            _ => Err(unsupported(frame.format(), Representation::Gray)),
        }
    }

    /// BGR view of a frame.
    pub fn bgr<'f>(&self, frame: &'f RawFrame) -> Result<PackedImage<'f>> {
        match self.to_view(frame, Representation::Bgr)?.into_view() {
            View::Bgr(image) => Ok(image),
            _ => Err(unsupported(frame.format(), Representation::Bgr)),
        }
    }

    /// Planar view of a frame.
    pub fn planar<'f>(&self, frame: &'f RawFrame) -> Result<PlanarImage<'f>> {
        match self.to_view(frame, Representation::Planar)?.into_view() {
            View::Planar(image) => Ok(image),
            _ => Err(unsupported(frame.format(), Representation::Planar)),
        }
    }

    /// Frame payload sized to exactly one frame, zero-padded when partial.
    fn payload<'f>(&self, frame: &'f RawFrame) -> Result<Cow<'f, [u8]>> {
        let data = frame.data();
        let Some(expected) = frame.expected_bytes() else {
            return Ok(Cow::Borrowed(data));
        };
        if let Some(full) = data.get(..expected) {
            return Ok(Cow::Borrowed(full));
        }
        if !self.allow_partial {
            return Err(incomplete(frame));
        }
        let mut padded = data.to_vec();
        padded.resize(expected, 0);
        Ok(Cow::Owned(padded))
    }

    fn decoded<'f>(&self, frame: &'f RawFrame) -> Result<&'f DecodedImage> {
        let cell = frame.decoded_cell();
        if cell.get().is_none() {
            let image = self
                .decoder
                .decode(frame.data(), frame.width(), frame.height())
                .and_then(|image| check_decoded(frame, image))
                .map_err(|err| {
                    self.decode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(sequence = frame.sequence(), error = %err, "frame decode failed");
                    match err {
                        CameraError::DecodeError(_) => err,
                        other => CameraError::DecodeError(other.to_string()),
                    }
                })?;
            let _ = cell.set(image);
        }
        cell.get()
            .ok_or_else(|| CameraError::DecodeError("decoded image missing".to_owned()))
    }
}

fn incomplete(frame: &RawFrame) -> CameraError {
    CameraError::IncompleteFrame {
        sequence: frame.sequence(),
        bytes_used: frame.bytes_used(),
        expected: frame.expected_bytes().unwrap_or(0),
    }
}

fn unsupported(from: PixelFormat, to: Representation) -> CameraError {
    CameraError::ConversionUnsupported {
        from: from.name().to_owned(),
        to: to.to_string(),
    }
}

fn check_decoded(frame: &RawFrame, image: DecodedImage) -> Result<DecodedImage> {
    let (width, height) = (frame.width(), frame.height());
    if image.width != width || image.height != height {
        return Err(CameraError::DecodeError(format!(
            "decoded {}x{}, expected {width}x{height}",
            image.width, image.height
        )));
    }
    let pixels = width as usize * height as usize;
    let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
    let sized = match &image.pixels {
        DecodedPixels::Rgb24(rgb) => rgb.len() == pixels * 3,
        DecodedPixels::Yuv420 { y, u, v } => {
            y.len() == pixels && u.len() == chroma && v.len() == chroma
        }
    };
    if sized {
        Ok(image)
    } else {
        Err(CameraError::DecodeError("decoded buffer has the wrong size".to_owned()))
    }
}

fn view_from_uncompressed<'f>(
    frame: &RawFrame,
    data: Cow<'f, [u8]>,
    representation: Representation,
) -> Result<View<'f>> {
    let (width, height) = (frame.width(), frame.height());
    let w = width as usize;
    let format = frame.format();

    let view = match (format, representation) {
        (PixelFormat::Yuyv, Representation::Gray) => {
            View::Gray(Plane::strided(data, 0, width, height, w * 2, 2))
        }
        (PixelFormat::Uyvy, Representation::Gray) => {
            View::Gray(Plane::strided(data, 1, width, height, w * 2, 2))
        }
        (PixelFormat::Nv12 | PixelFormat::Gray8, Representation::Gray) => {
            View::Gray(Plane::strided(data, 0, width, height, w, 1))
        }
        (PixelFormat::Bgr24, Representation::Gray) => {
            let gray = data
                .chunks_exact(3)
                .map(|bgr| luma(bgr[2], bgr[1], bgr[0]))
                .collect();
            View::Gray(Plane::dense(Cow::Owned(gray), width, height))
        }
        (PixelFormat::Yuyv | PixelFormat::Uyvy, Representation::Bgr) => View::Bgr(PackedImage {
            data: Cow::Owned(packed_yuv422_to_bgr(&data, format == PixelFormat::Uyvy)),
            width,
            height,
        }),
        (PixelFormat::Nv12, Representation::Bgr) => View::Bgr(PackedImage {
            data: Cow::Owned(nv12_to_bgr(&data, width, height)),
            width,
            height,
        }),
        (PixelFormat::Gray8, Representation::Bgr) => View::Bgr(PackedImage {
            data: Cow::Owned(data.iter().flat_map(|&g| [g, g, g]).collect()),
            width,
            height,
        }),
        (PixelFormat::Bgr24, Representation::Bgr) => View::Bgr(PackedImage {
            data,
            width,
            height,
        }),
        (PixelFormat::Yuyv | PixelFormat::Uyvy, Representation::Planar) => {
            let (y_off, u_off, v_off) = if format == PixelFormat::Yuyv {
                (0, 1, 3)
            } else {
                (1, 0, 2)
            };
            let stride = w * 2;
            View::Planar(PlanarImage {
                y: Plane::strided(data.clone(), y_off, width, height, stride, 2),
                u: Plane::strided(data.clone(), u_off, width / 2, height, stride, 4),
                v: Plane::strided(data, v_off, width / 2, height, stride, 4),
                subsampling: ChromaSubsampling::Yuv422,
            })
        }
        (PixelFormat::Nv12, Representation::Planar) => {
            let chroma_start = w * height as usize;
            View::Planar(PlanarImage {
                y: Plane::strided(data.clone(), 0, width, height, w, 1),
                u: Plane::strided(data.clone(), chroma_start, width / 2, height / 2, w, 2),
                v: Plane::strided(data, chroma_start + 1, width / 2, height / 2, w, 2),
                subsampling: ChromaSubsampling::Yuv420,
            })
        }
        (
            PixelFormat::Gray8 | PixelFormat::Bgr24 | PixelFormat::Bayer8 | PixelFormat::Mjpeg,
            _,
        ) => return Err(unsupported(format, representation)),
    };
    Ok(view)
}

fn view_from_decoded(image: &DecodedImage, representation: Representation) -> Result<View<'_>> {
    let (width, height) = (image.width, image.height);
    let view = match (&image.pixels, representation) {
        (DecodedPixels::Rgb24(rgb), Representation::Gray) => {
            let gray = rgb
                .chunks_exact(3)
                .map(|px| luma(px[0], px[1], px[2]))
                .collect();
            View::Gray(Plane::dense(Cow::Owned(gray), width, height))
        }
        (DecodedPixels::Rgb24(rgb), Representation::Bgr) => View::Bgr(PackedImage {
            data: Cow::Owned(rgb.chunks_exact(3).flat_map(|px| [px[2], px[1], px[0]]).collect()),
            width,
            height,
        }),
        (DecodedPixels::Rgb24(rgb), Representation::Planar) => {
            let mut y = Vec::with_capacity(rgb.len() / 3);
            let mut u = Vec::with_capacity(rgb.len() / 3);
            let mut v = Vec::with_capacity(rgb.len() / 3);
            for px in rgb.chunks_exact(3) {
                let (py, pu, pv) = rgb_to_yuv(px[0], px[1], px[2]);
                y.push(py);
                u.push(pu);
                v.push(pv);
            }
            View::Planar(PlanarImage {
                y: Plane::dense(Cow::Owned(y), width, height),
                u: Plane::dense(Cow::Owned(u), width, height),
                v: Plane::dense(Cow::Owned(v), width, height),
                subsampling: ChromaSubsampling::Yuv444,
            })
        }
        (DecodedPixels::Yuv420 { y, .. }, Representation::Gray) => {
            View::Gray(Plane::dense(Cow::Borrowed(y), width, height))
        }
        (DecodedPixels::Yuv420 { y, u, v }, Representation::Planar) => {
            let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
            View::Planar(PlanarImage {
                y: Plane::dense(Cow::Borrowed(y), width, height),
                u: Plane::dense(Cow::Borrowed(u), cw, ch),
                v: Plane::dense(Cow::Borrowed(v), cw, ch),
                subsampling: ChromaSubsampling::Yuv420,
            })
        }
        (DecodedPixels::Yuv420 { y, u, v }, Representation::Bgr) => {
            let cw = width.div_ceil(2) as usize;
            let mut bgr = Vec::with_capacity(y.len() * 3);
            for row in 0..height as usize {
                for col in 0..width as usize {
                    let c = (row / 2) * cw + col / 2;
                    let luma = y.get(row * width as usize + col).copied().unwrap_or(0);
                    let (r, g, b) = yuv_to_rgb(
                        luma,
                        u.get(c).copied().unwrap_or(128),
                        v.get(c).copied().unwrap_or(128),
                    );
                    bgr.extend_from_slice(&[b, g, r]);
                }
            }
            View::Bgr(PackedImage {
                data: Cow::Owned(bgr),
                width,
                height,
            })
        }
    };
    Ok(view)
}

fn packed_yuv422_to_bgr(data: &[u8], chroma_first: bool) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(data.len() / 2 * 3);
    for quad in data.chunks_exact(4) {
        let (y0, u, y1, v) = if chroma_first {
            (quad[1], quad[0], quad[3], quad[2])
        } else {
            (quad[0], quad[1], quad[2], quad[3])
        };
        for luma in [y0, y1] {
            let (r, g, b) = yuv_to_rgb(luma, u, v);
            bgr.extend_from_slice(&[b, g, r]);
        }
    }
    bgr
}

fn nv12_to_bgr(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let chroma_start = w * h;
    let mut bgr = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let c = chroma_start + (row / 2) * w + (col / 2) * 2;
            let (r, g, b) = yuv_to_rgb(
                data.get(row * w + col).copied().unwrap_or(0),
                data.get(c).copied().unwrap_or(128),
                data.get(c + 1).copied().unwrap_or(128),
            );
            bgr.extend_from_slice(&[b, g, r]);
        }
    }
    bgr
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.114f32.mul_add(
        f32::from(b),
        0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
    );
    y.round().clamp(0.0, 255.0) as u8
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::many_single_char_names)]
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let y = 0.114f32.mul_add(b, 0.587f32.mul_add(g, 0.299 * r));
    let u = 0.492f32.mul_add(b - y, 128.0);
    let v = 0.877f32.mul_add(r - y, 128.0);
    let clamp = |val: f32| val.round().clamp(0.0, 255.0) as u8;
    (clamp(y), clamp(u), clamp(v))
}

/// BT.601 YUV to RGB, without range expansion.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMetadata;
    use std::sync::atomic::AtomicUsize;

    struct CountingDecoder {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingDecoder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl Decoder for CountingDecoder {
        fn decode(&self, _data: &[u8], width: u32, height: u32) -> Result<DecodedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CameraError::DecodeError("truncated scan".to_owned()));
            }
            let pixels = (width * height) as usize;
            let chroma = (width.div_ceil(2) * height.div_ceil(2)) as usize;
            Ok(DecodedImage {
                width,
                height,
                pixels: DecodedPixels::Yuv420 {
                    y: vec![200; pixels],
                    u: vec![128; chroma],
                    v: vec![128; chroma],
                },
            })
        }
    }

    fn frame(format: PixelFormat, width: u32, height: u32, data: Vec<u8>, complete: bool) -> RawFrame {
        RawFrame::from_parts(
            data,
            FrameMetadata {
                width,
                height,
                format,
                sequence: 3,
                received_fully: complete,
                ..FrameMetadata::default()
            },
        )
    }

    fn converter() -> FrameConverter {
        FrameConverter::new(CountingDecoder::new(false))
    }

    #[test]
    fn test_yuyv_gray_is_zero_copy() {
        // Two pixels per row: Y0=10, Y1=20 / Y0=30, Y1=40
        let raw = frame(
            PixelFormat::Yuyv,
            2,
            2,
            vec![10, 128, 20, 128, 30, 128, 40, 128],
            true,
        );
        let gray = converter().gray(&raw).expect("gray view");
        assert!(gray.is_borrowed());
        assert_eq!(gray.to_vec(), vec![10, 20, 30, 40]);
        assert_eq!(gray.get(1, 1), Some(40));
        assert_eq!(gray.get(2, 0), None);
        assert!((gray.mean() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_uyvy_planar_is_zero_copy() {
        let raw = frame(PixelFormat::Uyvy, 2, 1, vec![90, 10, 240, 20], true);
        let planar = converter().planar(&raw).expect("planar view");
        assert!(planar.y.is_borrowed());
        assert_eq!(planar.y.to_vec(), vec![10, 20]);
        assert_eq!(planar.u.to_vec(), vec![90]);
        assert_eq!(planar.v.to_vec(), vec![240]);
        assert_eq!(planar.subsampling, ChromaSubsampling::Yuv422);
    }

    #[test]
    fn test_nv12_planes() {
        // 2x2 luma followed by one UV pair
        let raw = frame(PixelFormat::Nv12, 2, 2, vec![1, 2, 3, 4, 100, 200], true);
        let planar = converter().planar(&raw).expect("planar view");
        assert_eq!(planar.y.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(planar.u.to_vec(), vec![100]);
        assert_eq!(planar.v.to_vec(), vec![200]);
        assert_eq!(planar.subsampling, ChromaSubsampling::Yuv420);
    }

    #[test]
    fn test_yuyv_bgr_neutral_chroma() {
        let raw = frame(PixelFormat::Yuyv, 2, 1, vec![235, 128, 16, 128], true);
        let bgr = converter().bgr(&raw).expect("bgr view");
        assert!(!bgr.is_borrowed());
        assert_eq!(bgr.pixel(0, 0), Some([235, 235, 235]));
        assert_eq!(bgr.pixel(1, 0), Some([16, 16, 16]));
        assert_eq!(bgr.pixel(2, 0), None);
    }

    #[test]
    fn test_bgr_source_is_borrowed() {
        let raw = frame(PixelFormat::Bgr24, 1, 1, vec![1, 2, 3], true);
        let bgr = converter().bgr(&raw).expect("bgr view");
        assert!(bgr.is_borrowed());
        assert_eq!(bgr.as_bytes(), &[1, 2, 3]);
        let gray = converter().gray(&raw).expect("gray view");
        assert!(!gray.is_borrowed());
    }

    #[test]
    fn test_bayer_conversion_unsupported() {
        let raw = frame(PixelFormat::Bayer8, 2, 2, vec![0; 4], true);
        for representation in [Representation::Gray, Representation::Bgr, Representation::Planar] {
            let err = converter()
                .to_view(&raw, representation)
                .expect_err("bayer needs demosaicing");
            assert!(matches!(err, CameraError::ConversionUnsupported { .. }));
        }
    }

    #[test]
    fn test_partial_frame_rejected_by_default() {
        let raw = frame(PixelFormat::Yuyv, 2, 2, vec![10, 128, 20, 128], false);
        let err = converter()
            .to_view(&raw, Representation::Gray)
            .expect_err("partial frames are refused");
        match err {
            CameraError::IncompleteFrame {
                sequence,
                bytes_used,
                expected,
            } => {
                assert_eq!(sequence, 3);
                assert_eq!(bytes_used, 4);
                assert_eq!(expected, 8);
            }
            other => panic!("expected IncompleteFrame, got {other:?}"),
        }
        // The frame itself is untouched.
        assert_eq!(raw.data(), &[10, 128, 20, 128]);
        assert!(!raw.received_fully());
    }

    #[test]
    fn test_partial_frame_flagged_when_allowed() {
        let raw = frame(PixelFormat::Yuyv, 2, 2, vec![10, 128, 20, 128], false);
        let view = converter()
            .with_partial_frames(true)
            .to_view(&raw, Representation::Gray)
            .expect("partial conversion allowed");
        assert!(!view.is_complete());
        let gray = view.as_gray().expect("gray view");
        assert_eq!(gray.to_vec(), vec![10, 20, 0, 0]);
    }

    #[test]
    fn test_short_buffer_marked_complete_is_still_refused() {
        let raw = frame(PixelFormat::Yuyv, 2, 2, vec![10, 128], true);
        assert!(matches!(
            converter().to_view(&raw, Representation::Gray),
            Err(CameraError::IncompleteFrame { .. })
        ));
    }

    #[test]
    fn test_mjpeg_decodes_once_per_frame() {
        let decoder = CountingDecoder::new(false);
        let converter = FrameConverter::new(Arc::clone(&decoder) as Arc<dyn Decoder>);
        let raw = frame(PixelFormat::Mjpeg, 4, 2, vec![0xFF, 0xD8, 0xFF, 0xD9], true);

        let gray = converter.gray(&raw).expect("gray view");
        assert!(gray.is_borrowed());
        assert_eq!(gray.get(3, 1), Some(200));
        let planar = converter.planar(&raw).expect("planar view");
        assert_eq!(planar.u.width(), 2);
        let bgr = converter.bgr(&raw).expect("bgr view");
        assert_eq!(bgr.pixel(0, 0), Some([200, 200, 200]));

        assert_eq!(decoder.calls.load(Ordering::SeqCst), 1);

        let next = frame(PixelFormat::Mjpeg, 4, 2, vec![0xFF, 0xD8, 0xFF, 0xD9], true);
        converter.gray(&next).expect("gray view");
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_decode_failure_is_counted_and_recoverable() {
        let converter = FrameConverter::new(CountingDecoder::new(true));
        let raw = frame(PixelFormat::Mjpeg, 4, 2, vec![0xFF, 0xD8], true);
        let err = converter.gray(&raw).expect_err("decoder fails");
        assert!(matches!(err, CameraError::DecodeError(_)));
        assert!(err.is_recoverable());
        assert_eq!(converter.decode_failures(), 1);
    }

    #[test]
    fn test_decoded_size_mismatch_is_decode_error() {
        struct WrongSize;
        impl Decoder for WrongSize {
            fn decode(&self, _data: &[u8], _width: u32, _height: u32) -> Result<DecodedImage> {
                Ok(DecodedImage {
                    width: 1,
                    height: 1,
                    pixels: DecodedPixels::Rgb24(vec![0, 0, 0]),
                })
            }
        }
        let converter = FrameConverter::new(Arc::new(WrongSize));
        let raw = frame(PixelFormat::Mjpeg, 4, 2, vec![0xFF, 0xD8], true);
        assert!(matches!(
            converter.bgr(&raw),
            Err(CameraError::DecodeError(_))
        ));
    }

    #[test]
    fn test_yuv_to_rgb_conversion() {
        // Pure white (Y=235, U=128, V=128) should give approximately white
        let (r, g, b) = yuv_to_rgb(235, 128, 128);
        assert_eq!((r, g, b), (235, 235, 235));

        // Saturated red pushes red channel to the clamp
        let (r, _, _) = yuv_to_rgb(81, 90, 240);
        assert!(r > 230);
    }

    #[test]
    fn test_luma_weights() {
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 0, 0), 76);
    }
}
