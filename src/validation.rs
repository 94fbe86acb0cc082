//! Test pattern checks for captured frames.
//!
//! Used by integration tests against the mock camera and virtual V4L2
//! devices, whose test patterns are known in advance.

use crate::error::{CameraError, Result};
use crate::frame::RawFrame;

/// Expected RGB values for SMPTE color bars (8 bars), as produced by
/// converting the mock camera's YUV bars.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
pub const COLOR_TOLERANCE: u8 = 15;

fn pixel(frame: &RawFrame, x: u32, y: u32) -> Result<(u8, u8, u8)> {
    frame.pixel_at(x, y).ok_or_else(|| {
        CameraError::StreamError(format!(
            "no pixel at ({x}, {y}) in {}x{} {} frame {}",
            frame.width(),
            frame.height(),
            frame.format(),
            frame.sequence()
        ))
    })
}

/// Validates that a packed YUV 4:2:2 frame shows the SMPTE color bars.
///
/// The center of each of the 8 vertical stripes is sampled on the middle
/// row.
///
/// # Errors
///
/// Returns `StreamError` if the frame is not packed 4:2:2, is too small, or
/// any bar doesn't match the expected color within tolerance.
pub fn validate_color_bars(frame: &RawFrame) -> Result<()> {
    let bar_width = frame.width() / 8;
    let center_y = frame.height() / 2;

    for (bar, (index, expected)) in (0u32..).zip(SMPTE_COLOR_BARS.iter().enumerate()) {
        let sample_x = bar * bar_width + bar_width / 2;
        let actual = pixel(frame, sample_x, center_y)?;

        if !colors_match(actual, *expected, COLOR_TOLERANCE) {
            return Err(CameraError::StreamError(format!(
                "color bar {index} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected:?}, got RGB{actual:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a packed YUV 4:2:2 frame shows a left-to-right gradient.
///
/// Luminance along the middle row must not decrease (beyond rounding) and
/// must rise by at least 50 overall.
///
/// # Errors
///
/// Returns `StreamError` when the luminance decreases or stays flat.
pub fn validate_gradient(frame: &RawFrame) -> Result<()> {
    let center_y = frame.height() / 2;
    let mut first: Option<f32> = None;
    let mut last: Option<f32> = None;

    for x in (0..frame.width()).step_by(10) {
        let (r, g, b) = pixel(frame, x, center_y)?;
        // Y' in Rec. 601
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = last {
            if luminance < prev - 1.0 {
                return Err(CameraError::StreamError(format!(
                    "gradient decreases at x={x}: luminance {luminance} < previous {prev}"
                )));
            }
        }
        first.get_or_insert(luminance);
        last = Some(luminance);
    }

    let change = last.unwrap_or_default() - first.unwrap_or_default();
    if change < 50.0 {
        return Err(CameraError::StreamError(format!(
            "insufficient luminance change for gradient: {change} (expected at least 50)"
        )));
    }
    Ok(())
}

/// Validates that sequence numbers strictly increase across `frames`.
///
/// Gaps are allowed: they are frames dropped on ring overflow or discarded
/// after a transfer fault.
///
/// # Errors
///
/// Returns `StreamError` for an empty slice or a repeated or decreasing
/// sequence number.
pub fn validate_frame_sequence(frames: &[RawFrame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::StreamError(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.sequence() <= prev.sequence() {
                return Err(CameraError::StreamError(format!(
                    "frame {} has sequence {} after {}",
                    index + 1,
                    curr.sequence(),
                    prev.sequence()
                )));
            }
        }
    }
    Ok(())
}

/// Number of frames missing between consecutive sequence numbers.
pub fn count_gaps(frames: &[RawFrame]) -> u64 {
    frames
        .windows(2)
        .filter_map(|pair| match pair {
            [prev, curr] => curr.sequence().checked_sub(prev.sequence() + 1),
            _ => None,
        })
        .sum()
}

/// Whether all three channels are within `tolerance` of each other.
pub fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u8) -> bool {
    actual.0.abs_diff(expected.0) <= tolerance
        && actual.1.abs_diff(expected.1) <= tolerance
        && actual.2.abs_diff(expected.2) <= tolerance
}
