//! Alt-setting selection for a requested mode under a bandwidth budget.
//!
//! The theoretical payload per service interval of a mode is its
//! bandwidth cost divided by the bus's service intervals per second. That
//! figure is scaled by the bandwidth factor and the smallest alt-setting
//! able to carry it (and allowed by the host controller) is chosen.

use std::fmt;

use serde::Deserialize;

use crate::error::{CameraError, Result};
use crate::modes::ModeEntry;
use crate::traits::{AltSetting, DeviceDescriptor, Mode};

/// Safety multiplier applied to a mode's theoretical bandwidth.
///
/// Values below 1.0 risk corrupted frames; values above 1.0 reserve more bus
/// bandwidth than strictly needed in exchange for reliability.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Deserialize)]
#[serde(try_from = "f32")]
pub struct BandwidthFactor(f32);

impl BandwidthFactor {
    /// The neutral factor.
    pub const ONE: Self = Self(1.0);

    /// Validate a factor. Zero, negative and non-finite values are rejected.
    pub fn new(value: f32) -> Result<Self> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(CameraError::InvalidBandwidthFactor(value))
        }
    }

    /// The raw multiplier.
    pub const fn get(self) -> f32 {
        self.0
    }
}

impl Default for BandwidthFactor {
    fn default() -> Self {
        Self::ONE
    }
}

impl TryFrom<f32> for BandwidthFactor {
    type Error = CameraError;

    fn try_from(value: f32) -> Result<Self> {
        Self::new(value)
    }
}

impl fmt::Display for BandwidthFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedStreamParams {
    /// The mode being streamed.
    pub mode: Mode,
    /// Alt-setting to select on the streaming interface (0 for bulk).
    pub alt_setting: u8,
    /// Bytes the chosen alt-setting reserves per service interval.
    pub packet_size: u32,
    /// Bytes per service interval the mode needs after the bandwidth factor.
    pub required_bytes_per_interval: u32,
    /// Largest frame the mode can produce.
    pub max_frame_bytes: u32,
    /// Factor the negotiation was made with.
    pub bandwidth_factor: BandwidthFactor,
}

/// Chooses alt-settings that satisfy both device and host limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeNegotiator {
    host_limit: Option<u32>,
}

impl ModeNegotiator {
    /// Negotiator without a host controller cap.
    pub const fn new() -> Self {
        Self { host_limit: None }
    }

    /// Cap the bytes per service interval the host controller will grant.
    #[must_use]
    pub const fn with_host_limit(mut self, limit: Option<u32>) -> Self {
        self.host_limit = limit;
        self
    }

    /// Pick stream parameters for `requested` on `device`.
    ///
    /// Fails with `UnsupportedMode` when the mode is not in the device's
    /// mode table, and with `InsufficientBandwidth` when no usable
    /// alt-setting can carry the scaled bandwidth. The result depends only on
    /// the arguments, so repeated calls select the same alt-setting.
    pub fn negotiate(
        &self,
        device: &DeviceDescriptor,
        requested: &Mode,
        factor: BandwidthFactor,
    ) -> Result<NegotiatedStreamParams> {
        let entry = device
            .modes
            .get(requested)
            .ok_or_else(|| CameraError::UnsupportedMode {
                mode: requested.to_string(),
            })?;

        let required = required_bytes_per_interval(
            entry,
            device.speed.intervals_per_second(),
            factor,
        );

        if device.alt_settings.is_empty() {
            // Bulk endpoint: nothing to reserve.
            return Ok(self.params(entry, 0, required, required, factor));
        }

        let usable = device
            .alt_settings
            .iter()
            .filter(|alt| alt.number != 0)
            .filter(|alt| self.host_allows(alt));

        let chosen = usable
            .clone()
            .filter(|alt| alt.bytes_per_interval() >= required)
            .min_by_key(|alt| (alt.bytes_per_interval(), alt.number));

        if let Some(alt) = chosen {
            tracing::debug!(
                mode = %requested,
                %factor,
                alt_setting = alt.number,
                packet_size = alt.bytes_per_interval(),
                required,
                "negotiated stream parameters"
            );
            return Ok(self.params(entry, alt.number, alt.bytes_per_interval(), required, factor));
        }

        let available = usable
            .map(AltSetting::bytes_per_interval)
            .max()
            .unwrap_or(0);
        Err(CameraError::InsufficientBandwidth {
            required,
            available,
        })
    }

    fn host_allows(&self, alt: &AltSetting) -> bool {
        self.host_limit
            .map_or(true, |limit| alt.bytes_per_interval() <= limit)
    }

    const fn params(
        &self,
        entry: &ModeEntry,
        alt_setting: u8,
        packet_size: u32,
        required: u32,
        factor: BandwidthFactor,
    ) -> NegotiatedStreamParams {
        NegotiatedStreamParams {
            mode: entry.mode,
            alt_setting,
            packet_size,
            required_bytes_per_interval: required,
            max_frame_bytes: entry.max_frame_bytes,
            bandwidth_factor: factor,
        }
    }
}

/// Scaled payload a mode needs per service interval, rounded up.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn required_bytes_per_interval(
    entry: &ModeEntry,
    intervals_per_second: u32,
    factor: BandwidthFactor,
) -> u32 {
    let base = entry.bandwidth_cost() as f64 / f64::from(intervals_per_second);
    let scaled = (base * f64::from(factor.get())).ceil();
    if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        scaled as u32
    }
}
