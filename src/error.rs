//! Error taxonomy for capture sessions.

use std::time::Duration;

use crate::session::SessionState;

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The USB subsystem could not be initialized (driver or permission problem).
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No device with the given uid is attached, or it vanished before open.
    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    /// The requested mode is not part of the device's mode table.
    #[error("mode {mode} is not supported by the device")]
    UnsupportedMode {
        /// Human-readable mode that was requested.
        mode: String,
    },

    /// The mode exists but does not fit any usable alt-setting.
    #[error(
        "insufficient bandwidth: {required} bytes per interval required, \
         {available} available (lower the bandwidth factor or pick a smaller mode)"
    )]
    InsufficientBandwidth {
        /// Bytes per service interval the stream needs after the bandwidth factor.
        required: u32,
        /// Largest bytes per service interval the device and host can offer.
        available: u32,
    },

    /// Bandwidth factor is not a positive finite number.
    #[error("invalid bandwidth factor {0}: must be positive and finite")]
    InvalidBandwidthFactor(f32),

    /// No frame arrived within the timeout. The caller may retry.
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    /// The stream failed and the session must be reopened.
    #[error("stream error: {0}")]
    StreamError(String),

    /// A compressed frame could not be decoded. Only this frame is affected.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// The requested representation cannot be derived from the source format.
    #[error("cannot convert {from} frames to {to}")]
    ConversionUnsupported {
        /// Source pixel format name.
        from: String,
        /// Requested representation name.
        to: String,
    },

    /// Conversion refused because the frame was only partially received.
    #[error("frame {sequence} is incomplete: {bytes_used} of {expected} bytes received")]
    IncompleteFrame {
        /// Sequence number of the partial frame.
        sequence: u64,
        /// Bytes actually received.
        bytes_used: usize,
        /// Bytes a complete frame would carry (0 when unknown).
        expected: usize,
    },

    /// The device rejected a control transfer. The cached value is unchanged.
    #[error("control {id:#x}: {reason}")]
    ControlError {
        /// Control identifier.
        id: u32,
        /// Transport or device reason.
        reason: String,
    },

    /// No control with this identifier or name exists on the device.
    #[error("control '{0}' not found")]
    ControlNotFound(String),

    /// Value outside the control's range under the reject policy.
    #[error("control {id:#x}: value {value} outside [{min}, {max}]")]
    ControlOutOfRange {
        /// Control identifier.
        id: u32,
        /// Rejected value.
        value: i64,
        /// Range minimum.
        min: i64,
        /// Range maximum.
        max: i64,
    },

    /// The call was aborted because the session was closed.
    #[error("session closed")]
    Cancelled,

    /// Operation is not valid in the session's current state.
    #[error("{operation} is not valid while the session is {state}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    /// I/O error from the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Whether the session survives this error and the call may simply be retried
    /// or the input adjusted.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::DecodeError(_)
                | Self::ControlError { .. }
                | Self::ControlNotFound(_)
                | Self::ControlOutOfRange { .. }
                | Self::IncompleteFrame { .. }
                | Self::ConversionUnsupported { .. }
                | Self::UnsupportedMode { .. }
                | Self::InsufficientBandwidth { .. }
                | Self::InvalidBandwidthFactor(_)
        )
    }

    /// Whether the session is unusable after this error and must be reopened.
    pub const fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::StreamError(_) | Self::Cancelled)
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
