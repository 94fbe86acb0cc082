//! UVC-Capture: a capture-session engine for USB Video Class cameras
//!
//! The engine discovers cameras, negotiates a streaming mode under the USB
//! bandwidth budget, pumps transfer completions on a background thread into
//! a bounded frame ring, and hands out frames with ordered, fault-tolerant
//! retrieval. Frames convert to gray, BGR or planar YUV views, zero-copy
//! where the source layout allows it.
//!
//! The USB stack sits behind the [`Transport`] trait: the `v4l2` feature
//! enables a backend over the kernel's uvcvideo driver, and [`mock`]
//! provides scripted cameras for tests.

pub mod config;
pub mod controls;
pub mod convert;
pub mod decoder;
#[cfg(feature = "v4l2")]
pub mod device;
pub mod error;
pub mod frame;
pub mod mock;
pub mod modes;
pub mod negotiate;
pub(crate) mod pump;
pub mod registry;
pub(crate) mod retriever;
pub(crate) mod ring;
pub mod session;
pub mod traits;
pub mod validation;

pub use config::{ConfigError, RecoveryConfig, SessionConfig};
pub use controls::{Control, ControlRegistry, RangePolicy};
pub use convert::{
    ChromaSubsampling, ConvertedView, FrameConverter, PackedImage, Plane, PlanarImage,
    Representation, View,
};
pub use decoder::ImageDecoder;
#[cfg(feature = "v4l2")]
pub use device::V4l2Transport;
pub use error::{CameraError, Result};
pub use frame::{time_monotonic, FrameMetadata, RawFrame};
pub use modes::{ModeEntry, ModeTable};
pub use negotiate::{BandwidthFactor, ModeNegotiator, NegotiatedStreamParams};
pub use registry::{list_devices, DeviceRegistry};
pub use session::{CaptureSession, SessionCloser, SessionState, SessionStats};
pub use traits::{
    AltSetting, ControlDescriptor, ControlKind, DeviceDescriptor, FourCC, FrameRate, Mode,
    PixelFormat, TransferStatus, Transport, UsbSpeed,
};
