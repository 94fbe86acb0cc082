//! uvc-capture binary: list cameras and capture frames.
//!
//! ```bash
//! # Cameras, their modes and controls
//! uvc-capture list
//!
//! # Ten VGA frames from the first camera with 30% bandwidth headroom
//! uvc-capture capture --width 640 --height 480 --fps 30 --bandwidth-factor 1.3
//!
//! # Same against a scripted camera, no hardware needed
//! uvc-capture --mock capture --frames 5
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uvc_capture::mock::{MockDevice, MockTransport};
use uvc_capture::{
    list_devices, BandwidthFactor, CameraError, CaptureSession, DeviceRegistry, Mode,
    PixelFormat, SessionConfig, Transport,
};

#[derive(Debug, Parser)]
#[command(name = "uvc-capture", version, about = "Capture frames from UVC cameras")]
struct Cli {
    /// Use a simulated camera instead of the V4L2 backend
    #[arg(long, global = true)]
    mock: bool,

    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List attached cameras with their modes and controls
    List,
    /// Stream a mode and print per-frame statistics
    Capture {
        /// Device uid (default: first camera)
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// YUYV, UYVY, NV12, GRAY, BGR or MJPEG
        #[arg(long, default_value = "YUYV", value_parser = parse_format)]
        format: PixelFormat,
        /// Bandwidth safety multiplier (default: from config)
        #[arg(long)]
        bandwidth_factor: Option<f32>,
        /// Frames to capture
        #[arg(long, default_value_t = 10)]
        frames: usize,
    },
}

fn parse_format(name: &str) -> Result<PixelFormat, String> {
    [
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Nv12,
        PixelFormat::Gray8,
        PixelFormat::Bgr24,
        PixelFormat::Bayer8,
        PixelFormat::Mjpeg,
    ]
    .into_iter()
    .find(|format| {
        format.name().eq_ignore_ascii_case(name) || format.fourcc().to_string().eq_ignore_ascii_case(name)
    })
    .ok_or_else(|| format!("unknown pixel format '{name}'"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uvc_capture=info")),
        )
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn transport(mock: bool) -> Result<Arc<dyn Transport>, CameraError> {
    if mock {
        return Ok(Arc::new(MockTransport::new(vec![
            MockDevice::new("mock-0").with_name("Simulated Camera"),
        ])));
    }
    #[cfg(feature = "v4l2")]
    {
        Ok(Arc::new(uvc_capture::V4l2Transport::new()))
    }
    #[cfg(not(feature = "v4l2"))]
    {
        Err(CameraError::TransportUnavailable(
            "built without the v4l2 feature; use --mock".to_owned(),
        ))
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let transport = transport(cli.mock)?;

    match cli.command {
        Command::List => list(transport.as_ref()),
        Command::Capture {
            device,
            width,
            height,
            fps,
            format,
            bandwidth_factor,
            frames,
        } => {
            let factor = match bandwidth_factor {
                Some(value) => BandwidthFactor::new(value)?,
                None => config.bandwidth_factor,
            };
            capture(
                transport,
                config,
                device.as_deref(),
                Mode::new(width, height, fps, format),
                factor,
                frames,
            )
        }
    }
}

fn list(transport: &dyn Transport) -> Result<(), Box<dyn std::error::Error>> {
    let devices = list_devices(transport)?;
    if devices.is_empty() {
        println!("No cameras found");
    }
    for device in devices {
        println!("{device}");
        println!("  Location: {} ({:?} speed)", device.location, device.speed);
        for entry in device.modes.entries() {
            println!(
                "  Mode: {} (max {} bytes/frame)",
                entry.mode, entry.max_frame_bytes
            );
        }
        for control in &device.controls {
            println!(
                "  Control {:#010x}: {} [{}, {}] default {}",
                control.id, control.display_name, control.min, control.max, control.default
            );
        }
    }
    Ok(())
}

fn capture(
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    uid: Option<&str>,
    mode: Mode,
    factor: BandwidthFactor,
    frames: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = DeviceRegistry::scan(transport)?;
    let uid = match uid {
        Some(uid) => uid.to_owned(),
        None => registry
            .devices()
            .first()
            .map(|device| device.uid.clone())
            .ok_or_else(|| CameraError::DeviceNotFound("<any>".to_owned()))?,
    };

    let mut session: CaptureSession = registry.open_session(&uid, config)?;
    if let Some(device) = session.descriptor() {
        println!("Device: {device}");
    }
    session.set_mode(mode, factor)?;
    if let Some(params) = session.negotiated() {
        println!(
            "Mode: {} (alt-setting {}, {} of {} bytes/interval)",
            params.mode,
            params.alt_setting,
            params.required_bytes_per_interval,
            params.packet_size
        );
    }

    let converter = session.converter();
    for _ in 0..frames {
        let frame = session.get_frame_robust()?;
        let mean = converter
            .gray(frame)
            .map_or_else(|err| format!("n/a ({err})"), |gray| format!("{:.1}", gray.mean()));
        println!(
            "Frame {}: {} bytes, {}, timestamp: {:?}, mean luma: {mean}",
            frame.sequence(),
            frame.bytes_used(),
            if frame.received_fully() { "complete" } else { "partial" },
            frame.timestamp()
        );
    }

    let stats = session.stats();
    println!(
        "Delivered {} frames ({} dropped, {} transient faults)",
        stats.frames_delivered, stats.frames_dropped, stats.transient_faults
    );
    session.close();
    Ok(())
}
