//! Colour webcam capture over V4L2.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Buffers queued per capture stream.
const MMAP_BUFFERS: u32 = 4;
/// `/dev/videoN` nodes probed by [`Camera::list_devices`].
const MAX_PROBED_NODES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("no such capture device: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("frame read failed: {0}")]
    CaptureFailed(String),
    #[error("no usable pixel format: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot capture video")]
    StreamingNotSupported,
}

/// Source of frames, read one at a time.
pub trait CameraDevice: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    /// Preference order. Uncompressed first; many webcams only reach 640x480 as MJPG.
    const PREFERRED: [PixelFormat; 2] = [PixelFormat::Yuyv, PixelFormat::Mjpeg];

    fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        }
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::PREFERRED.into_iter().find(|f| f.fourcc() == fourcc)
    }
}

/// An open V4L2 capture device producing RGB frames.
pub struct Camera {
    device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and negotiate `width` x `height` in a supported format.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, card = %caps.card, driver = %caps.driver, "camera opened");

        let (pixel_format, width, height) = negotiate(&device, width, height)?;
        tracing::info!(width, height, format = ?pixel_format, "capture format");

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            width,
            height,
            pixel_format,
        })
    }

    /// Dequeue one buffer and decode it to RGB.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("mmap stream: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;

        let decoded = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            // MJPG buffers are only partly filled.
            PixelFormat::Mjpeg => {
                let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);
                frame::mjpeg_to_rgb(used)
            }
        };
        let image = decoded.map_err(|e| CameraError::CaptureFailed(format!("decode: {e}")))?;

        Ok(Frame {
            image,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Every `/dev/videoN` node that reports video capture.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_PROBED_NODES)
            .map(|n| format!("/dev/video{n}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl CameraDevice for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

fn open_error(device_path: &str, err: std::io::Error) -> CameraError {
    if err.raw_os_error() == Some(16) || err.to_string().contains("busy") {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {err}"))
    }
}

/// Try each preferred format in turn and keep the first the driver accepts as-is.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(PixelFormat, u32, u32), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("read format: {e}")))?;
    fmt.width = width;
    fmt.height = height;

    let mut offered = Vec::new();
    for wanted in PixelFormat::PREFERRED {
        fmt.fourcc = wanted.fourcc();
        let got = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set {wanted:?}: {e}")))?;
        match PixelFormat::from_fourcc(got.fourcc) {
            Some(format) if format == wanted => return Ok((format, got.width, got.height)),
            _ => offered.push(got.fourcc),
        }
    }
    Err(CameraError::FormatNegotiationFailed(format!(
        "driver offered {offered:?}, need YUYV or MJPG"
    )))
}
