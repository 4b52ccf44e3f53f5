//! V4L2 capture via the `v4l` crate.
//!
//! The camera is asked for YUYV at the configured resolution; drivers that
//! only offer 8-bit GREY (common on IR sensors) are accepted as-is. Either
//! way the recognition loop only ever sees grayscale [`Frame`]s.

use std::io;
use std::path::Path;

use crate::frame::{self, Frame};
use crate::source::{CaptureError, FrameSource};
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const EBUSY: i32 = 16;

/// Requested capture geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    /// Number of mmap buffers queued with the driver.
    pub buffers: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            buffers: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the capture path can turn into grayscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, luma in every other byte.
    Yuyv,
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }

    fn to_gray(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
                .map_err(|e| CaptureError::CaptureFailed(e.to_string())),
            Self::Grey => {
                let len = (width as usize) * (height as usize);
                buf.get(..len).map(<[u8]>::to_vec).ok_or_else(|| {
                    CaptureError::CaptureFailed(format!(
                        "short GREY buffer: {} of {len} bytes",
                        buf.len()
                    ))
                })
            }
        }
    }
}

fn open_error(device_path: &str, err: io::Error) -> CaptureError {
    if err.raw_os_error() == Some(EBUSY) {
        CaptureError::DeviceBusy
    } else {
        CaptureError::DeviceNotFound(format!("{device_path}: {err}"))
    }
}

/// An open V4L2 capture device.
pub struct Camera {
    device: Device,
    width: u32,
    height: u32,
    buffers: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    pub fn open_with(device_path: &str, settings: CaptureSettings) -> Result<Self, CaptureError> {
        if !Path::new(device_path).exists() {
            return Err(CaptureError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::StreamingNotSupported);
        }

        let (width, height, pixel_format) = negotiate(&device, settings)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width,
            height,
            format = ?pixel_format,
            "camera ready"
        );

        Ok(Self {
            device,
            width,
            height,
            buffers: settings.buffers.max(1),
            pixel_format,
        })
    }

    /// Start streaming. The stream borrows the camera and stops when dropped.
    pub fn stream(&self) -> Result<CameraStream<'_>, CaptureError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, self.buffers)
            .map_err(|e| CaptureError::CaptureFailed(format!("start mmap stream: {e}")))?;
        Ok(CameraStream {
            camera: self,
            stream,
        })
    }

    /// Capture-capable `/dev/video*` nodes, sorted by path.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut paths: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("video"))
            .map(|name| format!("/dev/{name}"))
            .collect();
        paths.sort();

        paths
            .into_iter()
            .filter_map(|path| {
                let caps = Device::with_path(&path).and_then(|dev| dev.query_caps()).ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                        path,
                    })
            })
            .collect()
    }
}

/// Ask for YUYV at the requested size and accept whatever grayscale-able
/// format the driver settles on.
fn negotiate(device: &Device, settings: CaptureSettings) -> Result<(u32, u32, PixelFormat), CaptureError> {
    let mut format = device
        .format()
        .map_err(|e| CaptureError::FormatNegotiationFailed(format!("read format: {e}")))?;
    format.width = settings.width;
    format.height = settings.height;
    format.fourcc = FourCC::new(b"YUYV");

    let actual = device
        .set_format(&format)
        .map_err(|e| CaptureError::FormatNegotiationFailed(format!("set format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
        CaptureError::FormatNegotiationFailed(format!(
            "driver chose {:?}, expected YUYV or GREY",
            actual.fourcc
        ))
    })?;

    if (actual.width, actual.height) != (settings.width, settings.height) {
        tracing::warn!(
            requested_width = settings.width,
            requested_height = settings.height,
            width = actual.width,
            height = actual.height,
            "driver adjusted capture size"
        );
    }
    Ok((actual.width, actual.height, pixel_format))
}

/// A running capture on a [`Camera`].
pub struct CameraStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameSource for CameraStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CaptureError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        let camera = self.camera;
        let gray = camera.pixel_format.to_gray(buf, camera.width, camera.height)?;
        Ok(Frame::from_gray(gray, camera.width, camera.height, meta.sequence))
    }
}
