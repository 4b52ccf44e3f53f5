//! rollcall-hw: Camera capture for the recognition loop.
//!
//! Provides V4L2-based frame capture and the `FrameSource` seam the
//! recognition loop reads from.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraStream, CaptureSettings, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{CaptureError, FrameSource, ReplaySource};
