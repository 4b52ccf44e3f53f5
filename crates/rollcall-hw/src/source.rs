//! Frame source abstraction used by the recognition loop.

use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture device is in use by another process")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no usable pixel format: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot capture video")]
    StreamingNotSupported,
    #[error("frame source exhausted")]
    Exhausted,
}

/// Supplies successive frames. An error ends the capture session.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Replays a fixed list of frames, then reports [`CaptureError::Exhausted`].
#[derive(Debug, Default)]
pub struct ReplaySource {
    frames: std::collections::VecDeque<Frame>,
}

impl ReplaySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        self.frames.pop_front().ok_or(CaptureError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_source_exhausts() {
        let mut source = ReplaySource::new([
            Frame::from_gray(vec![1], 1, 1, 0),
            Frame::from_gray(vec![2], 1, 1, 1),
        ]);
        assert_eq!(source.next_frame().unwrap().data, vec![1]);
        assert_eq!(source.remaining(), 1);
        assert_eq!(source.next_frame().unwrap().sequence, 1);
        assert!(matches!(source.next_frame(), Err(CaptureError::Exhausted)));
    }
}
