//! Grayscale frames and the pixel helpers capture needs.

use thiserror::Error;

/// Luma below this counts as black.
const DARK_PIXEL_LEVEL: u8 = 32;

/// A frame is dark when more than this share of its pixels is black.
pub const DARK_FRAME_RATIO: f32 = 0.95;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("YUYV buffer holds {actual} bytes, {expected} needed")]
    InvalidLength { expected: usize, actual: usize },
}

/// One captured frame, `width * height` bytes of luma.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Driver sequence number.
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Self {
            data,
            width,
            height,
            sequence,
            is_dark,
        }
    }

    /// Mean luma, 0 for an empty frame.
    pub fn mean_luma(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&p| u64::from(p)).sum();
        sum as f32 / self.data.len() as f32
    }
}

/// Keep the Y byte of each `[Y0 U Y1 V]` group.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width as usize) * (height as usize) * 2;
    let packed = yuyv.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })?;
    Ok(packed
        .chunks_exact(4)
        .flat_map(|group| [group[0], group[2]])
        .collect())
}

/// Share of black pixels, 1.0 for an empty buffer.
pub fn dark_ratio(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 1.0;
    }
    let black = gray.iter().filter(|&&p| p < DARK_PIXEL_LEVEL).count();
    black as f32 / gray.len() as f32
}

pub fn is_dark_frame(gray: &[u8], max_ratio: f32) -> bool {
    gray.is_empty() || dark_ratio(gray) > max_ratio
}
