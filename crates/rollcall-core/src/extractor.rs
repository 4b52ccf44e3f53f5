//! Interfaces to the external face locator and embedding extractor.
//!
//! The detection and embedding algorithms are black boxes; rollcall only
//! hands them grayscale pixels and receives boxes or vectors back.

use crate::types::{BoundingBox, Embedding};
use image::{GrayImage, Luma};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("extractor failed: {0}")]
    Backend(String),
}

/// A grayscale image region expected to contain one face.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub image: GrayImage,
}

impl FaceRegion {
    /// Crop `bbox` out of a grayscale frame, clamping it to the frame bounds.
    ///
    /// Returns `None` if the clamped box is empty or the buffer is too short.
    pub fn crop(gray: &[u8], width: u32, height: u32, bbox: &BoundingBox) -> Option<Self> {
        if gray.len() < (width as usize) * (height as usize) {
            return None;
        }

        let x0 = bbox.x.max(0.0).floor() as u32;
        let y0 = bbox.y.max(0.0).floor() as u32;
        let x1 = ((bbox.x + bbox.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((bbox.y + bbox.height).ceil().max(0.0) as u32).min(height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }

        let w = width as usize;
        let image = GrayImage::from_fn(x1 - x0, y1 - y0, |x, y| {
            let idx = (y0 + y) as usize * w + (x0 + x) as usize;
            Luma([gray[idx]])
        });
        Some(Self { image })
    }

    /// Load a reference image from disk as grayscale.
    pub fn open(path: &Path) -> Result<Self, image::ImageError> {
        let image = image::open(path)?.to_luma8();
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Row-major grayscale pixels.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }
}

/// Finds face bounding boxes in a grayscale frame.
pub trait FaceLocator {
    fn locate(&mut self, gray: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, ExtractError>;
}

/// Maps a face region to a fixed-length embedding.
pub trait EmbeddingExtractor {
    /// Fails with [`ExtractError::NoFaceDetected`] when the region holds no face.
    fn extract(&mut self, region: &FaceRegion) -> Result<Embedding, ExtractError>;

    /// Version of the model behind this extractor, used to detect stale
    /// stored embeddings.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// A backend that both locates faces and embeds them.
pub trait FacePipeline: FaceLocator + EmbeddingExtractor {}

impl<T: FaceLocator + EmbeddingExtractor> FacePipeline for T {}
