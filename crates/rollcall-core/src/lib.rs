//! rollcall-core: Identity matching for face-based attendance.
//!
//! Holds the embedding gallery, the Euclidean matcher, and the interfaces
//! to the external face locator and embedding extractor.

pub mod extractor;
pub mod gallery;
pub mod types;

pub use extractor::{EmbeddingExtractor, ExtractError, FaceLocator, FacePipeline, FaceRegion};
pub use gallery::{Gallery, GalleryEntry, GalleryError, LoadReport, SkippedIdentity};
pub use types::{BoundingBox, Embedding, EuclideanMatcher, Identity, MatchPolicy, MatchResult, Matcher};

/// Default maximum Euclidean distance for a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
