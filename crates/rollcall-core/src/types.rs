use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::gallery::GalleryEntry;

/// Bounding box for a located face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

/// Face embedding vector produced by the external extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding, if the extractor reports one.
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must ensure both embeddings share a dimension; extra
    /// components on the longer side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable unique key, e.g. a roll number.
    pub id: String,
    pub display_name: String,
    /// Free-form attributes such as course or cohort.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Stored copy of the reference image the embedding was derived from.
    pub reference_image: PathBuf,
    pub embedding: Embedding,
    /// RFC 3339 timestamp of the (latest) enrollment.
    pub enrolled_at: String,
}

/// Result of matching a candidate embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, or `None` for an unknown face.
    pub identity_id: Option<String>,
    /// Distance of the reported candidate. For an unknown face this is the
    /// closest distance seen, or infinity when nothing was comparable.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            identity_id: None,
            distance,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// Which gallery entry wins when several fall under the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Globally closest entry; ties keep the earliest entry.
    #[default]
    Closest,
    /// First entry in insertion order under the threshold (legacy behaviour).
    #[serde(alias = "first")]
    FirstUnderThreshold,
}

impl std::str::FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closest" => Ok(Self::Closest),
            "first" | "first_under_threshold" => Ok(Self::FirstUnderThreshold),
            other => Err(format!("unknown match policy: {other}")),
        }
    }
}

/// Strategy for comparing a candidate embedding against the gallery.
pub trait Matcher {
    fn compare(&self, candidate: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Euclidean distance matcher. A candidate matches when its distance is
/// `<= threshold`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher {
    pub policy: MatchPolicy,
}

impl EuclideanMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, candidate: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.dimension() != candidate.dimension() {
                continue;
            }
            let dist = candidate.euclidean_distance(&entry.embedding);

            if self.policy == MatchPolicy::FirstUnderThreshold && dist <= threshold {
                return MatchResult {
                    identity_id: Some(entry.identity_id.clone()),
                    distance: dist,
                };
            }
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist <= threshold => MatchResult {
                identity_id: Some(gallery[idx].identity_id.clone()),
                distance: best_dist,
            },
            _ => MatchResult::unknown(best_dist),
        }
    }
}
