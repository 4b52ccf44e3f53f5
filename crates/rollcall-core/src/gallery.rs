//! In-memory embedding gallery.
//!
//! A cache over persisted identities: rebuilt from storage at startup and
//! updated on enrollment. Entries are unique by identity id; adding an id
//! that is already present replaces its embedding in place.

use crate::extractor::ExtractError;
use crate::types::{Embedding, Identity};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum GalleryError {
    #[error("embedding has {actual} dimensions, gallery holds {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
}

/// One identity's embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity_id: String,
    pub embedding: Embedding,
}

/// Why an identity was left out of a gallery load.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedIdentity {
    pub identity_id: String,
    pub reason: String,
}

/// Outcome of [`Gallery::load`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedIdentity>,
}

#[derive(Debug, Default, Clone)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with one entry per identity.
    ///
    /// `embed` supplies each identity's embedding (the stored one, or a
    /// freshly computed one). Identities it fails for, and identities whose
    /// embedding does not fit the gallery, are skipped and reported.
    pub fn load<'a, I, F>(&mut self, identities: I, mut embed: F) -> LoadReport
    where
        I: IntoIterator<Item = &'a Identity>,
        F: FnMut(&Identity) -> Result<Embedding, ExtractError>,
    {
        self.entries.clear();
        let mut report = LoadReport::default();

        for identity in identities {
            let outcome = embed(identity)
                .map_err(|e| e.to_string())
                .and_then(|embedding| {
                    self.add(&identity.id, embedding).map_err(|e| e.to_string())
                });

            match outcome {
                Ok(()) => report.loaded += 1,
                Err(reason) => {
                    tracing::warn!(id = %identity.id, %reason, "skipping identity in gallery load");
                    report.skipped.push(SkippedIdentity {
                        identity_id: identity.id.clone(),
                        reason,
                    });
                }
            }
        }

        report
    }

    /// Check that `embedding` could be added under `identity_id`.
    pub fn check(&self, identity_id: &str, embedding: &Embedding) -> Result<(), GalleryError> {
        if embedding.values.is_empty() {
            return Err(GalleryError::EmptyEmbedding);
        }
        // Compare against the other entries: replacing the only entry may change the dimension.
        let expected = self
            .entries
            .iter()
            .find(|e| e.identity_id != identity_id)
            .map(|e| e.embedding.dimension());
        match expected {
            Some(expected) if expected != embedding.dimension() => {
                Err(GalleryError::DimensionMismatch {
                    expected,
                    actual: embedding.dimension(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Insert or replace the embedding for `identity_id`.
    pub fn add(&mut self, identity_id: &str, embedding: Embedding) -> Result<(), GalleryError> {
        self.check(identity_id, &embedding)?;

        match self.entries.iter_mut().find(|e| e.identity_id == identity_id) {
            Some(existing) => existing.embedding = embedding,
            None => self.entries.push(GalleryEntry {
                identity_id: identity_id.to_string(),
                embedding,
            }),
        }
        Ok(())
    }

    pub fn get(&self, identity_id: &str) -> Option<&Embedding> {
        self.entries
            .iter()
            .find(|e| e.identity_id == identity_id)
            .map(|e| &e.embedding)
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Embedding dimension shared by every entry, `None` when empty.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dimension())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
