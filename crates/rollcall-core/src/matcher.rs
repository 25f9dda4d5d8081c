//! Identity matching of one probe face against an enrolled gallery.

use crate::recognizer::{Embedder, RecognizerError};
use crate::types::{Embedding, GalleryEntry, MatchCandidate};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// Cosine distance at or below which a gallery entry counts as the same person.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.60;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("gallery has no entries")]
    EmptyGallery,
    #[error("probe image unreadable: {0}")]
    Probe(#[from] image::ImageError),
    #[error("embedding failed: {0}")]
    Embedding(#[from] RecognizerError),
}

/// Matches a face crop stored on disk against a gallery.
///
/// Returns every entry within threshold, nearest first. Several entries may
/// match the same face (multiple reference images per student).
pub trait FaceMatcher {
    fn find(&mut self, probe: &Path, gallery: &[GalleryEntry]) -> Result<Vec<MatchCandidate>, MatchError>;
}

/// Embeds the probe and ranks gallery entries by cosine distance.
pub struct EmbeddingMatcher<E> {
    embedder: E,
    threshold: f32,
}

impl<E: Embedder> EmbeddingMatcher<E> {
    pub fn new(embedder: E, threshold: f32) -> Self {
        Self { embedder, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Embed a face crop directly, bypassing the gallery. Used by enrollment.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        self.embedder.embed(face)
    }
}

impl<E: Embedder> FaceMatcher for EmbeddingMatcher<E> {
    fn find(&mut self, probe: &Path, gallery: &[GalleryEntry]) -> Result<Vec<MatchCandidate>, MatchError> {
        if gallery.is_empty() {
            return Err(MatchError::EmptyGallery);
        }

        let face = image::open(probe)?.to_rgb8();
        let embedding = self.embedder.embed(&face)?;
        Ok(rank_candidates(&embedding, gallery, self.threshold))
    }
}

/// Score every gallery entry and keep those within `threshold`, nearest first.
///
/// Entries embedded by a different model (other dimension or version) are
/// skipped, never scored on a truncated vector.
pub fn rank_candidates(probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = gallery
        .iter()
        .filter_map(|entry| {
            if !probe.is_comparable(&entry.embedding) {
                tracing::warn!(
                    roll = %entry.roll_number,
                    image = %entry.image_ref.display(),
                    probe_dims = probe.values.len(),
                    gallery_dims = entry.embedding.values.len(),
                    gallery_model = ?entry.embedding.model_version,
                    "gallery embedding incompatible with probe; re-enroll this reference"
                );
                return None;
            }
            let distance = probe.distance(&entry.embedding);
            (distance <= threshold).then(|| MatchCandidate {
                roll_number: entry.roll_number.clone(),
                image_ref: entry.image_ref.clone(),
                distance,
                threshold,
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    candidates
}
