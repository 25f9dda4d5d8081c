//! Recognition pipeline: classroom photo in, recognized roll numbers out.
//!
//! Every detected face is handled in isolation. A degenerate box, a crop that
//! cannot be written, or a matcher failure only drops that one face; the rest
//! of the photo is still recognized. Only an undecodable image or a detector
//! failure fails the whole request.

use crate::detector::{DetectorError, FaceDetector};
use crate::matcher::FaceMatcher;
use crate::types::{BoundingBox, GalleryEntry, RollNumber};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Side length every face crop is normalized to before matching.
pub const FACE_CROP_SIZE: u32 = 224;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image could not be decoded: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("face detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("no face detected in photo")]
    NoFaceDetected,
}

/// Outcome of recognizing one photo.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Recognition {
    pub roll_numbers: BTreeSet<RollNumber>,
    pub faces_detected: usize,
    /// Faces dropped before matching (degenerate box or scratch write failure).
    pub faces_skipped: usize,
    /// Faces that were matched but yielded no candidate, including matcher errors.
    pub faces_unmatched: usize,
}

pub struct RecognitionPipeline<D, M> {
    detector: D,
    matcher: M,
    scratch_dir: PathBuf,
}

impl<D: FaceDetector, M: FaceMatcher> RecognitionPipeline<D, M> {
    pub fn new(detector: D, matcher: M, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            detector,
            matcher,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn matcher_mut(&mut self) -> &mut M {
        &mut self.matcher
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Recognize every enrolled student visible in an encoded photo.
    pub fn recognize(&mut self, image_bytes: &[u8], gallery: &[GalleryEntry]) -> Result<Recognition, PipelineError> {
        let photo = image::load_from_memory(image_bytes)?.to_rgb8();
        let faces = self.detector.detect(&photo)?;

        let mut recognition = Recognition {
            faces_detected: faces.len(),
            ..Recognition::default()
        };

        for (index, face) in faces.iter().enumerate() {
            let Some(crop) = crop_face(&photo, face) else {
                tracing::debug!(face = index, ?face, "degenerate face box; skipping");
                recognition.faces_skipped += 1;
                continue;
            };

            let Some(found) = self.match_crop(index, &crop, gallery) else {
                recognition.faces_skipped += 1;
                continue;
            };

            if found.is_empty() {
                recognition.faces_unmatched += 1;
            }
            recognition.roll_numbers.extend(found);
        }

        tracing::info!(
            faces = recognition.faces_detected,
            skipped = recognition.faces_skipped,
            unmatched = recognition.faces_unmatched,
            recognized = recognition.roll_numbers.len(),
            "photo recognized"
        );

        Ok(recognition)
    }

    /// Detect faces in an enrollment photo and return the most confident one,
    /// cropped and normalized the same way recognition crops are.
    pub fn best_face(&mut self, image_bytes: &[u8]) -> Result<RgbImage, PipelineError> {
        let photo = image::load_from_memory(image_bytes)?.to_rgb8();
        let faces = self.detector.detect(&photo)?;

        faces
            .iter()
            .filter(|f| f.clamped_rect(photo.width(), photo.height()).is_some())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .and_then(|face| crop_face(&photo, face))
            .ok_or(PipelineError::NoFaceDetected)
    }

    /// Write the crop to a scratch file, match it, and remove the file.
    ///
    /// `None` means the crop never reached the matcher. The scratch file is
    /// owned by a `NamedTempFile` and removed when it drops, on every path.
    fn match_crop(&mut self, index: usize, crop: &RgbImage, gallery: &[GalleryEntry]) -> Option<Vec<RollNumber>> {
        let mut scratch = match tempfile::Builder::new()
            .prefix(&format!("face_{index}_"))
            .suffix(".jpeg")
            .tempfile_in(&self.scratch_dir)
        {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(face = index, dir = %self.scratch_dir.display(), error = %err, "cannot create scratch file");
                return None;
            }
        };

        if let Err(err) = DynamicImage::ImageRgb8(crop.clone()).write_to(scratch.as_file_mut(), ImageFormat::Jpeg) {
            tracing::warn!(face = index, error = %err, "cannot write scratch face crop");
            return None;
        }

        match self.matcher.find(scratch.path(), gallery) {
            Ok(candidates) => {
                tracing::debug!(
                    face = index,
                    candidates = ?candidates.iter().map(|c| (c.roll_number.as_str(), c.distance)).collect::<Vec<_>>(),
                    "face matched"
                );
                Some(candidates.into_iter().map(|c| c.roll_number).collect())
            }
            Err(err) => {
                tracing::warn!(face = index, error = %err, "matcher failed; treating face as unmatched");
                Some(Vec::new())
            }
        }
    }
}

/// Crop a face box from the photo and resize it to the matcher input size.
/// Returns `None` for boxes with no area inside the photo.
pub fn crop_face(photo: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = face.clamped_rect(photo.width(), photo.height())?;
    let crop = imageops::crop_imm(photo, x, y, w, h).to_image();
    Some(imageops::resize(&crop, FACE_CROP_SIZE, FACE_CROP_SIZE, FilterType::Triangle))
}
