use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid roll number {0:?}: expected a non-empty string of digits")]
pub struct InvalidRollNumber(pub String);

/// Unique student key. Always a non-empty run of ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RollNumber(String);

impl RollNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RollNumber {
    type Err = InvalidRollNumber;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidRollNumber(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for RollNumber {
    type Error = InvalidRollNumber;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RollNumber> for String {
    fn from(value: RollNumber) -> Self {
        value.0
    }
}

impl fmt::Display for RollNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Axis-aligned face box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Integer crop rectangle `(x, y, width, height)` clamped to an image of the
    /// given size. Returns `None` when nothing of the box lies inside the image.
    pub fn clamped_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x1.max(0.0).floor().min(image_width as f32) as u32;
        let y1 = self.y1.max(0.0).floor().min(image_height as f32) as u32;
        let x2 = self.x2.max(0.0).ceil().min(image_width as f32) as u32;
        let y2 = self.y2.max(0.0).ceil().min(image_height as f32) as u32;

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance in [0, 2]. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Whether the two vectors live in the same space: equal dimension and,
    /// when both record one, the same model version.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        let same_model = match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        same_model && !self.values.is_empty() && self.values.len() == other.values.len()
    }
}

/// One enrolled reference face. The index maps the image reference to its
/// roll number explicitly; nothing downstream parses the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub roll_number: RollNumber,
    pub image_ref: PathBuf,
    pub embedding: Embedding,
}

/// A gallery entry that passed the matcher's threshold for one probe face.
#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub roll_number: RollNumber,
    pub image_ref: PathBuf,
    pub distance: f32,
    pub threshold: f32,
}
