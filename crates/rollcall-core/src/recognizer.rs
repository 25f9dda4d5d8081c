//! ArcFace face embedder via ONNX Runtime.
//!
//! Turns a cropped RGB face into a 512-dimensional L2-normalized embedding
//! using the w600k_r50 model.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalizes symmetrically
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face crop")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces identity embeddings from face crops.
pub trait Embedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Resize a face crop to 112x112 and pack it into a NCHW float tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as usize;
        let resized = if face.dimensions() == (ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE) {
            face.clone()
        } else {
            imageops::resize(face, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle)
        };

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(RecognizerError::EmptyCrop);
        }

        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
