//! SCRFD face detector via ONNX Runtime.
//!
//! Classroom photos are large and contain many small faces, so the whole frame
//! is letterboxed into the 640x640 model input and every box is mapped back to
//! source pixels before it leaves this module.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in a full-frame image.
///
/// Implementations borrow the image immutably; returned boxes are relative to
/// it. An empty result is a valid answer, not an error.
pub trait FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Scale and padding applied when fitting the frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    /// Map a point from model-input space back to the source frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self { session, stride_indices })
    }

    fn preprocess(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
        let size = SCRFD_INPUT_SIZE as usize;
        let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Padding is left at 0.0, which is SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + off_x, y as usize + off_y);
            if tx >= size || ty >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        tensor
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(image.width(), image.height());
        let input = Self::preprocess(image, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            detections.extend(decode_stride(scores, bboxes, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let faces = nms(detections, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), width = image.width(), height = image.height(), "SCRFD detection");
        Ok(faces)
    }
}

/// Map score/bbox tensors to stride slots by name ("score_8", "bbox_16", ...),
/// falling back to the standard positional layout [0-2]=scores, [3-5]=bboxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => named[slot] = (score, bbox),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    named
}

/// Decode detections above `threshold` for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..num_anchors)
        .filter_map(|idx| {
            let score = scores.get(idx).copied().unwrap_or(0.0);
            if score <= threshold {
                return None;
            }
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * step, cy + offsets[3] * step);

            Some(BoundingBox { x1, y1, x2, y2, confidence: score })
        })
        .collect()
}

/// Non-maximum suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;

    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x1: x, y1: y, x2: x + w, y2: y + h, confidence: conf }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_separate_faces_in_a_row() {
        // A classroom row: neighbours close together but not overlapping much.
        let detections = vec![
            bbox(0.0, 0.0, 40.0, 40.0, 0.7),
            bbox(45.0, 0.0, 40.0, 40.0, 0.9),
            bbox(90.0, 0.0, 40.0, 40.0, 0.8),
            bbox(47.0, 2.0, 40.0, 40.0, 0.6),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 3);
        let confidences: Vec<f32> = result.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape_unmap() {
        // 1280x720 → scale 0.5, content 640x360, vertical padding 140.
        let lb = Letterbox::fit(1280, 720);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);

        let (x, y) = lb.unmap(100.0 * 0.5, 50.0 * 0.5 + 140.0);
        assert!((x - 100.0).abs() < 0.01, "x = {x}");
        assert!((y - 50.0).abs() < 0.01, "y = {y}");
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let image = RgbImage::from_pixel(1280, 720, image::Rgb([255, 255, 255]));
        let lb = Letterbox::fit(1280, 720);
        let tensor = ScrfdDetector::preprocess(&image, &lb);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // Top padding band stays at the normalized mean.
        assert_eq!(tensor[[0, 0, 10, 320]], 0.0);
        // Content band holds the normalized white pixel.
        let white = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 320, 320]] - white).abs() < 0.02);
    }

    #[test]
    fn test_decode_stride_maps_to_source_pixels() {
        let stride = 32usize;
        let grid = 640 / stride;
        let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; num_anchors];
        let mut bboxes = vec![0.0f32; num_anchors * 4];

        // Anchor at cell (x=5, y=3), first anchor in the cell.
        let idx = (3 * grid + 5) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let lb = Letterbox { scale: 0.5, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(&scores, &bboxes, stride, &lb, 0.5);
        assert_eq!(dets.len(), 1);

        let d = dets[0];
        // Centre (160, 96) ± 32 in model space, doubled for scale 0.5.
        assert!((d.x1 - 256.0).abs() < 1e-3);
        assert!((d.y1 - 128.0).abs() < 1e-3);
        assert!((d.x2 - 384.0).abs() < 1e-3);
        assert!((d.y2 - 256.0).abs() < 1e-3);
        assert!((d.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_below_threshold() {
        let scores = vec![0.3f32; 800];
        let bboxes = vec![1.0f32; 3200];
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &bboxes, 32, &lb, 0.5).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }
}
