//! rollcall-core: classroom face recognition.
//!
//! Detects faces in a group photo (SCRFD), embeds each crop (ArcFace) and
//! matches it against the enrolled gallery to produce the set of roll numbers
//! present. Both models run through ONNX Runtime; every stage sits behind a
//! trait so the pipeline can be driven without model files.

pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use detector::{FaceDetector, ScrfdDetector};
pub use matcher::{EmbeddingMatcher, FaceMatcher, MatchError, DEFAULT_DISTANCE_THRESHOLD};
pub use pipeline::{PipelineError, Recognition, RecognitionPipeline};
pub use recognizer::{ArcFaceEmbedder, Embedder};
pub use types::{BoundingBox, Embedding, GalleryEntry, InvalidRollNumber, MatchCandidate, RollNumber};
