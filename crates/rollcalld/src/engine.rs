use crate::config::Config;
use rollcall_core::detector::DetectorError;
use rollcall_core::recognizer::RecognizerError;
use rollcall_core::{
    ArcFaceEmbedder, Embedding, EmbeddingMatcher, GalleryEntry, PipelineError, Recognition, RecognitionPipeline,
    ScrfdDetector,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type Pipeline = RecognitionPipeline<ScrfdDetector, EmbeddingMatcher<ArcFaceEmbedder>>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("recognition did not finish within {0:?}")]
    Timeout(Duration),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Recognize {
        image: Vec<u8>,
        gallery: Vec<GalleryEntry>,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    Embed {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Recognize the students in a classroom photo, giving up after `timeout`.
    ///
    /// On timeout the engine still finishes the photo; its answer is dropped.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
        gallery: Vec<GalleryEntry>,
        timeout: Duration,
    ) -> Result<Recognition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                image,
                gallery,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed)?,
            Err(_) => Err(EngineError::Timeout(timeout)),
        }
    }

    /// Embed the most confident face of an enrollment photo.
    pub async fn embed(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models and prepares the scratch directory synchronously so
/// the daemon fails fast when either is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();

    let detector = ScrfdDetector::load(&scrfd_path)?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let embedder = ArcFaceEmbedder::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace embedder loaded");

    std::fs::create_dir_all(&config.scratch_dir)?;
    let mut pipeline: Pipeline = RecognitionPipeline::new(
        detector,
        EmbeddingMatcher::new(embedder, config.distance_threshold),
        &config.scratch_dir,
    );
    let threshold = pipeline.matcher_mut().threshold();
    tracing::info!(
        scratch = %pipeline.scratch_dir().display(),
        threshold,
        "recognition pipeline ready"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { image, gallery, reply } => {
                        let result = pipeline.recognize(&image, &gallery).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Embed { image, reply } => {
                        let _ = reply.send(run_embed(&mut pipeline, &image));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_embed(pipeline: &mut Pipeline, image: &[u8]) -> Result<Embedding, EngineError> {
    let face = pipeline.best_face(image)?;
    let embedding = pipeline.matcher_mut().embed(&face)?;
    tracing::debug!(dims = embedding.values.len(), "enrollment face embedded");
    Ok(embedding)
}
