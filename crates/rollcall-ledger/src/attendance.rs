use crate::ledger::{Ledger, LedgerError};
use crate::model::{Cohort, LectureSlot};
use crate::reconcile::{ConflictPolicy, ReconcileReport};
use rollcall_core::{FaceDetector, FaceMatcher, GalleryEntry, PipelineError, Recognition, RecognitionPipeline};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceOutcome {
    pub recognition: Recognition,
    pub report: ReconcileReport,
}

impl AttendanceOutcome {
    pub fn updated_count(&self) -> usize {
        self.report.updated_count()
    }
}

/// Take attendance for `cohort` at `slot` from one classroom photo.
///
/// Matching runs against the cohort's own gallery partition. Recognition
/// happens before the ledger is touched, so a photo that cannot be decoded
/// leaves every record as it was.
///
/// The daemon runs the same three steps with recognition on its engine
/// thread: [`cohort_gallery`], then the pipeline, then [`record_recognition`].
pub fn run_automatic_attendance<D: FaceDetector, M: FaceMatcher>(
    pipeline: &mut RecognitionPipeline<D, M>,
    ledger: &mut Ledger,
    image: &[u8],
    slot: &LectureSlot,
    cohort: &Cohort,
    policy: ConflictPolicy,
) -> Result<AttendanceOutcome, AttendanceError> {
    let gallery = cohort_gallery(ledger, cohort)?;
    let recognition = pipeline.recognize(image, &gallery)?;
    Ok(record_recognition(ledger, recognition, slot, cohort, policy)?)
}

/// Gallery partition a photo of `cohort` is matched against.
pub fn cohort_gallery(ledger: &Ledger, cohort: &Cohort) -> Result<Vec<GalleryEntry>, LedgerError> {
    let gallery = ledger.gallery_for(cohort)?;
    if gallery.is_empty() {
        tracing::warn!(cohort = %cohort, "cohort has no gallery entries; every member will be absent");
    }
    Ok(gallery)
}

/// Reconcile a finished recognition into the ledger.
pub fn record_recognition(
    ledger: &mut Ledger,
    recognition: Recognition,
    slot: &LectureSlot,
    cohort: &Cohort,
    policy: ConflictPolicy,
) -> Result<AttendanceOutcome, LedgerError> {
    let report = ledger.reconcile(slot, cohort, &recognition.roll_numbers, policy)?;
    Ok(AttendanceOutcome { recognition, report })
}
