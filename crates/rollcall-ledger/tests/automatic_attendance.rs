//! End-to-end automatic attendance: synthetic classroom photo → pipeline →
//! reconciliation, against an in-memory ledger.

use chrono::NaiveDate;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rollcall_core::detector::DetectorError;
use rollcall_core::recognizer::RecognizerError;
use rollcall_core::{
    BoundingBox, Embedder, Embedding, EmbeddingMatcher, FaceDetector, GalleryEntry, RecognitionPipeline, RollNumber,
};
use rollcall_ledger::{
    cohort_gallery, record_recognition, run_automatic_attendance, AttendanceError, AttendanceOutcome, AttendanceStatus, Cohort, ConflictPolicy, Ledger, LedgerError,
    LectureSlot, Student,
};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RED: [u8; 3] = [220, 20, 20];
const GREEN: [u8; 3] = [20, 220, 20];
const BLUE: [u8; 3] = [20, 20, 220];

/// Detector that reports fixed boxes regardless of the image.
struct FixedDetector(Vec<BoundingBox>);

impl FaceDetector for FixedDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self.0.clone())
    }
}

/// Stand-in for a face model: a crop's identity is its mean colour.
struct MeanColorEmbedder;

impl Embedder for MeanColorEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let mut sum = [0f32; 3];
        for px in face.pixels() {
            for c in 0..3 {
                sum[c] += px.0[c] as f32;
            }
        }
        Ok(Embedding { values: sum.to_vec(), model_version: None })
    }
}

fn color_embedding(color: [u8; 3]) -> Embedding {
    Embedding { values: color.iter().map(|&c| c as f32).collect(), model_version: None }
}

fn roll(s: &str) -> RollNumber {
    s.parse().unwrap()
}

fn slot() -> LectureSlot {
    LectureSlot::new(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(), "L1")
}

fn cohort() -> Cohort {
    Cohort::new("ETRX", "LY")
}

/// Patch layout of the synthetic photo: one 40x40 "face" every 60px.
fn face_box(slot_index: u32) -> BoundingBox {
    let x = 10.0 + slot_index as f32 * 60.0;
    BoundingBox { x1: x, y1: 10.0, x2: x + 40.0, y2: 50.0, confidence: 0.9 }
}

/// Grey photo with one coloured patch per entry in `faces`.
fn classroom_photo(faces: &[[u8; 3]]) -> Vec<u8> {
    let mut photo = RgbImage::from_pixel(240, 60, Rgb([128, 128, 128]));
    for (i, color) in faces.iter().enumerate() {
        let b = face_box(i as u32);
        for y in b.y1 as u32..b.y2 as u32 {
            for x in b.x1 as u32..b.x2 as u32 {
                photo.put_pixel(x, y, Rgb(*color));
            }
        }
    }
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(photo)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

struct Fixture {
    ledger: Ledger,
    scratch: TempDir,
}

impl Fixture {
    /// Cohort ETRX/LY = {101 (red), 102 (green)}; 201 (blue) is COMP/LY.
    fn new() -> Self {
        let mut ledger = Ledger::open_in_memory().unwrap();
        for (r, branch, color) in [("101", "ETRX", RED), ("102", "ETRX", GREEN), ("201", "COMP", BLUE)] {
            ledger
                .enroll_student(&Student {
                    roll_number: roll(r),
                    name: format!("Student {r}"),
                    branch: branch.into(),
                    year: "LY".into(),
                })
                .unwrap();
            ledger
                .add_gallery_entry(&GalleryEntry {
                    roll_number: roll(r),
                    image_ref: PathBuf::from(format!("LY/{r}/{r}.jpeg")),
                    embedding: color_embedding(color),
                })
                .unwrap();
        }
        Self { ledger, scratch: tempfile::tempdir().unwrap() }
    }

    fn pipeline(&self, faces: usize) -> RecognitionPipeline<FixedDetector, EmbeddingMatcher<MeanColorEmbedder>> {
        let boxes = (0..faces as u32).map(face_box).collect();
        RecognitionPipeline::new(
            FixedDetector(boxes),
            EmbeddingMatcher::new(MeanColorEmbedder, 0.05),
            self.scratch.path(),
        )
    }

    fn run(&mut self, faces: &[[u8; 3]], policy: ConflictPolicy) -> Result<AttendanceOutcome, AttendanceError> {
        let mut pipeline = self.pipeline(faces.len());
        run_automatic_attendance(&mut pipeline, &mut self.ledger, &classroom_photo(faces), &slot(), &cohort(), policy)
    }

    fn status(&self, r: &str) -> Option<AttendanceStatus> {
        self.ledger.get_status(&roll(r), &slot()).unwrap()
    }

    fn assert_scratch_empty(&self) {
        assert!(dir_is_empty(self.scratch.path()), "scratch crops left behind");
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

fn rolls(list: &[RollNumber]) -> Vec<&str> {
    list.iter().map(|r| r.as_str()).collect()
}

#[test]
fn test_absent_student_flipped_and_rest_backfilled() {
    let mut fx = Fixture::new();
    fx.ledger.mark_absent(&roll("101"), &slot()).unwrap();

    let outcome = fx.run(&[RED], ConflictPolicy::Collect).unwrap();

    assert_eq!(rolls(&outcome.report.flipped_to_present), vec!["101"]);
    assert_eq!(rolls(&outcome.report.marked_absent), vec!["102"]);
    assert_eq!(fx.status("101"), Some(AttendanceStatus::Present));
    assert_eq!(fx.status("102"), Some(AttendanceStatus::Absent));
    assert_eq!(outcome.updated_count(), 2);
    fx.assert_scratch_empty();
}

#[test]
fn test_every_member_ends_with_exactly_one_record() {
    let mut fx = Fixture::new();
    fx.run(&[GREEN, RED], ConflictPolicy::Collect).unwrap();

    for summary in fx.ledger.cohort_summary(&cohort()).unwrap() {
        assert_eq!(summary.total_classes, 1, "{}", summary.roll_number);
        assert_eq!(summary.present_count, 1);
    }
    fx.assert_scratch_empty();
}

#[test]
fn test_zero_faces_marks_whole_cohort_absent() {
    let mut fx = Fixture::new();
    let outcome = fx.run(&[], ConflictPolicy::Collect).unwrap();

    assert!(outcome.recognition.roll_numbers.is_empty());
    assert_eq!(rolls(&outcome.report.marked_absent), vec!["101", "102"]);
    assert_eq!(fx.status("101"), Some(AttendanceStatus::Absent));
    assert_eq!(fx.status("102"), Some(AttendanceStatus::Absent));
    // Other cohorts are untouched.
    assert_eq!(fx.status("201"), None);
}

#[test]
fn test_unrecognized_face_contributes_nothing() {
    let mut fx = Fixture::new();
    let outcome = fx.run(&[[250, 250, 10], RED], ConflictPolicy::Collect).unwrap();

    assert_eq!(outcome.recognition.faces_detected, 2);
    assert_eq!(outcome.recognition.faces_unmatched, 1);
    assert_eq!(rolls(&outcome.report.marked_present), vec!["101"]);
    assert_eq!(rolls(&outcome.report.marked_absent), vec!["102"]);
}

#[test]
fn test_second_run_changes_nothing() {
    let mut fx = Fixture::new();
    fx.run(&[RED], ConflictPolicy::Collect).unwrap();

    let second = fx.run(&[RED], ConflictPolicy::Collect).unwrap();
    assert_eq!(second.updated_count(), 0);
    assert_eq!(second.report.conflicts.len(), 1);
    assert_eq!(second.report.conflicts[0].roll_number.as_str(), "101");
    assert_eq!(fx.status("101"), Some(AttendanceStatus::Present));
    assert_eq!(fx.status("102"), Some(AttendanceStatus::Absent));
}

#[test]
fn test_second_photo_flips_earlier_absence() {
    let mut fx = Fixture::new();
    fx.run(&[RED], ConflictPolicy::Collect).unwrap();
    assert_eq!(fx.status("102"), Some(AttendanceStatus::Absent));

    let outcome = fx.run(&[GREEN], ConflictPolicy::Collect).unwrap();
    assert_eq!(rolls(&outcome.report.flipped_to_present), vec!["102"]);
    assert!(outcome.report.marked_absent.is_empty());
    assert_eq!(fx.status("101"), Some(AttendanceStatus::Present));
    assert_eq!(fx.status("102"), Some(AttendanceStatus::Present));
}

#[test]
fn test_duplicate_collected_while_cohort_still_reconciles() {
    let mut fx = Fixture::new();
    fx.ledger.mark_present(&roll("101"), &slot()).unwrap();

    let outcome = fx.run(&[RED], ConflictPolicy::Collect).unwrap();
    assert_eq!(outcome.report.conflicts.len(), 1);
    assert_eq!(outcome.report.conflicts[0].status, AttendanceStatus::Present);
    assert_eq!(fx.status("102"), Some(AttendanceStatus::Absent));
}

#[test]
fn test_duplicate_aborts_and_rolls_back_under_abort_policy() {
    let mut fx = Fixture::new();
    fx.ledger.mark_present(&roll("102"), &slot()).unwrap();

    // 101 sorts first and is inserted before 102 conflicts.
    let err = fx.run(&[RED, GREEN], ConflictPolicy::Abort).unwrap_err();
    assert!(matches!(
        err,
        AttendanceError::Ledger(LedgerError::DuplicateMarking { ref roll_number, .. }) if roll_number.as_str() == "102"
    ));

    assert_eq!(fx.status("101"), None, "phase A insert must be rolled back");
    assert_eq!(fx.status("102"), Some(AttendanceStatus::Present));
    fx.assert_scratch_empty();
}

#[test]
fn test_recognized_student_outside_cohort_is_ignored() {
    let mut fx = Fixture::new();
    // Match against both partitions so 201 is recognized, then reconcile ETRX only.
    let mut pipeline = fx.pipeline(2);
    let gallery = {
        let mut all = fx.ledger.gallery_for(&cohort()).unwrap();
        all.extend(fx.ledger.gallery_for(&Cohort::new("COMP", "LY")).unwrap());
        all
    };
    let recognition = pipeline.recognize(&classroom_photo(&[BLUE, RED]), &gallery).unwrap();
    assert_eq!(recognition.roll_numbers.len(), 2);

    let report = fx
        .ledger
        .reconcile(&slot(), &cohort(), &recognition.roll_numbers, ConflictPolicy::Collect)
        .unwrap();
    assert_eq!(rolls(&report.ignored), vec!["201"]);
    assert_eq!(rolls(&report.marked_present), vec!["101"]);
    assert_eq!(fx.status("201"), None);
}

#[test]
fn test_cohort_gallery_scopes_matching() {
    let mut fx = Fixture::new();
    // 201 is in the photo but belongs to another cohort's gallery partition.
    let outcome = fx.run(&[BLUE], ConflictPolicy::Collect).unwrap();
    assert!(outcome.recognition.roll_numbers.is_empty());
    assert_eq!(rolls(&outcome.report.marked_absent), vec!["101", "102"]);
}

#[test]
fn test_undecodable_photo_leaves_ledger_untouched() {
    let mut fx = Fixture::new();
    let mut pipeline = fx.pipeline(1);

    let err = run_automatic_attendance(
        &mut pipeline,
        &mut fx.ledger,
        b"GIF89a-truncated",
        &slot(),
        &cohort(),
        ConflictPolicy::Collect,
    )
    .unwrap_err();

    assert!(matches!(err, AttendanceError::Pipeline(_)));
    assert_eq!(fx.status("101"), None);
    assert_eq!(fx.status("102"), None);
    fx.assert_scratch_empty();
}

#[test]
fn test_split_steps_match_single_call() {
    let mut fx = Fixture::new();
    let mut pipeline = fx.pipeline(2);

    let gallery = cohort_gallery(&fx.ledger, &cohort()).unwrap();
    assert_eq!(gallery.len(), 2);
    let recognition = pipeline.recognize(&classroom_photo(&[GREEN, BLUE]), &gallery).unwrap();
    let split = record_recognition(&mut fx.ledger, recognition, &slot(), &cohort(), ConflictPolicy::Collect).unwrap();
    assert_eq!(rolls(&split.report.marked_present), vec!["102"]);
    assert_eq!(rolls(&split.report.marked_absent), vec!["101"]);

    let mut other = Fixture::new();
    let single = other.run(&[GREEN, BLUE], ConflictPolicy::Collect).unwrap();
    assert_eq!(single.report, split.report);
    assert_eq!(single.recognition.roll_numbers, split.recognition.roll_numbers);
}
