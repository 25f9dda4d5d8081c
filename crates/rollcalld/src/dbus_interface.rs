use crate::engine::{EngineError, EngineHandle};
use crate::jobs::JobRegistry;
use rollcall_core::gallery::scan_partition;
use rollcall_core::{GalleryEntry, RollNumber};
use rollcall_ledger::{
    cohort_gallery, parse_weekday, record_recognition, AttendanceOutcome, AttendanceStatus, Cohort, ConflictPolicy,
    LectureSlot, Ledger, LedgerError, ScheduledLecture, Student, Toggle,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

pub type SharedLedger = Arc<Mutex<Ledger>>;

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
#[derive(Clone)]
pub struct AttendanceService {
    ledger: SharedLedger,
    engine: EngineHandle,
    jobs: JobRegistry,
    recognize_timeout: Duration,
    conflict_policy: ConflictPolicy,
    distance_threshold: f32,
}

impl AttendanceService {
    pub fn new(
        ledger: SharedLedger,
        engine: EngineHandle,
        recognize_timeout: Duration,
        conflict_policy: ConflictPolicy,
        distance_threshold: f32,
    ) -> Self {
        Self {
            ledger,
            engine,
            jobs: JobRegistry::default(),
            recognize_timeout,
            conflict_policy,
            distance_threshold,
        }
    }

    /// Run `f` against the ledger on the blocking pool.
    async fn with_ledger<T, F>(&self, f: F) -> Result<T, LedgerCallError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Ledger) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || {
            let mut guard = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|err| LedgerCallError::Panicked(err.to_string()))?
        .map_err(LedgerCallError::Ledger)
    }

    /// The steps of `run_automatic_attendance`, split so recognition runs on
    /// the engine thread and the ledger is only locked around its own steps.
    /// Runs detached from the D-Bus call.
    async fn run_job(&self, image: Vec<u8>, slot: LectureSlot, cohort: Cohort) -> Result<AttendanceOutcome, String> {
        let gallery_cohort = cohort.clone();
        let gallery = self
            .with_ledger(move |ledger| cohort_gallery(ledger, &gallery_cohort))
            .await
            .map_err(|e| e.to_string())?;

        let recognition = self
            .engine
            .recognize(image, gallery, self.recognize_timeout)
            .await
            .map_err(|e| e.to_string())?;

        let policy = self.conflict_policy;
        self.with_ledger(move |ledger| record_recognition(ledger, recognition, &slot, &cohort, policy))
            .await
            .map_err(|e| e.to_string())
    }

    async fn mark(&self, roll: &str, date: &str, lecture: &str, status: AttendanceStatus) -> fdo::Result<String> {
        let roll = parse_roll(roll)?;
        let slot = parse_slot(date, lecture)?;
        tracing::info!(roll = %roll, slot = %slot, %status, "manual marking requested");

        let (reply_roll, reply_slot) = (roll.clone(), slot.clone());
        let toggle = self
            .with_ledger(move |ledger| match status {
                AttendanceStatus::Present => ledger.mark_present(&roll, &slot),
                AttendanceStatus::Absent => ledger.mark_absent(&roll, &slot),
            })
            .await?;
        Ok(toggle_json(&reply_roll, &reply_slot, status, toggle).to_string())
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Queue automatic attendance for one classroom photo. Returns a job id
    /// to poll with `JobStatus`.
    async fn submit_photo(&self, path: &str, date: &str, lecture: &str, branch: &str, year: &str) -> fdo::Result<String> {
        let slot = parse_slot(date, lecture)?;
        let cohort = parse_cohort(branch, year)?;
        let image = tokio::fs::read(path)
            .await
            .map_err(|err| fdo::Error::InvalidArgs(format!("cannot read {path}: {err}")))?;

        let id = self.jobs.submit();
        tracing::info!(job = %id, path, slot = %slot, cohort = %cohort, bytes = image.len(), "photo submitted");

        let service = self.clone();
        tokio::spawn(async move {
            let result = service.run_job(image, slot, cohort).await;
            match &result {
                Ok(outcome) => tracing::info!(job = %id, updated = outcome.updated_count(), "job finished"),
                Err(reason) => tracing::warn!(job = %id, %reason, "job failed"),
            }
            service.jobs.complete(id, result);
        });

        Ok(id.to_string())
    }

    /// State of a submitted job as JSON: pending, done (with the report) or failed.
    async fn job_status(&self, id: &str) -> fdo::Result<String> {
        let id: Uuid = id
            .parse()
            .map_err(|_| fdo::Error::InvalidArgs(format!("malformed job id: {id}")))?;
        let state = self
            .jobs
            .get(&id)
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("unknown job: {id}")))?;
        to_json(&state)
    }

    async fn mark_present(&self, roll_number: &str, date: &str, lecture: &str) -> fdo::Result<String> {
        self.mark(roll_number, date, lecture, AttendanceStatus::Present).await
    }

    async fn mark_absent(&self, roll_number: &str, date: &str, lecture: &str) -> fdo::Result<String> {
        self.mark(roll_number, date, lecture, AttendanceStatus::Absent).await
    }

    async fn enroll_student(&self, roll_number: &str, name: &str, branch: &str, year: &str) -> fdo::Result<()> {
        let cohort = parse_cohort(branch, year)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(fdo::Error::InvalidArgs("student name must not be empty".into()));
        }
        let student = Student {
            roll_number: parse_roll(roll_number)?,
            name: name.to_string(),
            branch: cohort.branch,
            year: cohort.year,
        };
        tracing::info!(roll = %student.roll_number, "enroll requested");
        self.with_ledger(move |ledger| ledger.enroll_student(&student)).await?;
        Ok(())
    }

    /// Embed the face in a reference photo and add it to the student's gallery.
    async fn add_reference(&self, roll_number: &str, path: &str) -> fdo::Result<()> {
        let roll = parse_roll(roll_number)?;
        let image_ref = PathBuf::from(path);
        let image = tokio::fs::read(&image_ref)
            .await
            .map_err(|err| fdo::Error::InvalidArgs(format!("cannot read {path}: {err}")))?;

        let embedding = self.engine.embed(image).await.map_err(engine_error)?;
        let entry = GalleryEntry {
            roll_number: roll,
            image_ref,
            embedding,
        };
        self.with_ledger(move |ledger| ledger.add_gallery_entry(&entry)).await?;
        Ok(())
    }

    /// Enroll every reference image under a legacy partition directory whose
    /// roll number belongs to an enrolled student.
    async fn import_gallery(&self, directory: &str) -> fdo::Result<String> {
        let root = PathBuf::from(directory);
        if !root.is_dir() {
            return Err(fdo::Error::InvalidArgs(format!("not a directory: {directory}")));
        }
        let found = tokio::task::spawn_blocking(move || scan_partition(&root))
            .await
            .map_err(|err| fdo::Error::Failed(format!("gallery scan panicked: {err}")))?;
        tracing::info!(directory, images = found.len(), "gallery import started");

        let mut imported = 0usize;
        let mut unknown = Vec::new();
        let mut failed = Vec::new();

        for (roll, path) in found {
            let lookup_roll = roll.clone();
            if self
                .with_ledger(move |ledger| ledger.lookup_student(&lookup_roll))
                .await?
                .is_none()
            {
                unknown.push(path.display().to_string());
                continue;
            }

            let embedding = match tokio::fs::read(&path).await {
                Ok(image) => self.engine.embed(image).await,
                Err(err) => Err(EngineError::Io(err)),
            };
            let embedding = match embedding {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "reference image skipped");
                    failed.push(path.display().to_string());
                    continue;
                }
            };

            let display_path = path.display().to_string();
            let entry = GalleryEntry {
                roll_number: roll,
                image_ref: path,
                embedding,
            };
            match self.with_ledger(move |ledger| ledger.add_gallery_entry(&entry)).await {
                Ok(()) => imported += 1,
                Err(LedgerCallError::Ledger(err @ LedgerError::EmbeddingDimensions { .. })) => {
                    tracing::warn!(path = %display_path, error = %err, "reference image rejected");
                    failed.push(display_path);
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::info!(imported, unknown = unknown.len(), failed = failed.len(), "gallery import finished");
        Ok(serde_json::json!({
            "imported": imported,
            "unknown_students": unknown,
            "failed": failed,
        })
        .to_string())
    }

    async fn summary(&self, roll_number: &str) -> fdo::Result<String> {
        let roll = parse_roll(roll_number)?;
        let summary = self.with_ledger(move |ledger| ledger.student_summary(&roll)).await?;
        to_json(&summary)
    }

    async fn cohort_summary(&self, branch: &str, year: &str) -> fdo::Result<String> {
        let cohort = parse_cohort(branch, year)?;
        let summaries = self.with_ledger(move |ledger| ledger.cohort_summary(&cohort)).await?;
        to_json(&summaries)
    }

    /// Enrolled students as JSON. Empty branch and year list everyone.
    async fn students(&self, branch: &str, year: &str) -> fdo::Result<String> {
        let students = if branch.trim().is_empty() && year.trim().is_empty() {
            self.with_ledger(|ledger| ledger.list_students()).await?
        } else {
            let cohort = parse_cohort(branch, year)?;
            self.with_ledger(move |ledger| ledger.list_cohort(&cohort)).await?
        };
        to_json(&students)
    }

    /// The cohort's weekly timetable as JSON, grouped by day then start time.
    async fn timetable(&self, branch: &str, year: &str) -> fdo::Result<String> {
        let cohort = parse_cohort(branch, year)?;
        let days = self.with_ledger(move |ledger| ledger.timetable_for(&cohort)).await?;
        to_json(&days)
    }

    /// Set the subject taught to a cohort at one weekday and start time.
    async fn schedule_lecture(&self, branch: &str, year: &str, day: &str, start: &str, subject: &str) -> fdo::Result<()> {
        let cohort = parse_cohort(branch, year)?;
        let day = parse_weekday(day).map_err(|err| fdo::Error::InvalidArgs(err.to_string()))?;
        let lecture = ScheduledLecture::parse(start, subject).map_err(|err| fdo::Error::InvalidArgs(err.to_string()))?;
        self.with_ledger(move |ledger| ledger.schedule_lecture(&cohort, day, &lecture))
            .await?;
        Ok(())
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let db_path = self
            .with_ledger(|ledger| Ok(ledger.path().map(|p| p.display().to_string())))
            .await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_path,
            "pending_jobs": self.jobs.pending_count(),
            "distance_threshold": self.distance_threshold,
            "conflict_policy": self.conflict_policy,
            "recognize_timeout_secs": self.recognize_timeout.as_secs(),
        })
        .to_string())
    }
}

#[derive(Debug, thiserror::Error)]
enum LedgerCallError {
    #[error(transparent)]
    Ledger(LedgerError),
    #[error("ledger task panicked: {0}")]
    Panicked(String),
}

impl From<LedgerCallError> for fdo::Error {
    fn from(err: LedgerCallError) -> Self {
        match err {
            LedgerCallError::Ledger(
                e @ (LedgerError::StudentNotFound(_)
                | LedgerError::StudentExists(_)
                | LedgerError::DuplicateMarking { .. }
                | LedgerError::EmbeddingDimensions { .. }),
            ) => fdo::Error::InvalidArgs(e.to_string()),
            other => fdo::Error::Failed(other.to_string()),
        }
    }
}

fn engine_error(err: EngineError) -> fdo::Error {
    match err {
        EngineError::Pipeline(e) => fdo::Error::InvalidArgs(e.to_string()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn parse_roll(raw: &str) -> fdo::Result<RollNumber> {
    raw.parse().map_err(|err: rollcall_core::InvalidRollNumber| fdo::Error::InvalidArgs(err.to_string()))
}

fn parse_slot(date: &str, lecture: &str) -> fdo::Result<LectureSlot> {
    LectureSlot::parse(date, lecture).map_err(|err| fdo::Error::InvalidArgs(err.to_string()))
}

fn parse_cohort(branch: &str, year: &str) -> fdo::Result<Cohort> {
    let (branch, year) = (branch.trim(), year.trim());
    if branch.is_empty() || year.is_empty() {
        return Err(fdo::Error::InvalidArgs("branch and year are required".into()));
    }
    Ok(Cohort::new(branch, year))
}

fn toggle_json(roll: &RollNumber, slot: &LectureSlot, status: AttendanceStatus, toggle: Toggle) -> serde_json::Value {
    let previous = match toggle {
        Toggle::Inserted => None,
        Toggle::Updated { from } => Some(from),
    };
    serde_json::json!({
        "roll_number": roll,
        "date": slot.date,
        "lecture": slot.lecture,
        "status": status,
        "previous": previous,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|err| fdo::Error::Failed(err.to_string()))
}
