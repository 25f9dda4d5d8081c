//! SQLite-backed student directory, gallery index and attendance ledger.

use crate::model::{
    AttendanceStatus, AttendanceSummary, Cohort, LectureSlot, ScheduledLecture, Student, TimetableDay, TIME_FORMAT,
};
use chrono::{NaiveTime, Weekday};
use crate::reconcile::{self, ConflictPolicy, ReconcileReport};
use rollcall_core::{Embedding, GalleryEntry, RollNumber};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    roll_number TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    branch      TEXT NOT NULL,
    year        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_students_cohort ON students (branch, year);

CREATE TABLE IF NOT EXISTS gallery (
    id          INTEGER PRIMARY KEY,
    roll_number TEXT NOT NULL REFERENCES students (roll_number) ON DELETE CASCADE,
    image_ref   TEXT NOT NULL,
    embedding   TEXT NOT NULL,
    UNIQUE (roll_number, image_ref)
);

CREATE TABLE IF NOT EXISTS attendance (
    roll_number TEXT NOT NULL REFERENCES students (roll_number) ON DELETE CASCADE,
    date        TEXT NOT NULL,
    lecture     TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('Present', 'Absent')),
    UNIQUE (roll_number, date, lecture)
);
CREATE INDEX IF NOT EXISTS idx_attendance_slot ON attendance (date, lecture);

CREATE TABLE IF NOT EXISTS timetable (
    branch  TEXT NOT NULL,
    year    TEXT NOT NULL,
    day     INTEGER NOT NULL CHECK (day BETWEEN 0 AND 6),
    start   TEXT NOT NULL,
    subject TEXT NOT NULL,
    UNIQUE (branch, year, day, start)
);
";

/// `timetable.day` values, Monday first.
const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("student {0} not found")]
    StudentNotFound(RollNumber),
    #[error("student {0} is already enrolled")]
    StudentExists(RollNumber),
    #[error("{roll_number} is already marked {status} for {slot}")]
    DuplicateMarking {
        roll_number: RollNumber,
        slot: LectureSlot,
        status: AttendanceStatus,
    },
    #[error("embedding encoding: {0}")]
    Embedding(#[from] serde_json::Error),
    #[error("embedding has {found} dimensions but the gallery holds {expected}-dimensional embeddings")]
    EmbeddingDimensions { expected: usize, found: usize },
}

/// Result of a manual toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Inserted,
    Updated { from: AttendanceStatus },
}

impl ToSql for AttendanceStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AttendanceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

fn roll_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<RollNumber> {
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        roll_number: roll_column(row, 0)?,
        name: row.get(1)?,
        branch: row.get(2)?,
        year: row.get(3)?,
    })
}

pub(crate) fn status_in(conn: &Connection, roll: &RollNumber, slot: &LectureSlot) -> rusqlite::Result<Option<AttendanceStatus>> {
    conn.query_row(
        "SELECT status FROM attendance WHERE roll_number = ?1 AND date = ?2 AND lecture = ?3",
        params![roll.as_str(), slot.date_key(), slot.lecture],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn insert_status(
    conn: &Connection,
    roll: &RollNumber,
    slot: &LectureSlot,
    status: AttendanceStatus,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO attendance (roll_number, date, lecture, status) VALUES (?1, ?2, ?3, ?4)",
        params![roll.as_str(), slot.date_key(), slot.lecture, status],
    )?;
    Ok(())
}

pub(crate) fn update_status(
    conn: &Connection,
    roll: &RollNumber,
    slot: &LectureSlot,
    status: AttendanceStatus,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE attendance SET status = ?4 WHERE roll_number = ?1 AND date = ?2 AND lecture = ?3",
        params![roll.as_str(), slot.date_key(), slot.lecture, status],
    )?;
    Ok(())
}

pub(crate) fn cohort_members(conn: &Connection, cohort: &Cohort) -> rusqlite::Result<Vec<Student>> {
    let mut stmt = conn.prepare(
        "SELECT roll_number, name, branch, year FROM students
         WHERE branch = ?1 AND year = ?2 ORDER BY roll_number",
    )?;
    let rows = stmt.query_map(params![cohort.branch, cohort.year], student_from_row)?;
    rows.collect()
}

fn student_exists(conn: &Connection, roll: &RollNumber) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM students WHERE roll_number = ?1)",
        params![roll.as_str()],
        |row| row.get(0),
    )
}

/// Handle to the attendance database.
///
/// Every mutation runs in its own `BEGIN IMMEDIATE` transaction, so concurrent
/// writers (other handles or processes) are serialized by SQLite.
pub struct Ledger {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Ledger {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let ledger = Self::init(conn, Some(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "ledger opened");
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // --- Student directory ---

    pub fn enroll_student(&mut self, student: &Student) -> Result<(), LedgerError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if student_exists(&tx, &student.roll_number)? {
            return Err(LedgerError::StudentExists(student.roll_number.clone()));
        }
        tx.execute(
            "INSERT INTO students (roll_number, name, branch, year) VALUES (?1, ?2, ?3, ?4)",
            params![student.roll_number.as_str(), student.name, student.branch, student.year],
        )?;
        tx.commit()?;

        tracing::info!(roll = %student.roll_number, branch = %student.branch, year = %student.year, "student enrolled");
        Ok(())
    }

    pub fn lookup_student(&self, roll: &RollNumber) -> Result<Option<Student>, LedgerError> {
        Ok(self
            .conn
            .query_row(
                "SELECT roll_number, name, branch, year FROM students WHERE roll_number = ?1",
                params![roll.as_str()],
                student_from_row,
            )
            .optional()?)
    }

    pub fn list_cohort(&self, cohort: &Cohort) -> Result<Vec<Student>, LedgerError> {
        Ok(cohort_members(&self.conn, cohort)?)
    }

    pub fn list_students(&self) -> Result<Vec<Student>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT roll_number, name, branch, year FROM students ORDER BY roll_number")?;
        let rows = stmt.query_map([], student_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // --- Gallery index ---

    /// Add (or replace) a reference face for an enrolled student.
    ///
    /// Every stored embedding must have the same dimension; an entry from a
    /// different model is rejected instead of being matched on a prefix.
    pub fn add_gallery_entry(&mut self, entry: &GalleryEntry) -> Result<(), LedgerError> {
        let found = entry.embedding.values.len();
        let embedding = serde_json::to_string(&entry.embedding)?;
        let image_ref = entry.image_ref.to_string_lossy().into_owned();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !student_exists(&tx, &entry.roll_number)? {
            return Err(LedgerError::StudentNotFound(entry.roll_number.clone()));
        }

        let expected: Option<i64> = tx
            .query_row(
                "SELECT json_array_length(embedding, '$.values') FROM gallery
                 WHERE NOT (roll_number = ?1 AND image_ref = ?2) LIMIT 1",
                params![entry.roll_number.as_str(), image_ref],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        let expected = expected.map_or(found, |n| n as usize);
        if found == 0 || found != expected {
            return Err(LedgerError::EmbeddingDimensions { expected, found });
        }

        tx.execute(
            "INSERT INTO gallery (roll_number, image_ref, embedding) VALUES (?1, ?2, ?3)
             ON CONFLICT (roll_number, image_ref) DO UPDATE SET embedding = excluded.embedding",
            params![entry.roll_number.as_str(), image_ref, embedding],
        )?;
        tx.commit()?;

        tracing::info!(roll = %entry.roll_number, image = %entry.image_ref.display(), "gallery entry stored");
        Ok(())
    }

    /// Reference faces for every member of the cohort: the gallery partition
    /// matching runs against.
    pub fn gallery_for(&self, cohort: &Cohort) -> Result<Vec<GalleryEntry>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT g.roll_number, g.image_ref, g.embedding FROM gallery g
             JOIN students s ON s.roll_number = g.roll_number
             WHERE s.branch = ?1 AND s.year = ?2
             ORDER BY g.roll_number, g.id",
        )?;
        let rows = stmt.query_map(params![cohort.branch, cohort.year], |row| {
            let embedding: String = row.get(2)?;
            let embedding: Embedding = serde_json::from_str(&embedding)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
            Ok(GalleryEntry {
                roll_number: roll_column(row, 0)?,
                image_ref: PathBuf::from(row.get::<_, String>(1)?),
                embedding,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // --- Attendance ledger ---

    pub fn get_status(&self, roll: &RollNumber, slot: &LectureSlot) -> Result<Option<AttendanceStatus>, LedgerError> {
        Ok(status_in(&self.conn, roll, slot)?)
    }

    /// Set a status unconditionally, inserting or overwriting the record.
    pub fn upsert_status(&mut self, roll: &RollNumber, slot: &LectureSlot, status: AttendanceStatus) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT INTO attendance (roll_number, date, lecture, status) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (roll_number, date, lecture) DO UPDATE SET status = excluded.status",
            params![roll.as_str(), slot.date_key(), slot.lecture, status],
        )?;
        Ok(())
    }

    pub fn mark_present(&mut self, roll: &RollNumber, slot: &LectureSlot) -> Result<Toggle, LedgerError> {
        self.toggle(roll, slot, AttendanceStatus::Present)
    }

    pub fn mark_absent(&mut self, roll: &RollNumber, slot: &LectureSlot) -> Result<Toggle, LedgerError> {
        self.toggle(roll, slot, AttendanceStatus::Absent)
    }

    /// Move one record to `target`. Re-asserting the current status is rejected.
    fn toggle(&mut self, roll: &RollNumber, slot: &LectureSlot, target: AttendanceStatus) -> Result<Toggle, LedgerError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !student_exists(&tx, roll)? {
            return Err(LedgerError::StudentNotFound(roll.clone()));
        }

        let outcome = match status_in(&tx, roll, slot)? {
            None => {
                insert_status(&tx, roll, slot, target)?;
                Toggle::Inserted
            }
            Some(current) if current == target => {
                return Err(LedgerError::DuplicateMarking {
                    roll_number: roll.clone(),
                    slot: slot.clone(),
                    status: target,
                });
            }
            Some(current) => {
                update_status(&tx, roll, slot, target)?;
                Toggle::Updated { from: current }
            }
        };
        tx.commit()?;

        tracing::info!(roll = %roll, slot = %slot, status = %target, ?outcome, "attendance marked");
        Ok(outcome)
    }

    /// Reconcile a photo's recognized roll numbers into the cohort's records
    /// for one lecture, atomically. See [`reconcile`](crate::reconcile).
    pub fn reconcile(
        &mut self,
        slot: &LectureSlot,
        cohort: &Cohort,
        recognized: &BTreeSet<RollNumber>,
        policy: ConflictPolicy,
    ) -> Result<ReconcileReport, LedgerError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Dropping `tx` on any error path rolls back both phases.
        let report = reconcile::apply(&tx, slot, cohort, recognized, policy)?;
        tx.commit()?;

        tracing::info!(
            slot = %slot,
            cohort = %cohort,
            present = report.marked_present.len(),
            flipped = report.flipped_to_present.len(),
            absent = report.marked_absent.len(),
            conflicts = report.conflicts.len(),
            ignored = report.ignored.len(),
            "attendance reconciled"
        );
        Ok(report)
    }

    // --- Timetable ---

    /// Put `lecture` in the cohort's weekly timetable, replacing whatever
    /// subject held that day and start time.
    pub fn schedule_lecture(&mut self, cohort: &Cohort, day: Weekday, lecture: &ScheduledLecture) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT INTO timetable (branch, year, day, start, subject) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (branch, year, day, start) DO UPDATE SET subject = excluded.subject",
            params![
                cohort.branch,
                cohort.year,
                day.num_days_from_monday(),
                lecture.start.format(TIME_FORMAT).to_string(),
                lecture.subject
            ],
        )?;
        tracing::info!(cohort = %cohort, %day, start = %lecture.start, subject = %lecture.subject, "lecture scheduled");
        Ok(())
    }

    /// The cohort's weekly timetable grouped by day (Monday first), each day's
    /// lectures in start order. Days without lectures are omitted.
    pub fn timetable_for(&self, cohort: &Cohort) -> Result<Vec<TimetableDay>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT day, start, subject FROM timetable
             WHERE branch = ?1 AND year = ?2 ORDER BY day, start",
        )?;
        let rows = stmt.query_map(params![cohort.branch, cohort.year], |row| {
            let day: usize = row.get(0)?;
            let day = WEEK.get(day).copied().ok_or(rusqlite::Error::IntegralValueOutOfRange(0, day as i64))?;
            let start: String = row.get(1)?;
            let start = NaiveTime::parse_from_str(&start, TIME_FORMAT)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
            Ok((day, ScheduledLecture { start, subject: row.get(2)? }))
        })?;

        let mut days: Vec<TimetableDay> = Vec::new();
        for row in rows {
            let (day, lecture) = row?;
            match days.last_mut() {
                Some(current) if current.day == day => current.lectures.push(lecture),
                _ => days.push(TimetableDay {
                    day,
                    lectures: vec![lecture],
                }),
            }
        }
        Ok(days)
    }

    // --- Summaries ---

    pub fn student_summary(&self, roll: &RollNumber) -> Result<AttendanceSummary, LedgerError> {
        if !student_exists(&self.conn, roll)? {
            return Err(LedgerError::StudentNotFound(roll.clone()));
        }
        let (total, present): (u32, u32) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'Present'), 0) FROM attendance WHERE roll_number = ?1",
            params![roll.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(AttendanceSummary::new(roll.clone(), total, present))
    }

    /// Summaries for every cohort member, ordered by roll number.
    pub fn cohort_summary(&self, cohort: &Cohort) -> Result<Vec<AttendanceSummary>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.roll_number, COUNT(a.status), COALESCE(SUM(a.status = 'Present'), 0)
             FROM students s LEFT JOIN attendance a ON a.roll_number = s.roll_number
             WHERE s.branch = ?1 AND s.year = ?2
             GROUP BY s.roll_number ORDER BY s.roll_number",
        )?;
        let rows = stmt.query_map(params![cohort.branch, cohort.year], |row| {
            Ok(AttendanceSummary::new(roll_column(row, 0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}
