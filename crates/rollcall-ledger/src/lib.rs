//! rollcall-ledger: student directory, gallery index and attendance ledger.
//!
//! Owns the SQLite schema and every write to it. The one-record-per-lecture
//! invariant is enforced twice: by a unique constraint on
//! `(roll_number, date, lecture)` and by running each reconciliation in a
//! single immediate transaction.

pub mod attendance;
pub mod ledger;
pub mod model;
pub mod reconcile;

pub use attendance::{cohort_gallery, record_recognition, run_automatic_attendance, AttendanceError, AttendanceOutcome};
pub use ledger::{Ledger, LedgerError, Toggle};
pub use model::{
    parse_date, parse_start_time, parse_weekday, AttendanceStatus, AttendanceSummary, Cohort, LectureSlot,
    ScheduledLecture, SlotError, Student, TimetableDay,
};
pub use reconcile::{Conflict, ConflictPolicy, ReconcileReport};
