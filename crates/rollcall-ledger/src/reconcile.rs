//! Two-phase reconciliation of recognized roll numbers into a cohort's
//! attendance for one lecture slot.
//!
//! Phase A marks recognized cohort members Present: a missing record is
//! inserted, an Absent record is flipped, and an existing Present record is a
//! duplicate conflict handled per [`ConflictPolicy`]. Phase B backfills Absent
//! for every member who still has no record. Both phases run inside the
//! caller's transaction, so a failure anywhere leaves the ledger untouched.

use crate::ledger::{cohort_members, insert_status, status_in, update_status, LedgerError};
use crate::model::{AttendanceStatus, Cohort, LectureSlot};
use rollcall_core::RollNumber;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// What to do when a recognized student is already marked Present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Record the conflict in the report and keep reconciling the cohort.
    #[default]
    Collect,
    /// Fail the whole run; nothing from this run is written.
    Abort,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collect" => Ok(Self::Collect),
            "abort" => Ok(Self::Abort),
            other => Err(format!("unknown conflict policy {other:?} (expected collect or abort)")),
        }
    }
}

/// A recognized student whose record already had the asserted status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub roll_number: RollNumber,
    pub status: AttendanceStatus,
}

/// Every mutation and non-mutation one reconciliation made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Recognized, no prior record: inserted Present.
    pub marked_present: Vec<RollNumber>,
    /// Recognized, previously Absent: updated to Present.
    pub flipped_to_present: Vec<RollNumber>,
    /// Not recognized and no prior record: inserted Absent.
    pub marked_absent: Vec<RollNumber>,
    /// Recognized but already Present.
    pub conflicts: Vec<Conflict>,
    /// Recognized roll numbers that are not members of the cohort.
    pub ignored: Vec<RollNumber>,
}

impl ReconcileReport {
    /// Number of records inserted or updated.
    pub fn updated_count(&self) -> usize {
        self.marked_present.len() + self.flipped_to_present.len() + self.marked_absent.len()
    }
}

pub(crate) fn apply(
    conn: &Connection,
    slot: &LectureSlot,
    cohort: &Cohort,
    recognized: &BTreeSet<RollNumber>,
    policy: ConflictPolicy,
) -> Result<ReconcileReport, LedgerError> {
    let members: Vec<RollNumber> = cohort_members(conn, cohort)?
        .into_iter()
        .map(|s| s.roll_number)
        .collect();
    let member_set: BTreeSet<&RollNumber> = members.iter().collect();

    let mut report = ReconcileReport::default();

    // Phase A: recognized members become Present.
    for roll in recognized {
        if !member_set.contains(roll) {
            tracing::debug!(roll = %roll, cohort = %cohort, "recognized roll number outside cohort; ignoring");
            report.ignored.push(roll.clone());
            continue;
        }

        match status_in(conn, roll, slot)? {
            None => {
                insert_status(conn, roll, slot, AttendanceStatus::Present)?;
                report.marked_present.push(roll.clone());
            }
            Some(AttendanceStatus::Absent) => {
                update_status(conn, roll, slot, AttendanceStatus::Present)?;
                report.flipped_to_present.push(roll.clone());
            }
            Some(AttendanceStatus::Present) => match policy {
                ConflictPolicy::Collect => {
                    tracing::debug!(roll = %roll, slot = %slot, "already marked present");
                    report.conflicts.push(Conflict {
                        roll_number: roll.clone(),
                        status: AttendanceStatus::Present,
                    });
                }
                ConflictPolicy::Abort => {
                    tracing::warn!(roll = %roll, slot = %slot, "already marked present; aborting reconciliation");
                    return Err(LedgerError::DuplicateMarking {
                        roll_number: roll.clone(),
                        slot: slot.clone(),
                        status: AttendanceStatus::Present,
                    });
                }
            },
        }
    }

    // Phase B: members with no record at all are backfilled Absent. Existing
    // records of either status are left alone.
    for roll in &members {
        if status_in(conn, roll, slot)?.is_none() {
            insert_status(conn, roll, slot, AttendanceStatus::Absent)?;
            report.marked_absent.push(roll.clone());
        }
    }

    Ok(report)
}
