//! Several handles reconciling the same lecture at once, as two overlapping
//! photo submissions or two daemons on one database would.

use chrono::NaiveDate;
use rollcall_core::RollNumber;
use rollcall_ledger::{AttendanceStatus, Cohort, ConflictPolicy, LectureSlot, Ledger, Student};
use std::collections::BTreeSet;

const MEMBERS: u32 = 10;
const WRITERS: u32 = 4;

fn roll(n: u32) -> RollNumber {
    (100 + n).to_string().parse().unwrap()
}

fn cohort() -> Cohort {
    Cohort::new("ETRX", "LY")
}

fn slot() -> LectureSlot {
    LectureSlot::new(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(), "DSA")
}

#[test]
fn test_concurrent_reconciles_keep_one_record_per_member() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attendance.db");

    let mut seed = Ledger::open(&path).unwrap();
    for n in 1..=MEMBERS {
        seed.enroll_student(&Student {
            roll_number: roll(n),
            name: format!("Student {n}"),
            branch: "ETRX".into(),
            year: "LY".into(),
        })
        .unwrap();
    }

    // Writer i recognizes member i only.
    let writers: Vec<(Ledger, BTreeSet<RollNumber>)> = (1..=WRITERS)
        .map(|i| (Ledger::open(&path).unwrap(), BTreeSet::from([roll(i)])))
        .collect();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = writers
            .into_iter()
            .map(|(mut ledger, recognized)| {
                scope.spawn(move || ledger.reconcile(&slot(), &cohort(), &recognized, ConflictPolicy::Collect))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let reports: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    // Whichever writer runs first inserts every record; each later one flips
    // only its own member from the backfilled Absent.
    let updated: usize = reports.iter().map(|r| r.updated_count()).sum();
    assert_eq!(updated, (MEMBERS + WRITERS - 1) as usize);
    assert!(reports.iter().all(|r| r.conflicts.is_empty()));

    for summary in seed.cohort_summary(&cohort()).unwrap() {
        assert_eq!(summary.total_classes, 1, "{}", summary.roll_number);
    }
    for n in 1..=MEMBERS {
        let expected = if n <= WRITERS {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Absent
        };
        assert_eq!(seed.get_status(&roll(n), &slot()).unwrap(), Some(expected), "{}", roll(n));
    }
}
