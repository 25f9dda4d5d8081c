//! Pending automatic-attendance jobs, polled by clients via `JobStatus`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rollcall_ledger::AttendanceOutcome;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Finished jobs older than this are dropped on the next submission.
const RETENTION_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    Pending {
        submitted_at: DateTime<Utc>,
    },
    Done {
        finished_at: DateTime<Utc>,
        updated_count: usize,
        outcome: AttendanceOutcome,
    },
    Failed {
        finished_at: DateTime<Utc>,
        reason: String,
    },
}

impl JobState {
    fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending { .. } => None,
            Self::Done { finished_at, .. } | Self::Failed { finished_at, .. } => Some(*finished_at),
        }
    }
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

impl JobRegistry {
    /// Register a new pending job and return its id.
    pub fn submit(&self) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut jobs = self.lock();
        jobs.retain(|_, state| {
            state
                .finished_at()
                .map_or(true, |at| now - at < ChronoDuration::minutes(RETENTION_MINUTES))
        });
        jobs.insert(id, JobState::Pending { submitted_at: now });
        id
    }

    pub fn complete(&self, id: Uuid, result: Result<AttendanceOutcome, String>) {
        let finished_at = Utc::now();
        let state = match result {
            Ok(outcome) => JobState::Done {
                finished_at,
                updated_count: outcome.updated_count(),
                outcome,
            },
            Err(reason) => JobState::Failed { finished_at, reason },
        };
        self.lock().insert(id, state);
    }

    pub fn get(&self, id: &Uuid) -> Option<JobState> {
        self.lock().get(id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| matches!(s, JobState::Pending { .. }))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobState>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
