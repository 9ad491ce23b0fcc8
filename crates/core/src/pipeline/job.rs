use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::compliance::domain::records::LedgerSnapshot;
use crate::video::domain::frame_source::FrameSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Everything needed to process one uploaded video.
pub struct JobDescriptor {
    pub file_name: String,
    /// Key under which results are persisted.
    pub video_id: String,
    /// Wall-clock time of the first frame; count dates derive from it.
    pub recorded_at: DateTime<Utc>,
    pub source: Box<dyn FrameSource>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

impl Progress {
    /// Completion in `[0, 1]`, or 0 when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.processed as f64 / self.total as f64).min(1.0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What callers see when they ask about a job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    /// `position` is 0 for the next job to run.
    Queued { position: usize },
    Processing { progress: Progress },
    Completed { result: LedgerSnapshot },
    Failed { error: String },
    Cancelled,
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self {
            JobStatus::Queued { .. } => JobState::Queued,
            JobStatus::Processing { .. } => JobState::Processing,
            JobStatus::Completed { .. } => JobState::Completed,
            JobStatus::Failed { .. } => JobState::Failed,
            JobStatus::Cancelled => JobState::Cancelled,
        }
    }
}

/// Lifecycle notifications broadcast to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Started { job_id: JobId },
    Progress { job_id: JobId, progress: Progress },
    Finished { job_id: JobId, state: JobState },
}

/// Summary row for listings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub file_name: String,
    pub video_id: String,
    pub state: JobState,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Job table entry, mutated only under the orchestrator's job lock.
pub(crate) struct JobRecord {
    pub(crate) info: JobInfo,
    pub(crate) snapshot: LedgerSnapshot,
    pub(crate) cancel: Arc<AtomicBool>,
}

impl JobRecord {
    pub(crate) fn new(job_id: JobId, descriptor: &JobDescriptor) -> Self {
        Self {
            info: JobInfo {
                job_id,
                file_name: descriptor.file_name.clone(),
                video_id: descriptor.video_id.clone(),
                state: JobState::Queued,
                progress: Progress::default(),
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                error: None,
            },
            snapshot: LedgerSnapshot::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn finish(&mut self, state: JobState, error: Option<String>) {
        self.info.state = state;
        self.info.error = error;
        self.info.finished_at = Some(Utc::now());
    }
}
