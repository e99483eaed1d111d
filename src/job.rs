use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::Image;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid job transition {from:?} -> {to:?}")]
    Invalid { from: JobStatus, to: JobStatus },
    #[error("job is archived with no recorded prior status")]
    MissingPriorStatus,
}

/// One timestamped line in a job's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// A forensic-analysis job. Owned by the registry and mutated only through
/// the transition table and the whitelisted update set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub case_id: String,
    pub images: Vec<Image>,
    #[serde(default)]
    pub options: JobOptions,
    pub status: JobStatus,
    /// Job-level completion, 0-100. Non-decreasing for the job's lifetime.
    pub progress: u8,
    pub log: Vec<LogEntry>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Status the job held before it was archived, so unarchive can restore
    /// it.
    pub archived_from: Option<JobStatus>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, case_id: String, images: Vec<Image>, options: JobOptions) -> Self {
        Self {
            id,
            case_id,
            images,
            options,
            status: JobStatus::Queued,
            progress: 0,
            log: Vec::new(),
            result: None,
            error: None,
            archived_from: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply one transition from the lifecycle table. Anything outside the
    /// table leaves the job unchanged and fails.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        let from = self.status;
        let allowed = matches!(
            (from, to),
            (JobStatus::Queued | JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running | JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Failed | JobStatus::Cancelled, JobStatus::Pending)
                | (JobStatus::Completed | JobStatus::Failed, JobStatus::Archived)
                | (JobStatus::Running, JobStatus::Completed | JobStatus::Failed)
        );
        if !allowed {
            return Err(TransitionError::Invalid { from, to });
        }

        match to {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            JobStatus::Archived => self.archived_from = Some(from),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Restore an archived job to the terminal status it held before
    /// archiving.
    pub fn unarchive(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Archived {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: self.status,
            });
        }
        let prior = self
            .archived_from
            .take()
            .ok_or(TransitionError::MissingPriorStatus)?;
        self.status = prior;
        Ok(())
    }

    pub fn append_log(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry::new(message));
    }

    /// Raise the job-level progress. Values below the current progress are
    /// dropped, keeping the emitted sequence non-decreasing.
    pub fn raise_progress(&mut self, value: u8) {
        let value = value.min(100);
        if value > self.progress {
            self.progress = value;
        }
    }
}

/// Per-job orchestration options, fixed at creation and reused on restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Run the DeferredMemory phase even when no memory profiles are
    /// parked.
    pub full_memory_analysis: bool,
}

/// Whitelisted partial-update set accepted by the registry. Fields outside
/// this set can never be overwritten by callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub log_append: Vec<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Generate a job id from the current UTC time plus a nanosecond suffix.
pub fn generate_job_id() -> String {
    let now = Utc::now();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("job_{}_{:08x}", now.format("%Y%m%dT%H%M%SZ"), nanos)
}
