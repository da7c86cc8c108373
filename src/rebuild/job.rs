//! Rebuild job records

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// What a rebuild regenerates
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "resource", rename_all = "snake_case")]
pub enum RebuildScope {
    All,
    Resource(String),
}

impl RebuildScope {
    /// Two scopes overlap when either covers everything or both name the same resource
    pub fn overlaps(&self, other: &RebuildScope) -> bool {
        match (self, other) {
            (RebuildScope::All, _) | (_, RebuildScope::All) => true,
            (RebuildScope::Resource(a), RebuildScope::Resource(b)) => a == b,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        match self {
            RebuildScope::All => None,
            RebuildScope::Resource(slug) => Some(slug),
        }
    }
}

impl fmt::Display for RebuildScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildScope::All => write!(f, "all"),
            RebuildScope::Resource(slug) => write!(f, "resource:{}", slug),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    /// Observations loaded for replay
    pub total: usize,
    pub processed: usize,
    pub candles_published: usize,
    pub late_rejected: usize,
    /// Observations the scratch aggregator refused
    pub errors: usize,
}

/// One rebuild run; timestamps are unix milliseconds
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildJob {
    pub id: Uuid,
    pub scope: RebuildScope,
    pub state: JobState,
    pub progress: JobProgress,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Completion summary or failure reason
    pub message: Option<String>,
}

impl RebuildJob {
    pub fn new(scope: RebuildScope) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            state: JobState::Pending,
            progress: JobProgress::default(),
            created_at: Utc::now().timestamp_millis(),
            started_at: None,
            finished_at: None,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now().timestamp_millis());
    }

    pub fn complete(&mut self, message: impl Into<String>) {
        self.finish(JobState::Completed, message.into());
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.finish(JobState::Failed, reason.into());
    }

    fn finish(&mut self, state: JobState, message: String) {
        self.state = state;
        self.message = Some(message);
        self.finished_at = Some(Utc::now().timestamp_millis());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Outcome of a start/cancel request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl OperationResult {
    pub fn accepted(message: impl Into<String>, job_id: Uuid) -> Self {
        Self {
            success: true,
            message: message.into(),
            job_id: Some(job_id),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            job_id: None,
        }
    }
}
