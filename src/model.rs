use crate::error::ErrorKind;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub api_base: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default, with = "humantime_serde")]
    pub poll_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl JobConfig {
    pub fn upload_url(&self) -> String {
        format!("{}/upload", self.api_base.trim_end_matches('/'))
    }

    pub fn results_url(&self, job_id: &str) -> String {
        format!("{}/results/{}", self.api_base.trim_end_matches('/'), job_id)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.api_base.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Submitting,
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states never transition again for the same job.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Snapshot of one submitted analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub result: Option<AnalysisResult>,
    pub error_message: Option<String>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            job_id: None,
            status: JobStatus::Idle,
            result: None,
            error_message: None,
        }
    }
}

/// Candidate ids come back as numbers from some backends and as strings from others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CandidateId {
    Number(i64),
    Text(String),
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateId::Number(n) => write!(f, "{n}"),
            CandidateId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub region: String,
    /// Confidence in `[0, 1]`.
    pub score: f64,
    pub rationale: String,
}

impl Candidate {
    pub fn score_percent(&self) -> String {
        format!("{:.1}%", self.score * 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub job_id: Option<String>,
    // Backend order is preserved as-is.
    pub candidates: Vec<Candidate>,
    pub model_version: String,
    // Stamped locally when the result arrives.
    #[serde(default)]
    pub received_at: Option<String>,
}

/// File handed to the backend untouched.
#[derive(Debug, Clone)]
pub struct InputArtifact {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl InputArtifact {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Tiny FASTA sequence used by `--demo`.
    pub fn demo() -> Self {
        Self::new("demo.fa", "text/plain", ">demo\nATGCATGCATGCATGCATGC\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    StatusChanged {
        job_id: Option<String>,
        status: JobStatus,
    },
    PollPending {
        job_id: String,
        attempt: u64,
    },
    Info(InfoEvent),
    JobCompleted {
        // Boxed so the common small events stay small.
        result: Box<AnalysisResult>,
    },
    JobFailed {
        message: String,
    },
    /// Submission refused locally; no request was made and the job stays idle.
    SubmitRejected {
        message: String,
    },
}

impl JobEvent {
    /// Events after which nothing more happens for the current submission.
    pub fn ends_submission(&self) -> bool {
        matches!(
            self,
            JobEvent::JobCompleted { .. } | JobEvent::JobFailed { .. } | JobEvent::SubmitRejected { .. }
        )
    }
}

/// Structured info events emitted by the controller and consumed by the CLI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    Submitting { filename: String },
    Queued { job_id: String },
    PollRetry {
        attempt: u64,
        kind: ErrorKind,
        error: String,
    },
    Cancelled { job_id: String },
}

impl InfoEvent {
    /// Render a human-readable message for the CLI layer.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Submitting { filename } => format!("Uploading {filename}…"),
            InfoEvent::Queued { job_id } => format!("Job queued: {job_id}"),
            InfoEvent::PollRetry { attempt, error, .. } => {
                format!("Status check {attempt} failed, retrying: {error}")
            }
            InfoEvent::Cancelled { job_id } => format!("Stopped following job {job_id}"),
        }
    }
}
