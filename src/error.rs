//! Error kinds for the job lifecycle and the viewport.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MissingInput,
    SubmissionFailed,
    JobFailed,
    TransientPollError,
    Timeout,
}

impl ErrorKind {
    /// Whether errors of this kind reach the user. Transient poll failures are
    /// retried on the next tick and only logged.
    pub fn is_user_visible(self) -> bool {
        !matches!(self, ErrorKind::TransientPollError)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Choose a FASTA/CSV file.")]
    MissingInput,

    #[error("Upload failed. Check backend. ({0})")]
    SubmissionFailed(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Status check failed: {0}")]
    TransientPollError(String),

    #[error("No result after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::MissingInput => ErrorKind::MissingInput,
            JobError::SubmissionFailed(_) => ErrorKind::SubmissionFailed,
            JobError::JobFailed(_) => ErrorKind::JobFailed,
            JobError::TransientPollError(_) => ErrorKind::TransientPollError,
            JobError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn is_user_visible(&self) -> bool {
        self.kind().is_user_visible()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewportError {
    #[error("Mount point '{0}' has no laid-out surface")]
    MountUnavailable(String),

    #[error("Viewport already bound to mount point '{0}'")]
    AlreadyBound(String),

    #[error("Viewport torn down before the engine became ready")]
    TornDown,

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}
