mod client;
mod poller;

pub(crate) use client::HttpBackend;
pub(crate) use poller::PollTask;

use crate::model::{AnalysisResult, InputArtifact};
use anyhow::Result;
use std::future::Future;

/// What a single status request told us about a job.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The backend's explicit "still processing" signal.
    Pending,
    Completed(AnalysisResult),
    /// Backend-reported failure, with whatever message it gave.
    Failed(String),
}

/// Wire contract of the analysis service, as seen by the job controller.
pub trait AnalysisBackend: Send + Sync + 'static {
    /// Upload the artifact and return the job id assigned by the backend.
    fn submit(&self, artifact: &InputArtifact) -> impl Future<Output = Result<String>> + Send;

    /// Issue one status request for `job_id`.
    fn poll(&self, job_id: &str) -> impl Future<Output = Result<PollOutcome>> + Send;
}
