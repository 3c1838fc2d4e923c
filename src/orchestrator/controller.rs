//! Job lifecycle controller.
//!
//! Owns submission, polling and teardown for one analysis job at a time and emits
//! events for presentation layers. States: idle -> submitting -> pending ->
//! completed | failed. A new submission supersedes the current job.

use crate::engine::{AnalysisBackend, PollOutcome, PollTask};
use crate::error::{ErrorKind, JobError};
use crate::model::{InfoEvent, InputArtifact, Job, JobConfig, JobEvent, JobStatus};
use anyhow::Result;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

/// Commands emitted by the CLI layer.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Submit(Option<InputArtifact>),
    Quit,
}

/// Job state plus a generation counter. Every submission and teardown bumps the
/// generation; a poll response is applied only if its generation is still current.
struct ActiveJob {
    generation: u64,
    job: Job,
}

fn lock(shared: &Mutex<ActiveJob>) -> MutexGuard<'_, ActiveJob> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply a terminal transition if `generation` still owns a job that has not settled.
fn settle(shared: &Mutex<ActiveJob>, generation: u64, apply: impl FnOnce(&mut Job)) -> bool {
    let mut active = lock(shared);
    if active.generation != generation || active.job.status.is_terminal() {
        return false;
    }
    apply(&mut active.job);
    true
}

fn fail_job(job: &mut Job, err: &JobError) {
    job.status = JobStatus::Failed;
    job.result = None;
    job.error_message = Some(err.to_string());
}

pub(crate) struct JobController<B: AnalysisBackend> {
    backend: Arc<B>,
    cfg: JobConfig,
    shared: Arc<Mutex<ActiveJob>>,
    event_tx: UnboundedSender<JobEvent>,
    poll: Option<PollTask>,
}

impl<B: AnalysisBackend> JobController<B> {
    pub(crate) fn new(backend: Arc<B>, cfg: JobConfig, event_tx: UnboundedSender<JobEvent>) -> Self {
        Self {
            backend,
            cfg,
            shared: Arc::new(Mutex::new(ActiveJob {
                generation: 0,
                job: Job::default(),
            })),
            event_tx,
            poll: None,
        }
    }

    /// Snapshot of the current job.
    pub(crate) fn job(&self) -> Job {
        lock(&self.shared).job.clone()
    }

    /// Submit `artifact` and start polling for its result.
    ///
    /// Returns once the backend has assigned a job id (state `pending`) or the
    /// upload failed (state `failed`). Without an artifact nothing is sent.
    pub(crate) async fn submit(&mut self, artifact: Option<InputArtifact>) -> Result<Job, JobError> {
        let Some(artifact) = artifact else {
            tracing::debug!("submit without an input artifact");
            return Err(JobError::MissingInput);
        };

        self.stop_polling();
        let generation = {
            let mut active = lock(&self.shared);
            if active.job.status == JobStatus::Pending {
                if let Some(previous) = active.job.job_id.as_deref() {
                    let _ = self.event_tx.send(JobEvent::Info(InfoEvent::Message(format!(
                        "Replacing job {previous}"
                    ))));
                }
            }
            active.generation += 1;
            active.job = Job {
                status: JobStatus::Submitting,
                ..Job::default()
            };
            active.generation
        };
        self.emit_status(None, JobStatus::Submitting);
        let _ = self.event_tx.send(JobEvent::Info(InfoEvent::Submitting {
            filename: artifact.filename.clone(),
        }));

        let job_id = match self.backend.submit(&artifact).await {
            Ok(id) => id,
            Err(e) => {
                let err = JobError::SubmissionFailed(format!("{e:#}"));
                tracing::warn!(error = %e, filename = %artifact.filename, "upload failed");
                fail_job(&mut lock(&self.shared).job, &err);
                self.emit_status(None, JobStatus::Failed);
                let _ = self.event_tx.send(JobEvent::JobFailed {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        tracing::info!(job_id = %job_id, "job queued");
        let job = {
            let mut active = lock(&self.shared);
            active.job.job_id = Some(job_id.clone());
            active.job.status = JobStatus::Pending;
            active.job.clone()
        };
        let _ = self.event_tx.send(JobEvent::Info(InfoEvent::Queued {
            job_id: job_id.clone(),
        }));
        self.emit_status(Some(job_id.clone()), JobStatus::Pending);
        self.start_polling(generation, job_id);
        Ok(job)
    }

    /// Stop following the current job. Any response still in flight is discarded.
    pub(crate) fn teardown(&mut self) {
        self.stop_polling();
        let mut active = lock(&self.shared);
        active.generation += 1;
        if active.job.status == JobStatus::Pending {
            if let Some(job_id) = active.job.job_id.clone() {
                tracing::debug!(job_id = %job_id, "polling cancelled on teardown");
                let _ = self
                    .event_tx
                    .send(JobEvent::Info(InfoEvent::Cancelled { job_id }));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_polling(&self) -> bool {
        self.poll.as_ref().is_some_and(PollTask::is_running)
    }

    fn stop_polling(&mut self) {
        if let Some(mut task) = self.poll.take() {
            if task.is_running() {
                tracing::debug!("cancelling status polling");
            }
            task.cancel();
        }
    }

    fn emit_status(&self, job_id: Option<String>, status: JobStatus) {
        let _ = self
            .event_tx
            .send(JobEvent::StatusChanged { job_id, status });
    }

    fn start_polling(&mut self, generation: u64, job_id: String) {
        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        let deadline = self
            .cfg
            .poll_timeout
            .map(|limit| (Instant::now() + limit, limit));

        let task = PollTask::start(self.cfg.poll_interval, move |attempt| {
            let tick = PollTick {
                backend: Arc::clone(&backend),
                shared: Arc::clone(&shared),
                event_tx: event_tx.clone(),
                generation,
                job_id: job_id.clone(),
                deadline,
            };
            run_poll_tick(tick, attempt)
        });
        self.poll = Some(task);
    }
}

impl<B: AnalysisBackend> Drop for JobController<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Everything one status check needs.
struct PollTick<B> {
    backend: Arc<B>,
    shared: Arc<Mutex<ActiveJob>>,
    event_tx: UnboundedSender<JobEvent>,
    generation: u64,
    job_id: String,
    deadline: Option<(Instant, Duration)>,
}

impl<B> PollTick<B> {
    fn finish_failed(&self, err: JobError) -> ControlFlow<()> {
        if settle(&self.shared, self.generation, |job| fail_job(job, &err)) {
            tracing::warn!(job_id = %self.job_id, error = %err, "job failed");
            let _ = self.event_tx.send(JobEvent::StatusChanged {
                job_id: Some(self.job_id.clone()),
                status: JobStatus::Failed,
            });
            let _ = self.event_tx.send(JobEvent::JobFailed {
                message: err.to_string(),
            });
        }
        ControlFlow::Break(())
    }
}

async fn run_poll_tick<B: AnalysisBackend>(tick: PollTick<B>, attempt: u64) -> ControlFlow<()> {
    if let Some((deadline, limit)) = tick.deadline {
        if Instant::now() >= deadline {
            return tick.finish_failed(JobError::Timeout(limit));
        }
    }

    match tick.backend.poll(&tick.job_id).await {
        Ok(PollOutcome::Pending) => {
            let _ = tick.event_tx.send(JobEvent::PollPending {
                job_id: tick.job_id.clone(),
                attempt,
            });
            ControlFlow::Continue(())
        }
        Ok(PollOutcome::Completed(mut result)) => {
            result.received_at = Some(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_else(|_| "now".into()),
            );
            let completed = settle(&tick.shared, tick.generation, |job| {
                job.status = JobStatus::Completed;
                job.result = Some(result.clone());
                job.error_message = None;
            });
            if completed {
                tracing::info!(
                    job_id = %tick.job_id,
                    candidates = result.candidates.len(),
                    model_version = %result.model_version,
                    "job completed"
                );
                let _ = tick.event_tx.send(JobEvent::StatusChanged {
                    job_id: Some(tick.job_id.clone()),
                    status: JobStatus::Completed,
                });
                let _ = tick.event_tx.send(JobEvent::JobCompleted {
                    result: Box::new(result),
                });
            } else {
                tracing::debug!(job_id = %tick.job_id, "discarding result for superseded job");
            }
            ControlFlow::Break(())
        }
        Ok(PollOutcome::Failed(message)) => tick.finish_failed(JobError::JobFailed(message)),
        Err(e) => {
            // Transient: absorbed and retried on the next tick, never surfaced as a failure.
            let err = JobError::TransientPollError(format!("{e:#}"));
            tracing::warn!(job_id = %tick.job_id, attempt, error = %err, "status check failed");
            let _ = tick.event_tx.send(JobEvent::Info(InfoEvent::PollRetry {
                attempt,
                kind: err.kind(),
                error: format!("{e:#}"),
            }));
            ControlFlow::Continue(())
        }
    }
}

/// Serve UI commands until `Quit` (or the command channel closes), then tear down
/// and return the last job snapshot.
pub(crate) async fn run_controller<B: AnalysisBackend>(
    backend: Arc<B>,
    cfg: JobConfig,
    event_tx: UnboundedSender<JobEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<Job> {
    let mut controller = JobController::new(backend, cfg, event_tx.clone());

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            UiCommand::Submit(artifact) => {
                // Submissions are serialized: the next command is not read until this
                // upload has resolved.
                match controller.submit(artifact).await {
                    Ok(_) => {}
                    // Already reported through JobFailed.
                    Err(e) if e.kind() == ErrorKind::SubmissionFailed => {}
                    Err(e) if e.is_user_visible() => {
                        let _ = event_tx.send(JobEvent::SubmitRejected {
                            message: e.to_string(),
                        });
                    }
                    Err(e) => tracing::debug!(error = %e, "submission error not shown"),
                }
            }
            UiCommand::Quit => break,
        }
    }

    controller.teardown();
    Ok(controller.job())
}
