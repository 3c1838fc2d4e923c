use crate::engine::HttpBackend;
use crate::error::JobError;
use crate::model::{InfoEvent, InputArtifact, Job, JobConfig, JobEvent, JobStatus};
use crate::orchestrator::{self, UiCommand};
use crate::viewport::{
    HeadlessEngine, MountPoint, ViewportEngine, ViewportManager, SAMPLE_STRUCTURE_URL,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

type OutputTx = mpsc::UnboundedSender<OutputLine>;

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (OutputTx, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Mount point used by `--viewer`; matches the original panel size.
const VIEWER_MOUNT: (&str, u32, u32) = ("viewer", 640, 256);

#[derive(Debug, Parser, Clone)]
#[command(
    name = "genome-insight",
    version,
    about = "Submit a sequence file to the genomic candidate service and follow the results"
)]
pub struct Cli {
    /// Base URL of the analysis service API
    #[arg(long, env = "GENOME_INSIGHT_API_BASE", default_value = "http://localhost:8000")]
    pub api_base: String,

    /// FASTA/CSV file to submit (sent as-is)
    #[arg(long, conflicts_with = "demo")]
    pub file: Option<PathBuf>,

    /// Submit a tiny built-in demo sequence (demo.fa)
    #[arg(long)]
    pub demo: bool,

    /// Print the final job as JSON and exit
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (default)
    #[arg(long, conflicts_with = "json")]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Interval between status checks
    #[arg(long, default_value = "1.2s")]
    pub poll_interval: humantime::Duration,

    /// Give up waiting for a result after this long (default: wait forever)
    #[arg(long)]
    pub poll_timeout: Option<humantime::Duration>,

    /// Timeout for each HTTP request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Only check the backend's health endpoint
    #[arg(long)]
    pub health: bool,

    /// Load the reference structure into a headless viewer alongside the job
    #[arg(long)]
    pub viewer: bool,

    /// Load the reference structure a second time (reload)
    #[arg(long, requires = "viewer")]
    pub viewer_reload: bool,

    /// Structure loaded by the viewer
    #[arg(long, default_value = SAMPLE_STRUCTURE_URL)]
    pub sample_url: String,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    let cfg = build_config(&args)?;
    let (out_tx, out_handle) = if args.silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    let res = if args.health {
        run_health(&cfg, out_tx.as_ref()).await
    } else {
        let artifact = load_artifact(&args)?;
        // A viewer failure is reported but never fails the job.
        let viewer = open_viewer(&args, &cfg).unwrap_or_else(|e| {
            report_viewer_error(&e, out_tx.as_ref());
            None
        });
        let (job, shown) = tokio::join!(
            follow_job(&args, cfg.clone(), artifact, out_tx.as_ref()),
            show_viewer(viewer.as_ref(), &args, out_tx.as_ref()),
        );
        if let Err(e) = shown {
            report_viewer_error(&e, out_tx.as_ref());
        }
        // The viewport lives until the job has settled.
        if let Some(manager) = viewer {
            manager.teardown().await;
        }
        job.and_then(|job| print_job(&args, &job, out_tx.as_ref()))
    };

    drop(out_tx);
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }
    res
}

/// Build a `JobConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<JobConfig> {
    let poll_interval = Duration::from(args.poll_interval);
    // The poll timer cannot run with a zero period.
    if poll_interval.is_zero() {
        return Err(anyhow::anyhow!("--poll-interval must be > 0"));
    }
    Ok(JobConfig {
        api_base: args.api_base.clone(),
        poll_interval,
        poll_timeout: args.poll_timeout.map(Duration::from),
        request_timeout: Duration::from(args.request_timeout),
        user_agent: format!("genome-insight/{}", env!("CARGO_PKG_VERSION")),
    })
}

/// The artifact to submit, if the user chose one. Contents are not inspected.
fn load_artifact(args: &Cli) -> Result<Option<InputArtifact>> {
    if args.demo {
        return Ok(Some(InputArtifact::demo()));
    }
    let Some(path) = args.file.as_deref() else {
        return Ok(None);
    };
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Some(InputArtifact::new(
        file_name(path),
        "application/octet-stream",
        bytes,
    )))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

async fn run_health(cfg: &JobConfig, out_tx: Option<&OutputTx>) -> Result<()> {
    let backend = HttpBackend::new(cfg)?;
    let status = backend.health().await?;
    if let Some(tx) = out_tx {
        let _ = tx.send(OutputLine::Stdout(format!(
            "Backend {}: {}",
            cfg.api_base, status
        )));
    }
    Ok(())
}

/// Submit the artifact, relay progress and wait until the job settles (or Ctrl-C).
async fn follow_job(
    args: &Cli,
    cfg: JobConfig,
    artifact: Option<InputArtifact>,
    out_tx: Option<&OutputTx>,
) -> Result<Job> {
    let progress = out_tx.filter(|_| !args.json);
    if let Some(tx) = progress {
        let _ = tx.send(OutputLine::Stderr(format!("Backend: {}", cfg.api_base)));
    }

    let backend = Arc::new(HttpBackend::new(&cfg)?);
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let controller = tokio::spawn(orchestrator::run_controller(backend, cfg, evt_tx, cmd_rx));

    let _ = cmd_tx.send(UiCommand::Submit(artifact));
    let mut interrupted = false;
    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break };
                let done = ev.ends_submission();
                if let Some(tx) = progress {
                    report_event(&ev, tx);
                }
                if done {
                    break;
                }
            }
            _ = ctrl_c_pressed() => {
                interrupted = true;
                break;
            }
        }
    }

    // Tear down the controller; this cancels polling if the job is still pending.
    let _ = cmd_tx.send(UiCommand::Quit);
    let job = controller
        .await
        .context("job controller task failed")?
        .context("job controller failed")?;

    if interrupted {
        anyhow::bail!("interrupted");
    }
    match job.status {
        JobStatus::Completed => Ok(job),
        JobStatus::Idle => Err(JobError::MissingInput.into()),
        _ => Err(anyhow::anyhow!(
            "{}",
            job.error_message
                .clone()
                .unwrap_or_else(|| "job did not complete".into())
        )),
    }
}

fn report_event(ev: &JobEvent, tx: &OutputTx) {
    let line = match ev {
        JobEvent::StatusChanged { status, .. } => format!("Status: {status:?}"),
        JobEvent::PollPending { attempt, .. } => format!("Waiting for results… (check {attempt})"),
        JobEvent::Info(InfoEvent::PollRetry { kind, .. }) if !kind.is_user_visible() => return,
        JobEvent::Info(info) => info.to_message(),
        // Errors are printed once, by main.
        JobEvent::JobFailed { .. } | JobEvent::SubmitRejected { .. } => return,
        JobEvent::JobCompleted { .. } => "Results ready".to_string(),
    };
    let _ = tx.send(OutputLine::Stderr(line));
}

fn print_job(args: &Cli, job: &Job, out_tx: Option<&OutputTx>) -> Result<()> {
    let Some(tx) = out_tx else {
        return Ok(());
    };
    if args.json {
        let out = serde_json::to_string_pretty(job)?;
        let _ = tx.send(OutputLine::Stdout(out));
        return Ok(());
    }
    if let Some(result) = job.result.as_ref() {
        for line in crate::text_summary::build_text_summary(result).lines {
            let _ = tx.send(OutputLine::Stdout(line));
        }
    }
    Ok(())
}

fn report_viewer_error(e: &anyhow::Error, out_tx: Option<&OutputTx>) {
    if let Some(tx) = out_tx {
        let _ = tx.send(OutputLine::Stderr(format!("Viewer: {e:#}")));
    }
}

/// The headless viewport for `--viewer`, if requested. Nothing is attached yet.
fn open_viewer(args: &Cli, cfg: &JobConfig) -> Result<Option<ViewportManager<HeadlessEngine>>> {
    if !args.viewer {
        return Ok(None);
    }
    let engine = HeadlessEngine::new(&cfg.user_agent, cfg.request_timeout)?;
    Ok(Some(ViewportManager::new(engine, args.sample_url.clone())))
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn ctrl_c_pressed() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Attach the viewport and load the reference structure, giving up as soon as
/// `interrupt` resolves. Disposal is left to the caller.
async fn load_viewer<E: ViewportEngine>(
    manager: &ViewportManager<E>,
    reload: bool,
    interrupt: impl Future<Output = ()>,
) -> Result<()> {
    let (id, width, height) = VIEWER_MOUNT;
    let mount = MountPoint::new(id, width, height);

    let load = async {
        manager.initialize(&mount).await?;
        let loads = if reload { 2 } else { 1 };
        for _ in 0..loads {
            manager.load_sample().await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    tokio::select! {
        res = load => res,
        _ = interrupt => Err(anyhow::anyhow!("interrupted")),
    }
}

async fn show_viewer(
    manager: Option<&ViewportManager<HeadlessEngine>>,
    args: &Cli,
    out_tx: Option<&OutputTx>,
) -> Result<()> {
    let Some(manager) = manager else {
        return Ok(());
    };
    let res = load_viewer(manager, args.viewer_reload, ctrl_c_pressed()).await;

    if manager.is_loaded().await {
        let summary = manager
            .with_session(|s| {
                let stage = s.handle();
                let view = stage
                    .view()
                    .map(|v| {
                        format!(
                            ", view center ({:.1}, {:.1}, {:.1}) radius {:.1} Å",
                            v.center[0], v.center[1], v.center[2], v.radius
                        )
                    })
                    .unwrap_or_default();
                format!(
                    "Viewer [{}]: {} atoms from {}{}",
                    s.mount_id(),
                    stage.atom_count(),
                    stage.source().unwrap_or("-"),
                    view
                )
            })
            .await;
        if let (Some(tx), Some(line)) = (out_tx.filter(|_| !args.json), summary) {
            let _ = tx.send(OutputLine::Stderr(line));
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve_canned, CannedResponse, TWO_ATOMS};

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["genome-insight"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn config_defaults_follow_the_service_contract() {
        let args = parse(&["--api-base", "http://backend:8000"]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.api_base, "http://backend:8000");
        assert_eq!(cfg.poll_interval, Duration::from_millis(1200));
        assert_eq!(cfg.poll_timeout, None);
        assert_eq!(args.sample_url, SAMPLE_STRUCTURE_URL);
    }

    #[test]
    fn poll_timeout_is_opt_in() {
        let cfg = build_config(&parse(&["--poll-timeout", "2m", "--poll-interval", "500ms"])).unwrap();
        assert_eq!(cfg.poll_timeout, Some(Duration::from_secs(120)));
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = build_config(&parse(&["--poll-interval", "0s"])).unwrap_err();
        assert_eq!(err.to_string(), "--poll-interval must be > 0");
    }

    #[test]
    fn transient_retries_stay_out_of_progress_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        report_event(
            &JobEvent::Info(InfoEvent::PollRetry {
                attempt: 3,
                kind: crate::error::ErrorKind::TransientPollError,
                error: "connection reset".into(),
            }),
            &tx,
        );
        assert!(rx.try_recv().is_err());

        report_event(
            &JobEvent::Info(InfoEvent::Queued {
                job_id: "abc123".into(),
            }),
            &tx,
        );
        match rx.try_recv() {
            Ok(OutputLine::Stderr(line)) => assert_eq!(line, "Job queued: abc123"),
            _ => panic!("expected a progress line"),
        }
    }

    #[test]
    fn viewer_is_only_opened_on_request() {
        let args = parse(&[]);
        let cfg = build_config(&args).unwrap();
        assert!(open_viewer(&args, &cfg).unwrap().is_none());
    }

    fn headless_viewer(url: String) -> ViewportManager<HeadlessEngine> {
        let engine = HeadlessEngine::new("genome-insight-tests", Duration::from_secs(30)).unwrap();
        ViewportManager::new(engine, url)
    }

    #[tokio::test]
    async fn viewer_stays_attached_after_loading() {
        let base = serve_canned(vec![CannedResponse::text(200, TWO_ATOMS)]).await;
        let manager = headless_viewer(format!("{base}/1CRN.pdb"));

        load_viewer(&manager, false, std::future::pending())
            .await
            .unwrap();
        assert!(manager.is_loaded().await);
        assert_eq!(
            manager.with_session(|s| s.handle().atom_count()).await,
            Some(2)
        );

        manager.teardown().await;
        assert!(manager.with_session(|_| ()).await.is_none());
    }

    #[tokio::test]
    async fn interrupt_abandons_a_stalled_structure_download() {
        // Connections queue in the backlog and never get an answer.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/1CRN.pdb", silent.local_addr().unwrap());
        let manager = headless_viewer(url);

        let started = std::time::Instant::now();
        let err = load_viewer(
            &manager,
            false,
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "interrupted");
        assert!(started.elapsed() < Duration::from_secs(5));

        // The session survives the abandoned load until the caller disposes it.
        assert!(!manager.is_loaded().await);
        assert_eq!(
            manager.with_session(|s| s.mount_id().to_string()).await.as_deref(),
            Some("viewer")
        );
        manager.teardown().await;
        assert!(manager.with_session(|_| ()).await.is_none());
    }

    #[test]
    fn no_file_means_no_artifact() {
        assert!(load_artifact(&parse(&[])).unwrap().is_none());
    }

    #[test]
    fn demo_artifact_is_a_small_fasta() {
        let artifact = load_artifact(&parse(&["--demo"])).unwrap().unwrap();
        assert_eq!(artifact.filename, "demo.fa");
        assert_eq!(artifact.mime_type, "text/plain");
        assert!(artifact.bytes.starts_with(b">demo\n"));
    }

    #[test]
    fn file_artifact_is_passed_through_unchanged() {
        let path = std::env::temp_dir().join(format!("genome-insight-{}.csv", std::process::id()));
        std::fs::write(&path, b"id,sequence\n1,ATGC\n").unwrap();
        let artifact = load_artifact(&parse(&["--file", path.to_str().unwrap()]))
            .unwrap()
            .unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(artifact.filename, path.file_name().unwrap().to_string_lossy());
        assert_eq!(&artifact.bytes[..], b"id,sequence\n1,ATGC\n");
    }

    #[test]
    fn reload_requires_viewer() {
        let argv = ["genome-insight", "--viewer-reload"];
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
