use crate::engine::{AnalysisBackend, PollOutcome};
use crate::model::{AnalysisResult, Candidate, InputArtifact, JobConfig};
use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;

/// reqwest-backed client for the analysis service.
pub struct HttpBackend {
    pub(crate) http: reqwest::Client,
    cfg: JobConfig,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    job_id: String,
    #[serde(default)]
    status: Option<String>,
}

/// Body of `GET /results/{job_id}` once it is no longer a 202.
#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

impl HttpBackend {
    pub fn new(cfg: &JobConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            cfg: cfg.clone(),
        })
    }

    /// Query `GET /health` and return the reported status string.
    pub async fn health(&self) -> Result<String> {
        let resp = self
            .http
            .get(self.cfg.health_url())
            .send()
            .await
            .context("health request failed")?
            .error_for_status()
            .context("health endpoint returned an error status")?;
        let body: HealthResponse = resp.json().await.context("invalid health response")?;
        Ok(body.status)
    }
}

impl AnalysisBackend for HttpBackend {
    async fn submit(&self, artifact: &InputArtifact) -> Result<String> {
        let part = Part::bytes(artifact.bytes.to_vec())
            .file_name(artifact.filename.clone())
            .mime_str(&artifact.mime_type)
            .with_context(|| format!("invalid MIME type {:?}", artifact.mime_type))?;
        let form = Form::new().part("file", part);

        let resp = self
            .http
            .post(self.cfg.upload_url())
            .multipart(form)
            .send()
            .await
            .context("upload request failed")?
            .error_for_status()
            .context("upload rejected")?;

        let body: UploadResponse = resp.json().await.context("invalid upload response")?;
        tracing::debug!(
            job_id = %body.job_id,
            status = body.status.as_deref().unwrap_or("-"),
            "upload accepted"
        );
        Ok(body.job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollOutcome> {
        let resp = self
            .http
            .get(self.cfg.results_url(job_id))
            .send()
            .await
            .context("status request failed")?;

        if resp.status() == StatusCode::ACCEPTED {
            return Ok(PollOutcome::Pending);
        }
        let resp = resp
            .error_for_status()
            .context("status endpoint returned an error status")?;
        let body: StatusBody = resp.json().await.context("invalid status response")?;
        Ok(interpret_status_body(body))
    }
}

/// Presence of `candidates` is the completion signal; an explicit `"status": "failed"`
/// is the failure signal; anything else is still pending.
fn interpret_status_body(body: StatusBody) -> PollOutcome {
    if let Some(candidates) = body.candidates {
        return PollOutcome::Completed(AnalysisResult {
            job_id: body.job_id,
            candidates,
            model_version: body.model_version.unwrap_or_default(),
            received_at: None,
        });
    }
    if body.status.as_deref() == Some("failed") {
        let message = body
            .error
            .or_else(|| {
                body.detail.map(|d| match d {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
            })
            .unwrap_or_else(|| "backend reported failure".into());
        return PollOutcome::Failed(message);
    }
    PollOutcome::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve_canned, serve_canned_recording, test_config, CannedResponse};

    fn body(json: &str) -> StatusBody {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn empty_candidates_still_complete_the_job() {
        match interpret_status_body(body(r#"{"candidates": [], "model_version": "v"}"#)) {
            PollOutcome::Completed(r) => assert!(r.candidates.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn failed_status_carries_backend_message() {
        match interpret_status_body(body(r#"{"status": "failed", "detail": "model crashed"}"#)) {
            PollOutcome::Failed(msg) => assert_eq!(msg, "model crashed"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unknown_body_is_treated_as_pending() {
        assert!(matches!(
            interpret_status_body(body(r#"{"status": "pending"}"#)),
            PollOutcome::Pending
        ));
        assert!(matches!(
            interpret_status_body(body(r#"{"detail": "Not Found"}"#)),
            PollOutcome::Pending
        ));
    }

    #[tokio::test]
    async fn poll_maps_202_then_result_payload() {
        let base = serve_canned(vec![
            CannedResponse::json(202, r#"{"status": "pending"}"#),
            CannedResponse::json(
                200,
                r#"{"job_id": "abc123", "candidates": [{"id": 1, "region": "exon-3", "score": 0.87, "rationale": "high GC skew"}], "model_version": "xgb_kmer_v1"}"#,
            ),
        ])
        .await;
        let backend = HttpBackend::new(&test_config(&base)).unwrap();

        assert!(matches!(
            backend.poll("abc123").await.unwrap(),
            PollOutcome::Pending
        ));
        match backend.poll("abc123").await.unwrap() {
            PollOutcome::Completed(r) => {
                assert_eq!(r.model_version, "xgb_kmer_v1");
                assert_eq!(r.candidates.len(), 1);
                assert_eq!(r.candidates[0].region, "exon-3");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_server_error_is_an_error_not_an_outcome() {
        let base = serve_canned(vec![CannedResponse::json(500, r#"{"detail": "boom"}"#)]).await;
        let backend = HttpBackend::new(&test_config(&base)).unwrap();
        assert!(backend.poll("abc123").await.is_err());
    }

    #[tokio::test]
    async fn submit_uploads_multipart_file_and_returns_job_id() {
        let (base, mut requests) = serve_canned_recording(vec![CannedResponse::json(
            200,
            r#"{"job_id": "abc123", "status": "queued"}"#,
        )])
        .await;
        let backend = HttpBackend::new(&test_config(&base)).unwrap();

        let job_id = backend.submit(&InputArtifact::demo()).await.unwrap();
        assert_eq!(job_id, "abc123");

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("POST /upload HTTP/1.1\r\n"), "{request}");
        assert!(request.contains("multipart/form-data; boundary="));
        assert!(request.contains(r#"name="file"; filename="demo.fa""#));
        assert!(request.contains("Content-Type: text/plain"));
        assert!(request.contains(">demo\nATGCATGCATGCATGCATGC\n"));
    }

    #[tokio::test]
    async fn submit_server_error_is_an_error() {
        let base = serve_canned(vec![CannedResponse::json(500, r#"{"detail": "boom"}"#)]).await;
        let backend = HttpBackend::new(&test_config(&base)).unwrap();
        let err = backend.submit(&InputArtifact::demo()).await.unwrap_err();
        assert!(format!("{err:#}").contains("upload rejected"), "{err:#}");
    }

    #[tokio::test]
    async fn submit_without_job_id_is_an_error() {
        let base = serve_canned(vec![CannedResponse::json(200, r#"{"status": "queued"}"#)]).await;
        let backend = HttpBackend::new(&test_config(&base)).unwrap();
        let err = backend.submit(&InputArtifact::demo()).await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid upload response"), "{err:#}");
    }

    #[tokio::test]
    async fn health_reports_status() {
        let base = serve_canned(vec![CannedResponse::json(200, r#"{"status": "ok"}"#)]).await;
        let backend = HttpBackend::new(&test_config(&base)).unwrap();
        assert_eq!(backend.health().await.unwrap(), "ok");
    }
}
