//! Helpers shared by unit tests: a throwaway HTTP responder and a default config.

use crate::model::JobConfig;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub(crate) struct CannedResponse {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl CannedResponse {
    pub(crate) fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub(crate) fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Byte offset just past the blank line ending the request head.
fn head_end(request: &[u8]) -> Option<usize> {
    request.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Read one request: the head, then the body up to `Content-Length`.
async fn read_request(sock: &mut TcpStream) -> Vec<u8> {
    let mut request = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut expected = None;
    loop {
        if let Some(total) = expected {
            if request.len() >= total {
                break;
            }
        }
        let n = sock.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
        if expected.is_none() {
            if let Some(end) = head_end(&request) {
                let head = String::from_utf8_lossy(&request[..end]);
                expected = Some(end + content_length(&head));
            }
        }
    }
    request
}

/// Answer one connection per canned response, in order, then stop accepting.
/// Returns the base URL of the listener.
pub(crate) async fn serve_canned(responses: Vec<CannedResponse>) -> String {
    serve(responses, None).await
}

/// Like [`serve_canned`], also handing each raw request (head and body) to the test.
pub(crate) async fn serve_canned_recording(
    responses: Vec<CannedResponse>,
) -> (String, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (serve(responses, Some(tx)).await, rx)
}

async fn serve(
    responses: Vec<CannedResponse>,
    requests: Option<mpsc::UnboundedSender<String>>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for resp in responses {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let request = read_request(&mut sock).await;
            if let Some(tx) = &requests {
                let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
            }
            let raw = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                resp.status,
                reason(resp.status),
                resp.content_type,
                resp.body.len(),
                resp.body
            );
            let _ = sock.write_all(raw.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });
    format!("http://{addr}")
}

/// Minimal PDB with one ATOM and one HETATM record.
pub(crate) const TWO_ATOMS: &str = "\
HEADER    PLANT PROTEIN                           30-APR-81   1CRN
ATOM      1  N   THR A   1      -2.000   0.000   0.000  1.00 13.79           N
HETATM    2  O   HOH A 101       2.000   0.000   0.000  1.00 20.00           O
TER       3      HOH A 101
END
";

pub(crate) fn test_config(api_base: &str) -> JobConfig {
    JobConfig {
        api_base: api_base.to_string(),
        poll_interval: Duration::from_millis(1200),
        poll_timeout: None,
        request_timeout: Duration::from_secs(5),
        user_agent: "genome-insight-tests".into(),
    }
}
