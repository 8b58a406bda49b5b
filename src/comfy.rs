//! ComfyUI image job coordination.
//!
//! A job is submitted to the queue endpoint, then a WebSocket scoped to a
//! fresh client id is watched for the service's completion convention: an
//! `executing` event for our prompt id whose `node` is null/absent means the
//! graph finished. After completion the job's history record is fetched and
//! every declared artifact is retrieved and re-encoded to PNG.

use crate::error::ImageJobError;
use futures::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// Overall wait ceiling for a job.
const DEFAULT_WAIT_CEILING: Duration = Duration::from_secs(300);

/// Lifecycle of one image job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Submitted,
    AwaitingCompletion,
    Completed,
    Failed,
    TimedOut,
}

/// State for a single in-flight job. Jobs are never persisted and share
/// nothing with each other: every request owns a fresh client id and socket.
struct ImageJob {
    client_id: String,
    prompt_id: String,
    phase: JobPhase,
}

impl ImageJob {
    fn new(client_id: String, prompt_id: String) -> Self {
        Self { client_id, prompt_id, phase: JobPhase::Submitted }
    }

    fn advance(&mut self, phase: JobPhase) {
        tracing::debug!(
            prompt_id = %self.prompt_id,
            from = ?self.phase,
            to = ?phase,
            "image job transition"
        );
        self.phase = phase;
    }
}

/// How the completion wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionSignal {
    /// The service reported the graph finished.
    Graceful,
    /// The socket dropped before any completion event. The history fetch is
    /// still attempted as best-effort recovery.
    ConnectionLost,
}

/// Descriptor of one produced artifact, as reported by the history record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A retrieved artifact, re-encoded to PNG.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub filename: String,
    pub png: Vec<u8>,
}

#[derive(Debug, serde::Serialize)]
struct QueueRequest<'a> {
    prompt: &'a str,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueueAck {
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: WsEventData,
}

#[derive(Debug, Default, Deserialize)]
struct WsEventData {
    #[serde(default)]
    prompt_id: Option<String>,
    /// `null` or absent once the graph has finished executing.
    #[serde(default)]
    node: Option<serde_json::Value>,
}

/// Client for the ComfyUI queue, notification, and retrieval endpoints.
pub struct ImageClient {
    http: reqwest::Client,
    http_base: String,
    ws_base: String,
    wait_ceiling: Duration,
    read_timeout: Duration,
}

impl ImageClient {
    pub fn new(http_base: String, ws_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            http_base,
            ws_base,
            wait_ceiling: DEFAULT_WAIT_CEILING,
            read_timeout: DEFAULT_WAIT_CEILING,
        }
    }

    /// Override the wait ceiling and per-read timeout.
    pub fn with_timeouts(mut self, wait_ceiling: Duration, read_timeout: Duration) -> Self {
        self.wait_ceiling = wait_ceiling;
        self.read_timeout = read_timeout;
        self
    }

    /// Run one image job end to end and return the produced images.
    pub async fn generate(&self, prompt: &str) -> Result<Vec<GeneratedImage>, ImageJobError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let prompt_id = self.queue_prompt(prompt, &client_id).await?;
        let mut job = ImageJob::new(client_id, prompt_id);
        tracing::info!(prompt_id = %job.prompt_id, "image job queued");

        job.advance(JobPhase::AwaitingCompletion);
        let signal = match self.await_completion(&job).await {
            Ok(signal) => signal,
            Err(error) => {
                job.advance(match error {
                    ImageJobError::JobTimedOut => JobPhase::TimedOut,
                    _ => JobPhase::Failed,
                });
                return Err(error);
            }
        };
        if signal == CompletionSignal::ConnectionLost {
            tracing::warn!(prompt_id = %job.prompt_id, "notification channel dropped, fetching history anyway");
        }

        let artifacts = match self.fetch_history(&job.prompt_id).await {
            Ok(artifacts) => artifacts,
            Err(error) => {
                job.advance(JobPhase::Failed);
                return Err(error);
            }
        };
        if artifacts.is_empty() {
            job.advance(JobPhase::Failed);
            return Err(match signal {
                CompletionSignal::Graceful => ImageJobError::NoArtifactsProduced,
                CompletionSignal::ConnectionLost => ImageJobError::ConnectionLost,
            });
        }

        let mut images = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            let bytes = self.fetch_artifact(artifact).await?;
            images.push(GeneratedImage {
                filename: format!(
                    "{}.png",
                    artifact
                        .filename
                        .rsplit_once('.')
                        .map(|(stem, _)| stem)
                        .unwrap_or(artifact.filename.as_str())
                ),
                png: reencode_png(&bytes)?,
            });
        }

        job.advance(JobPhase::Completed);
        tracing::info!(prompt_id = %job.prompt_id, images = images.len(), "image job completed");
        Ok(images)
    }

    /// Submit the prompt and return the server-assigned job id.
    async fn queue_prompt(&self, prompt: &str, client_id: &str) -> Result<String, ImageJobError> {
        let response = self
            .http
            .post(format!("{}/prompt", self.http_base))
            .json(&QueueRequest { prompt, client_id })
            .send()
            .await
            .map_err(|error| ImageJobError::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageJobError::QueueRejected(format!("status {}", status.as_u16())));
        }

        let ack: QueueAck = response
            .json()
            .await
            .map_err(|error| ImageJobError::Parse(error.to_string()))?;
        ack.prompt_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ImageJobError::QueueRejected("acknowledgment carried no prompt_id".into()))
    }

    /// Watch the notification channel until the job finishes, times out, or
    /// the connection drops.
    async fn await_completion(&self, job: &ImageJob) -> Result<CompletionSignal, ImageJobError> {
        let url = format!("{}/ws?clientId={}", self.ws_base, job.client_id);
        let (mut socket, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|error| ImageJobError::Network(error.to_string()))?;

        let deadline = Instant::now() + self.wait_ceiling;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ImageJobError::JobTimedOut);
            }
            let per_read = self.read_timeout.min(deadline - now);

            let frame = match tokio::time::timeout(per_read, socket.next()).await {
                Err(_) => return Err(ImageJobError::JobTimedOut),
                Ok(None) => return Ok(CompletionSignal::ConnectionLost),
                Ok(Some(Err(error))) => {
                    tracing::warn!(prompt_id = %job.prompt_id, %error, "notification read failed");
                    return Ok(CompletionSignal::ConnectionLost);
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => {
                    let event: WsEvent = match serde_json::from_str(text.as_str()) {
                        Ok(event) => event,
                        // Frames for other clients or unknown shapes are noise.
                        Err(_) => continue,
                    };
                    if event.kind == "executing"
                        && event.data.prompt_id.as_deref() == Some(&job.prompt_id)
                        && event.data.node.is_none()
                    {
                        let _ = socket.send(Message::Close(None)).await;
                        return Ok(CompletionSignal::Graceful);
                    }
                }
                Message::Close(_) => return Ok(CompletionSignal::ConnectionLost),
                _ => {}
            }
        }
    }

    /// Fetch the job's history record and collect artifact descriptors from
    /// every output node that declares images.
    async fn fetch_history(&self, prompt_id: &str) -> Result<Vec<ArtifactRef>, ImageJobError> {
        let response = self
            .http
            .get(format!("{}/history/{}", self.http_base, prompt_id))
            .send()
            .await
            .map_err(|error| ImageJobError::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageJobError::Protocol { status: status.as_u16() });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| ImageJobError::Parse(error.to_string()))?;
        // The service keys the record by prompt id; accept a bare record too.
        let record = body.get(prompt_id).unwrap_or(&body);
        let outputs = match record.get("outputs").and_then(|v| v.as_object()) {
            Some(outputs) => outputs,
            None => return Ok(Vec::new()),
        };

        let mut artifacts = Vec::new();
        for node_output in outputs.values() {
            if let Some(images) = node_output.get("images") {
                let refs: Vec<ArtifactRef> = serde_json::from_value(images.clone())
                    .map_err(|error| ImageJobError::Parse(error.to_string()))?;
                artifacts.extend(refs);
            }
        }
        Ok(artifacts)
    }

    /// Retrieve one artifact's raw bytes.
    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ImageJobError> {
        let response = self
            .http
            .get(format!("{}/view", self.http_base))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ])
            .send()
            .await
            .map_err(|error| ImageJobError::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageJobError::Protocol { status: status.as_u16() });
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|error| ImageJobError::Network(error.to_string()))
    }
}

/// Decode an artifact and re-encode it to canonical PNG.
fn reencode_png(bytes: &[u8]) -> Result<Vec<u8>, ImageJobError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|error| ImageJobError::Decode(error.to_string()))?;
    let mut out = Vec::new();
    decoded
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|error| ImageJobError::Decode(error.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt as _;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// One-shot WebSocket server: accepts a single connection and runs the
    /// given script against it.
    async fn ws_server<F, Fut>(script: F) -> String
    where
        F: FnOnce(
                tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
            ) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            script(socket).await;
        });
        format!("ws://{addr}")
    }

    fn executing_event(prompt_id: &str, node: serde_json::Value) -> String {
        serde_json::json!({ "type": "executing", "data": { "prompt_id": prompt_id, "node": node } })
            .to_string()
    }

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([200, 40, 40, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    async fn mount_queue_ack(server: &MockServer, prompt_id: &str) {
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "prompt_id": prompt_id })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn completes_and_returns_one_reencoded_artifact() {
        let server = MockServer::start().await;
        mount_queue_ack(&server, "job-1").await;

        Mock::given(method("GET"))
            .and(path("/history/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "job-1": {
                    "outputs": {
                        "9": { "images": [
                            { "filename": "out_00001_.png", "subfolder": "", "type": "output" }
                        ]},
                        "11": { "gifs": [] }
                    }
                }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/view"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tiny_png()))
            .mount(&server)
            .await;

        let ws = ws_server(|mut socket| async move {
            // An event for some other client's job is ignored.
            socket
                .send(Message::text(executing_event("other-job", serde_json::json!(null))))
                .await
                .unwrap();
            // Still executing a node: not a completion signal.
            socket
                .send(Message::text(executing_event("job-1", serde_json::json!("9"))))
                .await
                .unwrap();
            socket
                .send(Message::text(executing_event("job-1", serde_json::json!(null))))
                .await
                .unwrap();
            // Keep the socket open; the client should exit on its own.
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await;

        let client = ImageClient::new(server.uri(), ws)
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
        let images = client.generate("a red square").await.unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].filename, "out_00001_.png");
        let decoded = image::load_from_memory(&images[0].png).unwrap();
        assert_eq!(decoded.width(), 1);
    }

    #[tokio::test]
    async fn silence_times_out() {
        let server = MockServer::start().await;
        mount_queue_ack(&server, "job-2").await;

        let ws = ws_server(|socket| async move {
            // Hold the socket open but silent; the client must time out.
            let _socket = socket;
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await;

        let client = ImageClient::new(server.uri(), ws)
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(50));
        let error = client.generate("anything").await.unwrap_err();
        assert!(matches!(error, ImageJobError::JobTimedOut));
    }

    #[tokio::test]
    async fn queue_rejection_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ImageClient::new(server.uri(), "ws://127.0.0.1:1".into());
        let error = client.generate("anything").await.unwrap_err();
        assert!(matches!(error, ImageJobError::QueueRejected(_)));
    }

    #[tokio::test]
    async fn missing_prompt_id_is_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = ImageClient::new(server.uri(), "ws://127.0.0.1:1".into());
        let error = client.generate("anything").await.unwrap_err();
        assert!(matches!(error, ImageJobError::QueueRejected(_)));
    }

    #[tokio::test]
    async fn dropped_socket_with_empty_history_is_connection_lost() {
        let server = MockServer::start().await;
        mount_queue_ack(&server, "job-3").await;

        Mock::given(method("GET"))
            .and(path("/history/job-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "job-3": { "outputs": {} }
            })))
            .mount(&server)
            .await;

        let ws = ws_server(|socket| async move {
            drop(socket);
        })
        .await;

        let client = ImageClient::new(server.uri(), ws)
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(1));
        let error = client.generate("anything").await.unwrap_err();
        assert!(matches!(error, ImageJobError::ConnectionLost));
    }

    #[tokio::test]
    async fn graceful_completion_with_no_artifacts_is_distinct() {
        let server = MockServer::start().await;
        mount_queue_ack(&server, "job-4").await;

        Mock::given(method("GET"))
            .and(path("/history/job-4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "job-4": { "outputs": {} }
            })))
            .mount(&server)
            .await;

        let ws = ws_server(|mut socket| async move {
            socket
                .send(Message::text(executing_event("job-4", serde_json::json!(null))))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        let client = ImageClient::new(server.uri(), ws)
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(1));
        let error = client.generate("anything").await.unwrap_err();
        assert!(matches!(error, ImageJobError::NoArtifactsProduced));
    }
}
