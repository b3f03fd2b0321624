use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::{NodeOutput, NodeService, ServiceError};

/// Default time a remote node has to answer (response head, or full JSON body)
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(120);

/// Time allowed to open a TCP connection to a node
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// SBIO: Pure functions for SSE framing
// ============================================================================

/// Incremental decoder for `text/event-stream` bodies.
///
/// Raw bytes are buffered until a full line arrives, so a multi-byte
/// character split across network chunks is decoded whole. `data:` lines
/// accumulate until the blank line that ends their event and are joined
/// with `\n`.
#[derive(Debug, Default)]
pub struct SseFramer {
    buf: Vec<u8>,
    data: Option<String>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk and return every event it completes.
    /// Pure function - no I/O.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                events.extend(self.dispatch());
            } else if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                match &mut self.data {
                    Some(pending) => {
                        pending.push('\n');
                        pending.push_str(data);
                    }
                    None => self.data = Some(data.to_string()),
                }
            }
        }

        events
    }

    /// Flush whatever the upstream left unterminated when it closed
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = if self.buf.is_empty() {
            Vec::new()
        } else {
            self.push(b"\n")
        };
        events.extend(self.dispatch());
        events
    }

    fn dispatch(&mut self) -> Option<String> {
        self.data.take().filter(|data| !data.is_empty())
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false)
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

/// Calls a remote node over HTTP
#[derive(Clone)]
pub struct HttpServiceClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

/// A reqwest client suitable for sharing across every node of a pipeline
pub fn pooled_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_default()
}

impl HttpServiceClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: pooled_client(),
            endpoint,
            timeout: DEFAULT_NODE_TIMEOUT,
        }
    }

    /// Share one connection pool across nodes
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn timed_out(&self) -> ServiceError {
        ServiceError::Http(format!(
            "{} did not answer within {:?}",
            self.endpoint, self.timeout
        ))
    }
}

#[async_trait]
impl NodeService for HttpServiceClient {
    async fn invoke(&self, request: Value) -> Result<NodeOutput, ServiceError> {
        debug!("POST {}", self.endpoint);

        // Bounds the response head and JSON bodies; a stream may run as long
        // as the upstream keeps it open
        let deadline = Instant::now() + self.timeout;

        let response = timeout_at(deadline, self.client.post(&self.endpoint).json(&request).send())
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| ServiceError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = timeout_at(deadline, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        if is_event_stream(&response) {
            let stream = response
                .bytes_stream()
                .map(Some)
                .chain(futures::stream::once(async { None }))
                .scan(SseFramer::new(), |framer, chunk| {
                    let events: Vec<Result<String, ServiceError>> = match chunk {
                        Some(Ok(bytes)) => framer.push(&bytes).into_iter().map(Ok).collect(),
                        Some(Err(e)) => vec![Err(ServiceError::Http(e.to_string()))],
                        None => framer.finish().into_iter().map(Ok).collect(),
                    };
                    futures::future::ready(Some(events))
                })
                .flat_map(futures::stream::iter)
                .take_while(|event| {
                    let done = matches!(event, Ok(data) if data.as_str() == "[DONE]");
                    futures::future::ready(!done)
                });
            return Ok(NodeOutput::Stream(Box::pin(stream)));
        }

        let body = timeout_at(deadline, response.json::<Value>())
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| ServiceError::Parse(e.to_string()))?;

        Ok(NodeOutput::Data(body))
    }
}
