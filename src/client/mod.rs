pub mod http;
pub mod local;

pub use http::{pooled_client, HttpServiceClient, SseFramer};
pub use local::LocalService;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

/// A live stream of event payloads produced by a node
pub type ChunkStream = BoxStream<'static, Result<String, ServiceError>>;

/// What a node hands back from one invocation
pub enum NodeOutput {
    /// Fully materialized response body
    Data(Value),
    /// Live stream; can be read exactly once
    Stream(ChunkStream),
}

impl NodeOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, NodeOutput::Stream(_))
    }
}

impl std::fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeOutput::Data(v) => f.debug_tuple("Data").field(v).finish(),
            NodeOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Sub-pipeline error: {0}")]
    Pipeline(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

/// Uniform invocation contract every node exposes to the orchestrator.
///
/// Implementations own the wire format of their backend; the orchestrator
/// only ever sees JSON values in and a value or a stream out.
#[async_trait]
pub trait NodeService: Send + Sync {
    async fn invoke(&self, request: Value) -> Result<NodeOutput, ServiceError>;
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Replays canned outputs and records every request it receives
    pub struct MockService {
        responses: Mutex<Vec<Result<Value, ServiceError>>>,
        stream_chunks: Option<Vec<String>>,
        requests: Arc<Mutex<Vec<Value>>>,
    }

    impl MockService {
        pub fn new(responses: Vec<Value>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(Ok).rev().collect()),
                stream_chunks: None,
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn streaming(chunks: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                stream_chunks: Some(chunks.into_iter().map(String::from).collect()),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                responses: Mutex::new(vec![Err(ServiceError::Api {
                    status: 500,
                    message: message.to_string(),
                })]),
                stream_chunks: None,
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn requests(&self) -> Arc<Mutex<Vec<Value>>> {
            self.requests.clone()
        }
    }

    #[async_trait]
    impl NodeService for MockService {
        async fn invoke(&self, request: Value) -> Result<NodeOutput, ServiceError> {
            self.requests.lock().unwrap().push(request);

            if let Some(chunks) = &self.stream_chunks {
                let items: Vec<Result<String, ServiceError>> =
                    chunks.iter().cloned().map(Ok).collect();
                return Ok(NodeOutput::Stream(Box::pin(futures::stream::iter(items))));
            }

            match self.responses.lock().unwrap().pop() {
                Some(Ok(v)) => Ok(NodeOutput::Data(v)),
                Some(Err(e)) => Err(e),
                None => Ok(NodeOutput::Data(Value::Null)),
            }
        }
    }
}
