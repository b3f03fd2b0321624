//! Request-facing side of a megaservice: decode a domain request, run the
//! pipeline, and pick the terminal result to hand back.

pub mod audio;
pub mod chat;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ChunkStream, NodeOutput};
use crate::graph::{Capability, NodeDescriptor};
use crate::runtime::{
    ExecutionContext, NodeResult, Orchestrator, OrchestratorError, Parameters, Payload,
    StreamHandle, Terminal,
};

pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Cannot project result of node '{node}': {reason}")]
    Projection { node: String, reason: String },
}

/// What the gateway hands to the transport
pub enum GatewayOutput {
    /// Live stream of the terminal node, shaped chunk by chunk
    Stream { node: String, stream: ChunkStream },
    /// Fully materialized terminal result
    Data { node: String, value: Value },
}

impl std::fmt::Debug for GatewayOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayOutput::Stream { node, .. } => {
                f.debug_struct("Stream").field("node", node).finish_non_exhaustive()
            }
            GatewayOutput::Data { node, value } => f
                .debug_struct("Data")
                .field("node", node)
                .field("value", value)
                .finish(),
        }
    }
}

/// The externally exposed composite endpoint owning one pipeline
pub struct Gateway {
    orchestrator: Arc<Orchestrator>,
    terminal: Capability,
    auxiliary: Vec<Arc<NodeDescriptor>>,
    timeout: Duration,
}

impl Gateway {
    pub fn new(orchestrator: Arc<Orchestrator>, terminal: Capability) -> Self {
        Self {
            orchestrator,
            terminal,
            auxiliary: Vec::new(),
            timeout: DEFAULT_GATEWAY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Node run alongside the graph for every request. Its result is
    /// published to the request's handoff slot named after the node.
    pub fn with_auxiliary(mut self, node: NodeDescriptor) -> Self {
        self.auxiliary.push(Arc::new(node));
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn terminal(&self) -> &Capability {
        &self.terminal
    }

    pub fn auxiliary(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.auxiliary.iter().map(|n| n.as_ref())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Schedule one request and pick its terminal result.
    ///
    /// On timeout the whole request future is dropped, which cancels every
    /// node call still in flight.
    pub async fn execute(
        &self,
        payload: Payload,
        params: Parameters,
    ) -> Result<GatewayOutput, GatewayError> {
        let ctx = ExecutionContext::new(payload, params);
        let start = Instant::now();

        match tokio::time::timeout(self.timeout, self.execute_in(&ctx)).await {
            Ok(result) => {
                debug!(
                    "Request {} served in {}ms",
                    ctx.request_id,
                    start.elapsed().as_millis()
                );
                result
            }
            Err(_) => {
                warn!(
                    "Request {} timed out after {}ms",
                    ctx.request_id,
                    self.timeout.as_millis()
                );
                Err(GatewayError::Timeout(self.timeout.as_millis() as u64))
            }
        }
    }

    async fn execute_in(&self, ctx: &ExecutionContext) -> Result<GatewayOutput, GatewayError> {
        let auxiliaries = join_all(self.auxiliary.iter().map(|node| run_auxiliary(node, ctx)));
        let ((mut results, graph), _) = tokio::join!(self.orchestrator.run(ctx), auxiliaries);

        match results.take_terminal(&graph, Some(&self.terminal))? {
            Terminal::Passthrough { node, mut stream } => {
                info!("Passing stream of '{}' through to caller", node);
                let stream = self.orchestrator.shape_stream(&mut stream)?;
                Ok(GatewayOutput::Stream { node, stream })
            }
            Terminal::Leaf {
                node,
                result: NodeResult::Data(value),
            } => Ok(GatewayOutput::Data { node, value }),
            Terminal::Leaf {
                node,
                result: NodeResult::Stream(mut stream),
            } => {
                debug!("Terminal '{}' streamed but is not passthrough; draining", node);
                let text = stream.drain().await?;
                Ok(GatewayOutput::Data {
                    node,
                    value: Value::String(text),
                })
            }
        }
    }
}

/// Invoke one auxiliary node with the initial payload and publish what it
/// returns. Failures are logged; the waiting node then times out.
async fn run_auxiliary(node: &NodeDescriptor, ctx: &ExecutionContext) {
    let request = Value::Object(ctx.payload().clone());

    let value = match node.invoke(request).await {
        Ok(NodeOutput::Data(value)) => value,
        Ok(NodeOutput::Stream(stream)) => {
            match StreamHandle::new(node.name.clone(), stream).drain().await {
                Ok(text) => Value::String(text),
                Err(e) => {
                    warn!("Auxiliary node '{}' failed: {}", node.name, e);
                    return;
                }
            }
        }
        Err(e) => {
            warn!("Auxiliary node '{}' failed: {}", node.name, e);
            return;
        }
    };

    debug!("Auxiliary node '{}' published its result", node.name);
    ctx.handoffs().publish(node.name.clone(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockService;
    use crate::client::{LocalService, ServiceError};
    use crate::graph::OrchestrationGraph;
    use crate::pipelines::PipelineKind;
    use crate::runtime::AlignmentTable;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn gateway(nodes: Vec<NodeDescriptor>, edges: &[(&str, &str)], table: &AlignmentTable) -> Gateway {
        let mut g = OrchestrationGraph::new();
        for n in nodes {
            g.add(n).unwrap();
        }
        for (a, b) in edges {
            g.flow_to(a, b).unwrap();
        }
        Gateway::new(Arc::new(Orchestrator::new(g, table)), Capability::Llm)
    }

    #[tokio::test]
    async fn test_passthrough_stream() {
        let gw = gateway(
            vec![
                NodeDescriptor::local("retriever", Capability::Retriever, MockService::new(vec![json!({"docs": []})])),
                NodeDescriptor::local("llm", Capability::Llm, MockService::streaming(vec!["a", "b"])),
            ],
            &[("retriever", "llm")],
            &AlignmentTable::new(),
        );

        let out = gw.execute(Payload::new(), Parameters::default()).await.unwrap();
        let GatewayOutput::Stream { node, stream } = out else {
            panic!("expected stream");
        };
        assert_eq!(node, "llm");
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_last_leaf_projected_as_data() {
        let gw = gateway(
            vec![NodeDescriptor::local("llm", Capability::Llm, MockService::new(vec![json!({"text": "hi"})]))],
            &[],
            &AlignmentTable::new(),
        );

        let out = gw.execute(Payload::new(), Parameters::default()).await.unwrap();
        assert!(matches!(out, GatewayOutput::Data { ref value, .. } if value["text"] == "hi"));
    }

    #[tokio::test]
    async fn test_failed_terminal_fails_request() {
        let gw = gateway(
            vec![
                NodeDescriptor::local("retriever", Capability::Retriever, MockService::failing("down")),
                NodeDescriptor::local("llm", Capability::Llm, MockService::new(vec![json!({})])),
            ],
            &[("retriever", "llm")],
            &AlignmentTable::new(),
        );

        let err = gw.execute(Payload::new(), Parameters::default()).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Orchestrator(OrchestratorError::NodeInvocation { ref node, .. }) if node == "retriever"
        ));
    }

    /// Raises its flag when dropped
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_timeout_cancels_request() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let slow = LocalService::new(move |_| {
            let in_flight = DropFlag(flag.clone());
            async move {
                let _in_flight = in_flight;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(NodeOutput::Data(json!({})))
            }
        });
        let gw = gateway(
            vec![NodeDescriptor::local("llm", Capability::Llm, slow)],
            &[],
            &AlignmentTable::new(),
        )
        .with_timeout(Duration::from_millis(50));

        let start = Instant::now();
        let err = gw.execute(Payload::new(), Parameters::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(50)));
        assert!(start.elapsed() < Duration::from_secs(1));
        // The node call still in flight was dropped, not left running
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_streamed_tts_drains_to_audio() {
        let tts = LocalService::new(|_| async {
            let chunks: Vec<Result<String, ServiceError>> = vec![
                Ok(json!({"byte_str": "UklGRg"}).to_string()),
                Ok(json!({"byte_str": "AAAA"}).to_string()),
            ];
            Ok(NodeOutput::Stream(Box::pin(futures::stream::iter(chunks))))
        });
        let mut g = OrchestrationGraph::new();
        g.add(NodeDescriptor::local("tts", Capability::Tts, tts)).unwrap();
        let table = PipelineKind::AudioQna.base_alignment();
        let gw = Gateway::new(Arc::new(Orchestrator::new(g, &table)), Capability::Tts);

        let mut payload = Payload::new();
        payload.insert("text".to_string(), json!("Paris"));
        let out = gw.execute(payload, Parameters::default()).await.unwrap();
        let GatewayOutput::Stream { node, stream } = out else {
            panic!("expected the TTS stream to pass through");
        };
        let audio = StreamHandle::new(node, stream).drain().await.unwrap();
        assert_eq!(audio, "UklGRgAAAA");
    }

    #[tokio::test]
    async fn test_auxiliary_result_reaches_rendezvous() {
        let rerank = MockService::new(vec![json!({"ranked": true})]);
        let seen = rerank.requests();
        let table = AlignmentTable::new().rendezvous("llm", "text2query");
        let gw = gateway(
            vec![NodeDescriptor::local("llm", Capability::Llm, rerank)],
            &[],
            &table,
        )
        .with_auxiliary(NodeDescriptor::local(
            "text2query",
            Capability::Text2Query,
            LocalService::from_fn(|req| json!({"sql": format!("SELECT '{}'", req["text"].as_str().unwrap_or(""))})),
        ));

        let mut payload = Payload::new();
        payload.insert("text".to_string(), json!("q"));
        gw.execute(payload, Parameters::default()).await.unwrap();

        let request = seen.lock().unwrap()[0].clone();
        assert_eq!(request["text2query"]["sql"], "SELECT 'q'");
    }
}
