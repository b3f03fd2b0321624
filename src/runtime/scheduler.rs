use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{ChunkStream, NodeOutput, NodeService, ServiceError};
use crate::graph::{NodeId, OrchestrationGraph, RuntimeGraph};
use crate::runtime::alignment::{
    AlignmentTable, InputShape, OutputShape, ResolvedAlignment, StreamShaper,
};
use crate::runtime::context::{ExecutionContext, HandoffPolicy, Parameters, Payload};
use crate::runtime::result::{NodeResult, ResultMap, Terminal};
use crate::runtime::stream::StreamHandle;
use crate::runtime::OrchestratorError;

/// One unit of finished work handed back to the scheduling loop
enum Step {
    /// A rendezvous wait resolved (or timed out); the node can now be shaped
    Gated {
        id: NodeId,
        key: String,
        inputs: Payload,
        value: Result<Value, OrchestratorError>,
    },
    /// A node call returned
    Invoked {
        id: NodeId,
        inputs: Payload,
        request: Value,
        output: Result<NodeOutput, OrchestratorError>,
    },
    /// A mid-graph stream was read to the end
    Drained {
        id: NodeId,
        inputs: Payload,
        request: Value,
        text: Result<String, OrchestratorError>,
    },
}

/// Executes a pipeline template, once per request, on a fresh runtime graph.
///
/// All branches of one request run as futures polled by the caller's task;
/// there is no worker pool. Dropping the future returned by
/// [`Orchestrator::schedule`] drops every in-flight node call with it.
pub struct Orchestrator {
    template: Arc<OrchestrationGraph>,
    alignment: Vec<ResolvedAlignment>,
    stream_shaper: StreamShaper,
    handoff: HandoffPolicy,
}

impl Orchestrator {
    /// Freeze the template and bind every node to its shapers
    pub fn new(graph: OrchestrationGraph, table: &AlignmentTable) -> Self {
        let alignment = graph.nodes().map(|node| table.resolve(node)).collect();

        Self {
            template: Arc::new(graph),
            alignment,
            stream_shaper: table.stream(),
            handoff: HandoffPolicy::default(),
        }
    }

    pub fn with_handoff_policy(mut self, policy: HandoffPolicy) -> Self {
        self.handoff = policy;
        self
    }

    /// The read-only template every request is cloned from
    pub fn graph(&self) -> &OrchestrationGraph {
        &self.template
    }

    pub fn handoff_policy(&self) -> HandoffPolicy {
        self.handoff
    }

    /// Run one request to completion
    pub async fn schedule(&self, payload: Payload, params: Parameters) -> (ResultMap, RuntimeGraph) {
        let ctx = ExecutionContext::new(payload, params);
        self.run(&ctx).await
    }

    /// Run one request whose context was built by the caller (so the caller
    /// can publish handoff values while the graph executes)
    pub async fn run(&self, ctx: &ExecutionContext) -> (ResultMap, RuntimeGraph) {
        let mut graph = self.template.instantiate();
        let mut results = ResultMap::new();
        let mut started: HashSet<NodeId> = HashSet::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Step>> = FuturesUnordered::new();

        info!(
            "Scheduling request {} over {} nodes",
            ctx.request_id,
            self.template.len()
        );

        loop {
            for id in ready_nodes(&graph, &results, &started) {
                started.insert(id);
                match self.start(id, &graph, &results, ctx) {
                    Ok(fut) => in_flight.push(fut),
                    Err(err) => fail(&mut results, &graph.descriptor(id).name, err),
                }
            }

            let Some(step) = in_flight.next().await else {
                break;
            };
            self.complete(step, &mut graph, &mut results, ctx, &mut in_flight);
        }

        graph.seal();
        debug!(
            "Request {} finished: completed={:?}, failed={}",
            ctx.request_id,
            results.order(),
            results.failures().len()
        );

        (results, graph)
    }

    /// Apply the stream-shaper to a passthrough stream, chunk by chunk
    pub fn shape_stream(&self, handle: &mut StreamHandle) -> Result<ChunkStream, OrchestratorError> {
        let node = self.template.node(handle.node()).cloned().ok_or_else(|| {
            OrchestratorError::StreamMisuse(format!(
                "stream from node '{}' is not part of this pipeline",
                handle.node()
            ))
        })?;
        let shaper = self.stream_shaper;
        let stream = handle.take()?;

        Ok(Box::pin(stream.filter_map(move |chunk| {
            let shaped = match chunk {
                Ok(chunk) => shaper(&node, chunk).map(Ok),
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(shaped)
        })))
    }

    fn start(
        &self,
        id: NodeId,
        graph: &RuntimeGraph,
        results: &ResultMap,
        ctx: &ExecutionContext,
    ) -> Result<BoxFuture<'static, Step>, OrchestratorError> {
        let inputs = gather_inputs(id, graph, results, ctx)?;

        if let Some(key) = self.alignment[id.0].rendezvous.clone() {
            debug!("Node '{}' waiting for handoff '{}'", graph.descriptor(id).name, key);
            let handoffs = ctx.handoffs().clone();
            let policy = self.handoff;
            return Ok(async move {
                let value = handoffs.wait(&key, policy).await;
                Step::Gated {
                    id,
                    key,
                    inputs,
                    value,
                }
            }
            .boxed());
        }

        self.invoke(id, inputs, None, graph, ctx)
    }

    fn invoke(
        &self,
        id: NodeId,
        inputs: Payload,
        rendezvous: Option<&str>,
        graph: &RuntimeGraph,
        ctx: &ExecutionContext,
    ) -> Result<BoxFuture<'static, Step>, OrchestratorError> {
        let node = graph.descriptor(id).clone();
        let shape = InputShape {
            node: &node,
            graph,
            ctx,
            rendezvous,
        };
        let request = (self.alignment[id.0].shapers.input)(inputs.clone(), &shape)?;

        debug!("Invoking node '{}' ({}) at {}", node.name, node.capability, node.address);

        Ok(async move {
            let start = Instant::now();
            let output = node.invoke(request.clone()).await;
            debug!(
                "Node '{}' answered in {}ms",
                node.name,
                start.elapsed().as_millis()
            );
            Step::Invoked {
                id,
                inputs,
                request,
                output,
            }
        }
        .boxed())
    }

    fn complete(
        &self,
        step: Step,
        graph: &mut RuntimeGraph,
        results: &mut ResultMap,
        ctx: &ExecutionContext,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, Step>>,
    ) {
        let id = match &step {
            Step::Gated { id, .. } | Step::Invoked { id, .. } | Step::Drained { id, .. } => *id,
        };
        let name = graph.descriptor(id).name.clone();

        // Skipped by an output-shaper while it was running
        if !graph.is_live(id) {
            debug!("Discarding result of removed node '{}'", name);
            return;
        }

        match step {
            Step::Gated {
                key,
                mut inputs,
                value,
                ..
            } => match value {
                Ok(value) => {
                    inputs.insert(key.clone(), value);
                    match self.invoke(id, inputs, Some(&key), graph, ctx) {
                        Ok(fut) => in_flight.push(fut),
                        Err(err) => fail(results, &name, err),
                    }
                }
                Err(err) => fail(results, &name, err),
            },

            Step::Invoked {
                inputs,
                request,
                output,
                ..
            } => match output {
                Ok(NodeOutput::Data(raw)) => {
                    self.store(id, raw, &inputs, &request, graph, results, ctx)
                }
                Ok(NodeOutput::Stream(stream)) => {
                    let mut handle = StreamHandle::new(name.clone(), stream);
                    if graph.successor_ids(id).is_empty() {
                        // Terminal candidate: handed on untouched
                        results.insert(name, NodeResult::Stream(handle));
                    } else {
                        debug!("Draining stream of '{}' before continuing", name);
                        in_flight.push(
                            async move {
                                let text = handle.drain().await;
                                Step::Drained {
                                    id,
                                    inputs,
                                    request,
                                    text,
                                }
                            }
                            .boxed(),
                        );
                    }
                }
                Err(err) => fail(results, &name, err),
            },

            Step::Drained {
                inputs,
                request,
                text,
                ..
            } => match text {
                Ok(text) => {
                    self.store(id, Value::String(text), &inputs, &request, graph, results, ctx)
                }
                Err(err) => fail(results, &name, err),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        id: NodeId,
        raw: Value,
        inputs: &Payload,
        request: &Value,
        graph: &mut RuntimeGraph,
        results: &mut ResultMap,
        ctx: &ExecutionContext,
    ) {
        let node = graph.descriptor(id).clone();
        let mut shape = OutputShape {
            node: &node,
            graph,
            ctx,
            inputs,
            request,
        };

        match (self.alignment[id.0].shapers.output)(raw, &mut shape) {
            Ok(value) => {
                results.insert(node.name.clone(), NodeResult::Data(value));
            }
            Err(err) => fail(results, &node.name, err.into()),
        }
    }
}

// ============================================================================
// SBIO: Pure scheduling helpers (no I/O)
// ============================================================================

/// Live nodes not yet started whose current predecessors all have results.
/// Pure function - no I/O.
fn ready_nodes(graph: &RuntimeGraph, results: &ResultMap, started: &HashSet<NodeId>) -> Vec<NodeId> {
    graph
        .live_node_ids()
        .into_iter()
        .filter(|id| !started.contains(id))
        .filter(|id| {
            graph
                .predecessor_ids(*id)
                .iter()
                .all(|p| results.contains(&graph.descriptor(*p).name))
        })
        .collect()
}

/// Roots get the initial payload. Everyone else gets the union of its
/// predecessors' object outputs; a non-object output is keyed by the
/// predecessor's name.
fn gather_inputs(
    id: NodeId,
    graph: &RuntimeGraph,
    results: &ResultMap,
    ctx: &ExecutionContext,
) -> Result<Payload, OrchestratorError> {
    let preds = graph.predecessor_ids(id);
    if preds.is_empty() {
        return Ok(ctx.payload().clone());
    }

    let mut inputs = Payload::new();
    for pred in preds {
        let pred_name = &graph.descriptor(pred).name;
        match results.get(pred_name) {
            Some(NodeResult::Data(Value::Object(fields))) => {
                inputs.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(NodeResult::Data(other)) => {
                inputs.insert(pred_name.clone(), other.clone());
            }
            Some(NodeResult::Stream(_)) => {
                return Err(OrchestratorError::StreamMisuse(format!(
                    "node '{}' cannot read the passthrough stream of '{}'",
                    graph.descriptor(id).name,
                    pred_name
                )));
            }
            None => {}
        }
    }

    Ok(inputs)
}

fn fail(results: &mut ResultMap, node: &str, err: OrchestratorError) {
    warn!("Node '{}' failed, dependent branches abandoned: {}", node, err);
    results.record_failure(node, err);
}

// ============================================================================
// Sub-pipeline as a node
// ============================================================================

/// Lets a whole orchestrator sit inside another graph as a COMPOSITE node.
/// A `"parameters"` object in the request overrides the defaults; a
/// non-object request is passed on under `"input"`.
#[async_trait]
impl NodeService for Orchestrator {
    async fn invoke(&self, request: Value) -> Result<NodeOutput, ServiceError> {
        let (payload, params) = split_request(request)?;
        let (mut results, graph) = self.schedule(payload, params).await;

        let terminal = results
            .take_terminal(&graph, None)
            .map_err(|e| ServiceError::Pipeline(e.to_string()))?;

        match terminal {
            Terminal::Leaf {
                result: NodeResult::Data(value),
                ..
            } => Ok(NodeOutput::Data(value)),
            Terminal::Leaf {
                result: NodeResult::Stream(mut stream),
                ..
            }
            | Terminal::Passthrough { mut stream, .. } => stream
                .take()
                .map(NodeOutput::Stream)
                .map_err(|e| ServiceError::Pipeline(e.to_string())),
        }
    }
}

fn split_request(request: Value) -> Result<(Payload, Parameters), ServiceError> {
    match request {
        Value::Object(mut payload) => {
            let params = match payload.remove("parameters") {
                Some(raw) => {
                    serde_json::from_value(raw).map_err(|e| ServiceError::Parse(e.to_string()))?
                }
                None => Parameters::default(),
            };
            Ok((payload, params))
        }
        other => {
            let mut payload = Payload::new();
            payload.insert("input".to_string(), other);
            Ok((payload, Parameters::default()))
        }
    }
}
