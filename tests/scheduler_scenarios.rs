//! End-to-end scheduling scenarios over in-process nodes
//!
//! Every node here is a `LocalService`, so these tests exercise the
//! scheduler, alignment and gateway without any network.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Map, Value};

use megaservice::client::{LocalService, NodeOutput, ServiceError};
use megaservice::gateway::{Gateway, GatewayError, GatewayOutput};
use megaservice::graph::{Capability, NodeDescriptor, OrchestrationGraph};
use megaservice::pipelines::{alignment_for, chatqna, NodeAlignment, PipelineKind};
use megaservice::runtime::alignment::passthrough_inputs;
use megaservice::runtime::{
    AlignmentError, AlignmentTable, HandoffPolicy, OrchestratorError, OutputShape, Orchestrator,
    Parameters, Payload, ShaperPair,
};

type Calls = Arc<Mutex<Vec<Value>>>;

fn payload(text: &str) -> Payload {
    let mut map = Map::new();
    map.insert("text".to_string(), Value::String(text.to_string()));
    map
}

/// Node answering with `f(request)` and recording every request
fn recording<F>(calls: &Calls, f: F) -> LocalService
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    let calls = calls.clone();
    LocalService::from_fn(move |request| {
        let response = f(&request);
        calls.lock().unwrap().push(request);
        response
    })
}

fn streaming(chunks: &[&str]) -> LocalService {
    let chunks: Vec<String> = chunks.iter().map(|c| c.to_string()).collect();
    LocalService::new(move |_| {
        let items: Vec<Result<String, ServiceError>> = chunks.clone().into_iter().map(Ok).collect();
        async move { Ok(NodeOutput::Stream(futures::stream::iter(items).boxed())) }
    })
}

fn embedding() -> LocalService {
    LocalService::from_fn(|_| json!({"data": [{"embedding": [0.1, 0.2, 0.3]}]}))
}

fn completion(text: &str) -> Value {
    json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
}

fn chain(nodes: Vec<NodeDescriptor>) -> OrchestrationGraph {
    let mut graph = OrchestrationGraph::new();
    let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
    for node in nodes {
        graph.add(node).unwrap();
    }
    for pair in names.windows(2) {
        graph.flow_to(&pair[0], &pair[1]).unwrap();
    }
    graph
}

#[tokio::test]
async fn test_linear_embedding_to_retriever() {
    let retriever_calls: Calls = Arc::default();
    let graph = chain(vec![
        NodeDescriptor::local("embedding", Capability::Embedding, embedding()),
        NodeDescriptor::local(
            "retriever",
            Capability::Retriever,
            recording(&retriever_calls, |_| json!({"retrieved_docs": [{"text": "doc one"}]})),
        ),
    ]);
    let orch = Orchestrator::new(graph, &chatqna::alignment());

    let (results, graph) = orch.schedule(payload("hello"), Parameters::default()).await;

    let request = retriever_calls.lock().unwrap()[0].clone();
    assert_eq!(request["text"], "hello");
    assert_eq!(request["embedding"], json!([0.1, 0.2, 0.3]));
    assert_eq!(request["k"], 4);

    let leaves: Vec<&str> = graph.all_leaves().iter().map(|n| n.name.as_str()).collect();
    assert_eq!(leaves, vec!["retriever"]);
    assert_eq!(
        results.data("retriever"),
        Some(&json!({"text": "hello", "retrieved_docs": ["doc one"]}))
    );
}

#[tokio::test]
async fn test_empty_retrieval_collapses_rerank() {
    let rerank_calls: Calls = Arc::default();
    let llm_calls: Calls = Arc::default();
    let graph = chain(vec![
        NodeDescriptor::local("embedding", Capability::Embedding, embedding()),
        NodeDescriptor::local(
            "retriever",
            Capability::Retriever,
            LocalService::from_fn(|_| json!({"retrieved_docs": []})),
        ),
        NodeDescriptor::local(
            "rerank",
            Capability::Rerank,
            recording(&rerank_calls, |_| json!([])),
        ),
        NodeDescriptor::local(
            "llm",
            Capability::Llm,
            recording(&llm_calls, |_| completion("I don't know")),
        ),
    ]);
    let orch = Orchestrator::new(graph, &chatqna::alignment());

    let (results, graph) = orch.schedule(payload("what is up?"), Parameters::default()).await;

    assert!(rerank_calls.lock().unwrap().is_empty());
    assert!(!graph.contains("rerank"));
    assert_eq!(graph.all_leaves()[0].name, "llm");
    assert_eq!(graph.predecessors("llm")[0].name, "retriever");

    // Without documents the question goes to the model as-is
    let request = llm_calls.lock().unwrap()[0].clone();
    assert_eq!(request["messages"][0]["content"], "what is up?");
    assert_eq!(results.data("llm").unwrap()["text"], "I don't know");

    // The template is untouched
    assert!(orch.graph().node("rerank").is_some());
}

#[tokio::test]
async fn test_terminal_stream_passes_through_unshaped() {
    fn exploding_output(_raw: Value, _cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
        panic!("a passthrough stream must never reach an output shaper");
    }

    let table = AlignmentTable::new().on_capability(
        Capability::Llm,
        ShaperPair::new(passthrough_inputs, exploding_output),
    );
    let graph = chain(vec![NodeDescriptor::local(
        "llm",
        Capability::Llm,
        streaming(&["Hel", "lo", "!"]),
    )]);
    let gateway = Gateway::new(Arc::new(Orchestrator::new(graph, &table)), Capability::Llm);

    let output = gateway.execute(payload("hi"), Parameters::default()).await.unwrap();
    let (node, stream) = match output {
        GatewayOutput::Stream { node, stream } => (node, stream),
        other => panic!("expected a stream, got {other:?}"),
    };
    assert_eq!(node, "llm");

    let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
    assert_eq!(chunks, vec!["Hel", "lo", "!"]);
}

#[tokio::test]
async fn test_grader_stream_is_drained_before_downstream_runs() {
    let llm_calls: Calls = Arc::default();
    let graph = chain(vec![
        NodeDescriptor::local("embedding", Capability::Embedding, embedding()),
        NodeDescriptor::local(
            "retriever",
            Capability::Retriever,
            LocalService::from_fn(|_| json!({"retrieved_docs": ["the moon is cheese"]})),
        ),
        NodeDescriptor::local(
            "grader",
            Capability::Llm,
            streaming(&[
                r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
                r#"{"choices":[{"delta":{"content":"No"}}]}"#,
                r#"{"choices":[{"delta":{"content":", irrelevant."}}]}"#,
            ]),
        ),
        NodeDescriptor::local(
            "llm",
            Capability::Llm,
            recording(&llm_calls, |_| completion("Paris")),
        ),
    ]);
    let table = alignment_for(
        PipelineKind::ChatQna,
        [NodeAlignment {
            node: "grader",
            profile: Some("grader"),
            rendezvous: None,
        }],
    )
    .unwrap();
    let orch = Orchestrator::new(graph, &table);

    let (results, _) = orch
        .schedule(payload("capital of France?"), Parameters::default())
        .await;

    let grader = results.data("grader").unwrap();
    assert_eq!(grader["relevant"], false);
    assert_eq!(grader["retrieved_docs"], json!([]));

    // The irrelevant document never reached the answer prompt
    let request = llm_calls.lock().unwrap()[0].clone();
    assert_eq!(request["messages"][0]["content"], "capital of France?");

    let order = results.order();
    let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
    assert!(pos("grader") < pos("llm"));
}

#[tokio::test]
async fn test_concurrent_requests_mutate_their_own_graphs() {
    let rerank_calls: Calls = Arc::default();
    let graph = chain(vec![
        NodeDescriptor::local("embedding", Capability::Embedding, embedding()),
        NodeDescriptor::local(
            "retriever",
            Capability::Retriever,
            LocalService::from_fn(|request| {
                if request["text"] == "nothing" {
                    json!({"retrieved_docs": []})
                } else {
                    json!({"retrieved_docs": ["doc a", "doc b"]})
                }
            }),
        ),
        NodeDescriptor::local(
            "rerank",
            Capability::Rerank,
            recording(&rerank_calls, |_| {
                json!([{"index": 1, "score": 0.9}, {"index": 0, "score": 0.1}])
            }),
        ),
        NodeDescriptor::local(
            "llm",
            Capability::Llm,
            LocalService::from_fn(|_| completion("ok")),
        ),
    ]);
    let orch = Arc::new(Orchestrator::new(graph, &chatqna::alignment()));

    let (empty, full) = tokio::join!(
        orch.schedule(payload("nothing"), Parameters::default()),
        orch.schedule(payload("something"), Parameters::default()),
    );

    assert!(!empty.1.contains("rerank"));
    assert!(full.1.contains("rerank"));
    assert_eq!(rerank_calls.lock().unwrap().len(), 1);
    assert_eq!(
        full.0.data("rerank").unwrap()["retrieved_docs"],
        json!(["doc b"])
    );
    assert_eq!(orch.graph().len(), 4);
}

#[tokio::test]
async fn test_independent_branches_run_concurrently() {
    fn slow(branch: &'static str) -> LocalService {
        LocalService::new(move |_| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let mut out = Map::new();
            out.insert(branch.to_string(), Value::Bool(true));
            Ok(NodeOutput::Data(Value::Object(out)))
        })
    }

    let mut graph = OrchestrationGraph::new();
    graph
        .add(NodeDescriptor::local("left", Capability::Other("A".into()), slow("left")))
        .unwrap();
    graph
        .add(NodeDescriptor::local("right", Capability::Other("A".into()), slow("right")))
        .unwrap();
    graph
        .add(NodeDescriptor::local(
            "join",
            Capability::Other("B".into()),
            LocalService::from_fn(|request| request),
        ))
        .unwrap();
    graph.flow_to("left", "join").unwrap();
    graph.flow_to("right", "join").unwrap();
    let orch = Orchestrator::new(graph, &AlignmentTable::new());

    let start = Instant::now();
    let (results, _) = orch.schedule(payload("go"), Parameters::default()).await;

    assert!(start.elapsed() < Duration::from_millis(290));
    let joined = results.data("join").unwrap();
    assert_eq!(joined["left"], true);
    assert_eq!(joined["right"], true);
}

#[tokio::test]
async fn test_failed_branch_spares_independent_branch() {
    let mut graph = OrchestrationGraph::new();
    graph
        .add(NodeDescriptor::local(
            "broken",
            Capability::Other("A".into()),
            LocalService::new(|_| async { Err(ServiceError::Http("connection refused".into())) }),
        ))
        .unwrap();
    graph
        .add(NodeDescriptor::local(
            "after_broken",
            Capability::Other("A".into()),
            LocalService::from_fn(|r| r),
        ))
        .unwrap();
    graph
        .add(NodeDescriptor::local(
            "healthy",
            Capability::Other("A".into()),
            LocalService::from_fn(|_| json!({"fine": true})),
        ))
        .unwrap();
    graph.flow_to("broken", "after_broken").unwrap();
    let orch = Orchestrator::new(graph, &AlignmentTable::new());

    let (results, _) = orch.schedule(payload("x"), Parameters::default()).await;

    assert!(results.is_failed("broken"));
    assert!(!results.contains("after_broken"));
    assert_eq!(results.data("healthy"), Some(&json!({"fine": true})));
}

#[tokio::test]
async fn test_auxiliary_handoff_joins_rerank_candidates() {
    let rerank_calls: Calls = Arc::default();
    let graph = chain(vec![
        NodeDescriptor::local("embedding", Capability::Embedding, embedding()),
        NodeDescriptor::local(
            "retriever",
            Capability::Retriever,
            LocalService::from_fn(|_| json!({"retrieved_docs": ["vector hit"]})),
        ),
        NodeDescriptor::local(
            "rerank",
            Capability::Rerank,
            recording(&rerank_calls, |_| {
                json!([{"index": 1, "score": 0.8}, {"index": 0, "score": 0.2}])
            }),
        ),
        NodeDescriptor::local(
            "llm",
            Capability::Llm,
            LocalService::from_fn(|_| completion("42 rows")),
        ),
    ]);
    let table = alignment_for(
        PipelineKind::ChatQna,
        [NodeAlignment {
            node: "rerank",
            profile: None,
            rendezvous: Some("sql"),
        }],
    )
    .unwrap();
    let policy = HandoffPolicy {
        timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
    };
    let orch = Orchestrator::new(graph, &table).with_handoff_policy(policy);

    let sql = NodeDescriptor::local(
        "sql",
        Capability::Text2Query,
        LocalService::new(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(NodeOutput::Data(json!("SELECT count(*) -> 42")))
        }),
    );
    let gateway = Gateway::new(Arc::new(orch), Capability::Llm).with_auxiliary(sql);

    let output = gateway
        .execute(payload("how many rows?"), Parameters::default())
        .await
        .unwrap();
    let value = match output {
        GatewayOutput::Data { value, .. } => value,
        other => panic!("expected data, got {other:?}"),
    };
    assert_eq!(value["text"], "42 rows");

    let request = rerank_calls.lock().unwrap()[0].clone();
    assert_eq!(request["texts"], json!(["vector hit", "SELECT count(*) -> 42"]));
}

#[tokio::test]
async fn test_missing_handoff_fails_request() {
    let graph = chain(vec![NodeDescriptor::local(
        "llm",
        Capability::Llm,
        LocalService::from_fn(|_| completion("never")),
    )]);
    let table = AlignmentTable::new().rendezvous("llm", "sql");
    let policy = HandoffPolicy {
        timeout: Duration::from_millis(60),
        poll_interval: Duration::from_millis(10),
    };
    let orch = Orchestrator::new(graph, &table).with_handoff_policy(policy);

    let broken_sql = NodeDescriptor::local(
        "sql",
        Capability::Text2Query,
        LocalService::new(|_| async { Err(ServiceError::Http("db down".into())) }),
    );
    let gateway = Gateway::new(Arc::new(orch), Capability::Llm).with_auxiliary(broken_sql);

    let err = gateway
        .execute(payload("q"), Parameters::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Orchestrator(OrchestratorError::HandoffTimeout { ref key, .. }) if key == "sql"
    ));
}
