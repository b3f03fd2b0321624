use std::convert::Infallible;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::ChunkStream;
use crate::gateway::audio::{project_audio, AudioQnaRequest};
use crate::gateway::chat::{
    completion_chunk, final_chunk, project_completion, ChatCompletionRequest,
};
use crate::gateway::{GatewayError, GatewayOutput};
use crate::pipelines::PipelineKind;
use crate::runtime::{OrchestratorError, Parameters, StreamHandle};
use crate::server::state::{AppState, RequestGuard};

const REQUEST_ID_HEADER: &str = "x-request-id";

// ============================================================================
// Error mapping
// ============================================================================

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout(_) | GatewayError::Orchestrator(OrchestratorError::HandoffTimeout { .. }) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::Orchestrator(OrchestratorError::NodeInvocation { .. }) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": state.megaservice.name,
    }))
}

#[derive(Serialize)]
struct PipelineStatus {
    megaservice: String,
    kind: String,
    nodes: usize,
    active_requests: usize,
}

/// Pipeline status endpoint
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(PipelineStatus {
        megaservice: state.megaservice.name.clone(),
        kind: state.megaservice.kind.to_string(),
        nodes: state.gateway.orchestrator().graph().len(),
        active_requests: state.active_request_count(),
    })
}

#[derive(Serialize)]
struct ServiceInfo {
    name: String,
    capability: String,
    role: crate::graph::NodeRole,
    endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_type: Option<String>,
    downstream: Vec<String>,
    auxiliary: bool,
}

/// Every node of the pipeline with its capability and endpoint
pub async fn list_service(State(state): State<AppState>) -> impl IntoResponse {
    let graph = state.gateway.orchestrator().graph();

    let mut services: Vec<ServiceInfo> = graph
        .nodes()
        .map(|n| ServiceInfo {
            name: n.name.clone(),
            capability: n.capability.to_string(),
            role: n.role,
            endpoint: n.address.to_string(),
            input_type: n.input_type.clone(),
            output_type: n.output_type.clone(),
            downstream: graph.downstream(&n.name).iter().map(|d| d.name.clone()).collect(),
            auxiliary: false,
        })
        .collect();

    services.extend(state.gateway.auxiliary().map(|n| ServiceInfo {
        name: n.name.clone(),
        capability: n.capability.to_string(),
        role: n.role,
        endpoint: n.address.to_string(),
        input_type: n.input_type.clone(),
        output_type: n.output_type.clone(),
        downstream: Vec::new(),
        auxiliary: true,
    }));

    Json(services)
}

/// Defaults applied to every optional request field
pub async fn list_parameters(State(state): State<AppState>) -> impl IntoResponse {
    let defaults = Parameters::default();
    let handoff = state.gateway.orchestrator().handoff_policy();

    Json(json!({
        "llm": defaults.llm,
        "retriever": defaults.retriever,
        "reranker": defaults.reranker,
        "handoff": {
            "timeout_ms": handoff.timeout.as_millis() as u64,
            "poll_interval_ms": handoff.poll_interval.as_millis() as u64,
        },
        "timeout_secs": state.gateway.timeout().as_secs(),
    }))
}

/// Chat completions endpoint (OpenAI-compatible), JSON or SSE
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let request_id = request_id(&headers);
    let guard = state.register_request(request_id, "/v1/chat/completions");
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.megaservice.name.clone());
    let completion_id = format!("chatcmpl-{}", request_id);

    let (payload, params) = match request.into_parts() {
        Ok(parts) => parts,
        Err(e) => return with_request_id(e.into_response(), request_id),
    };
    let prompt = payload
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    info!("Chat request {} ({} words)", request_id, prompt.split_whitespace().count());

    let response = match state.gateway.execute(payload, params).await {
        Ok(GatewayOutput::Stream { node, stream }) => {
            debug!("Streaming '{}' to request {}", node, request_id);
            chat_event_stream(completion_id, model, stream, guard).into_response()
        }
        Ok(GatewayOutput::Data { node, value }) => {
            match project_completion(&completion_id, &model, &prompt, &node, &value) {
                Ok(completion) => Json(completion).into_response(),
                Err(e) => e.into_response(),
            }
        }
        Err(e) => {
            warn!("Chat request {} failed: {}", request_id, e);
            e.into_response()
        }
    };

    with_request_id(response, request_id)
}

/// Spoken question in, base64 spoken answer out
pub async fn audioqna(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AudioQnaRequest>,
) -> Response {
    let request_id = request_id(&headers);
    let _guard = state.register_request(request_id, "/v1/audioqna");

    let (payload, params) = match request.into_parts() {
        Ok(parts) => parts,
        Err(e) => return with_request_id(e.into_response(), request_id),
    };

    let projected = match state.gateway.execute(payload, params).await {
        Ok(GatewayOutput::Data { node, value }) => project_audio(&node, &value),
        Ok(GatewayOutput::Stream { node, stream }) => StreamHandle::new(node, stream)
            .drain()
            .await
            .map_err(GatewayError::from),
        Err(e) => Err(e),
    };

    let response = match projected {
        Ok(audio) => Json(Value::String(audio)).into_response(),
        Err(e) => {
            warn!("Audio request {} failed: {}", request_id, e);
            e.into_response()
        }
    };

    with_request_id(response, request_id)
}

// ============================================================================
// Helpers
// ============================================================================

/// Extract request ID from headers or generate new one
fn request_id(headers: &HeaderMap) -> Uuid {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn with_request_id(mut response: Response, request_id: Uuid) -> Response {
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Re-encode shaped text chunks as `chat.completion.chunk` events, then a
/// closing chunk and `[DONE]`
fn chat_event_stream(
    id: String,
    model: String,
    stream: ChunkStream,
    guard: RequestGuard,
) -> Sse<KeepAliveStream<BoxStream<'static, Result<Event, Infallible>>>> {
    let (chunk_id, chunk_model) = (id.clone(), model.clone());

    let body = stream.map(move |chunk| match chunk {
        Ok(text) => Event::default().data(completion_chunk(&chunk_id, &chunk_model, &text).to_string()),
        Err(e) => {
            warn!("Upstream stream failed mid-response: {}", e);
            Event::default().data(json!({"error": {"message": e.to_string()}}).to_string())
        }
    });

    let tail = stream::once(async move {
        // Listed as active until the stream is done or dropped
        drop(guard);
        Event::default().data(final_chunk(&id, &model).to_string())
    })
    .chain(stream::once(async { Event::default().data("[DONE]") }));

    let events = body.chain(tail).map(Ok::<Event, Infallible>).boxed();
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Create the Axum router. Only the endpoints of the served pipeline kind
/// are mounted.
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/v1/health_check", get(health_check))
        .route("/status", get(status))
        .route("/v1/list_service", get(list_service))
        .route("/v1/list_parameters", get(list_parameters));

    let router = match state.megaservice.kind {
        PipelineKind::ChatQna => router
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/chatqna", post(chat_completions)),
        PipelineKind::AudioQna => router.route("/v1/audioqna", post(audioqna)),
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
