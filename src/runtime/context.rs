use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::runtime::OrchestratorError;

/// Generic keyed payload flowing between nodes
pub type Payload = Map<String, Value>;

/// Documented defaults for every optional request parameter
pub mod defaults {
    pub const MAX_TOKENS: u32 = 1024;
    pub const TOP_K: u32 = 10;
    pub const TOP_P: f32 = 0.95;
    pub const TEMPERATURE: f32 = 0.01;
    pub const FREQUENCY_PENALTY: f32 = 0.0;
    pub const PRESENCE_PENALTY: f32 = 0.0;
    pub const REPETITION_PENALTY: f32 = 1.03;
    pub const STREAMING: bool = true;

    pub const SEARCH_TYPE: &str = "similarity";
    pub const RETRIEVE_K: u32 = 4;
    pub const FETCH_K: u32 = 20;
    pub const LAMBDA_MULT: f32 = 0.5;
    pub const SCORE_THRESHOLD: f32 = 0.2;

    pub const RERANK_TOP_N: u32 = 1;

    pub const HANDOFF_TIMEOUT_MS: u64 = 10_000;
    pub const HANDOFF_POLL_MS: u64 = 100;
}

fn default_max_tokens() -> u32 {
    defaults::MAX_TOKENS
}
fn default_top_k() -> u32 {
    defaults::TOP_K
}
fn default_top_p() -> f32 {
    defaults::TOP_P
}
fn default_temperature() -> f32 {
    defaults::TEMPERATURE
}
fn default_frequency_penalty() -> f32 {
    defaults::FREQUENCY_PENALTY
}
fn default_presence_penalty() -> f32 {
    defaults::PRESENCE_PENALTY
}
fn default_repetition_penalty() -> f32 {
    defaults::REPETITION_PENALTY
}
fn default_streaming() -> bool {
    defaults::STREAMING
}
fn default_search_type() -> String {
    defaults::SEARCH_TYPE.to_string()
}
fn default_retrieve_k() -> u32 {
    defaults::RETRIEVE_K
}
fn default_fetch_k() -> u32 {
    defaults::FETCH_K
}
fn default_lambda_mult() -> f32 {
    defaults::LAMBDA_MULT
}
fn default_score_threshold() -> f32 {
    defaults::SCORE_THRESHOLD
}
fn default_top_n() -> u32 {
    defaults::RERANK_TOP_N
}

/// Sampling and generation parameters for LLM nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmParams {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f32,
    #[serde(default = "default_presence_penalty")]
    pub presence_penalty: f32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            max_tokens: defaults::MAX_TOKENS,
            top_k: defaults::TOP_K,
            top_p: defaults::TOP_P,
            temperature: defaults::TEMPERATURE,
            frequency_penalty: defaults::FREQUENCY_PENALTY,
            presence_penalty: defaults::PRESENCE_PENALTY,
            repetition_penalty: defaults::REPETITION_PENALTY,
            streaming: defaults::STREAMING,
            model: None,
            chat_template: None,
        }
    }
}

/// Vector search parameters for retriever nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieverParams {
    #[serde(default = "default_search_type")]
    pub search_type: String,
    #[serde(default = "default_retrieve_k")]
    pub k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_threshold: Option<f32>,
    #[serde(default = "default_fetch_k")]
    pub fetch_k: u32,
    #[serde(default = "default_lambda_mult")]
    pub lambda_mult: f32,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

impl Default for RetrieverParams {
    fn default() -> Self {
        Self {
            search_type: defaults::SEARCH_TYPE.to_string(),
            k: defaults::RETRIEVE_K,
            distance_threshold: None,
            fetch_k: defaults::FETCH_K,
            lambda_mult: defaults::LAMBDA_MULT,
            score_threshold: defaults::SCORE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankerParams {
    #[serde(default = "default_top_n")]
    pub top_n: u32,
}

impl Default for RerankerParams {
    fn default() -> Self {
        Self {
            top_n: defaults::RERANK_TOP_N,
        }
    }
}

/// Global parameters shared by every node of one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default)]
    pub llm: LlmParams,
    #[serde(default)]
    pub retriever: RetrieverParams,
    #[serde(default)]
    pub reranker: RerankerParams,
    /// Pipeline-specific extras
    #[serde(default)]
    pub extras: Payload,
}

impl Parameters {
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extras.get(key).and_then(Value::as_str)
    }
}

// ============================================================================
// Request-scoped handoff between concurrent tasks
// ============================================================================

/// How long a node may wait for a handoff value, and how often it looks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandoffPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HandoffPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(defaults::HANDOFF_TIMEOUT_MS),
            poll_interval: Duration::from_millis(defaults::HANDOFF_POLL_MS),
        }
    }
}

/// Single-value slots owned by one request. Clones share the same slots, so
/// an auxiliary task can publish while the scheduler waits.
#[derive(Debug, Clone, Default)]
pub struct Handoffs {
    slots: Arc<Mutex<HashMap<String, Value>>>,
}

impl Handoffs {
    pub fn publish(&self, key: impl Into<String>, value: Value) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(key).cloned()
    }

    /// Poll for `key` until it appears or the policy's timeout elapses
    pub async fn wait(&self, key: &str, policy: HandoffPolicy) -> Result<Value, OrchestratorError> {
        let start = Instant::now();

        loop {
            if let Some(value) = self.get(key) {
                debug!("Handoff '{}' resolved after {}ms", key, start.elapsed().as_millis());
                return Ok(value);
            }

            let waited = start.elapsed();
            if waited >= policy.timeout {
                return Err(OrchestratorError::HandoffTimeout {
                    key: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            tokio::time::sleep(policy.poll_interval.min(policy.timeout - waited)).await;
        }
    }
}

// ============================================================================
// Per-request execution context
// ============================================================================

/// Everything one request carries through the scheduler besides the graph
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    payload: Payload,
    params: Parameters,
    handoffs: Handoffs,
}

impl ExecutionContext {
    pub fn new(payload: Payload, params: Parameters) -> Self {
        Self::with_id(Uuid::new_v4(), payload, params)
    }

    /// Create a context with a specific ID (useful for tracing and tests)
    pub fn with_id(request_id: Uuid, payload: Payload, params: Parameters) -> Self {
        Self {
            request_id,
            started_at: chrono::Utc::now(),
            payload,
            params,
            handoffs: Handoffs::default(),
        }
    }

    /// The initial payload the gateway decoded
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn handoffs(&self) -> &Handoffs {
        &self.handoffs
    }
}
