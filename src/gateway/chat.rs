use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::gateway::GatewayError;
use crate::runtime::context::{defaults, LlmParams, Parameters, Payload, RerankerParams, RetrieverParams};

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text parts joined by a space; image and other parts are skipped
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// `messages` may be a bare prompt or a chat history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChatMessages {
    Prompt(String),
    History(Vec<ChatMessage>),
}

/// OpenAI-style chat request. Retriever and reranker knobs are accepted
/// flat next to the sampling parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: ChatMessages,

    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub chat_template: Option<String>,

    #[serde(default)]
    pub search_type: Option<String>,
    #[serde(default)]
    pub k: Option<u32>,
    #[serde(default)]
    pub distance_threshold: Option<f32>,
    #[serde(default)]
    pub fetch_k: Option<u32>,
    #[serde(default)]
    pub lambda_mult: Option<f32>,
    #[serde(default)]
    pub score_threshold: Option<f32>,

    #[serde(default)]
    pub top_n: Option<u32>,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(defaults::STREAMING)
    }

    /// Split into the initial payload (`{"text": prompt}`) and parameters,
    /// filling every absent field with its default
    pub fn into_parts(self) -> Result<(Payload, Parameters), GatewayError> {
        let prompt = flatten_messages(&self.messages);
        if prompt.trim().is_empty() {
            return Err(GatewayError::BadRequest("messages carry no text".to_string()));
        }

        let llm = LlmParams {
            max_tokens: self.max_tokens.unwrap_or(defaults::MAX_TOKENS),
            top_k: self.top_k.unwrap_or(defaults::TOP_K),
            top_p: self.top_p.unwrap_or(defaults::TOP_P),
            temperature: self.temperature.unwrap_or(defaults::TEMPERATURE),
            frequency_penalty: self.frequency_penalty.unwrap_or(defaults::FREQUENCY_PENALTY),
            presence_penalty: self.presence_penalty.unwrap_or(defaults::PRESENCE_PENALTY),
            repetition_penalty: self.repetition_penalty.unwrap_or(defaults::REPETITION_PENALTY),
            streaming: self.stream.unwrap_or(defaults::STREAMING),
            model: self.model,
            chat_template: self.chat_template,
        };

        let retriever = RetrieverParams {
            search_type: self
                .search_type
                .unwrap_or_else(|| defaults::SEARCH_TYPE.to_string()),
            k: self.k.unwrap_or(defaults::RETRIEVE_K),
            distance_threshold: self.distance_threshold,
            fetch_k: self.fetch_k.unwrap_or(defaults::FETCH_K),
            lambda_mult: self.lambda_mult.unwrap_or(defaults::LAMBDA_MULT),
            score_threshold: self.score_threshold.unwrap_or(defaults::SCORE_THRESHOLD),
        };

        let reranker = RerankerParams {
            top_n: self.top_n.unwrap_or(defaults::RERANK_TOP_N),
        };

        let mut payload = Payload::new();
        payload.insert("text".to_string(), Value::String(prompt));

        Ok((
            payload,
            Parameters {
                llm,
                retriever,
                reranker,
                extras: Payload::new(),
            },
        ))
    }
}

/// Turn a chat history into one prompt.
///
/// A lone user message is used as is. Otherwise system messages come first,
/// followed by one `role: content` line per remaining message.
/// Pure function - no I/O.
pub fn flatten_messages(messages: &ChatMessages) -> String {
    let history = match messages {
        ChatMessages::Prompt(p) => return p.clone(),
        ChatMessages::History(h) => h,
    };

    if let [only] = history.as_slice() {
        if only.role == "user" {
            return only.content.text();
        }
    }

    let mut prompt = String::new();
    for msg in history.iter().filter(|m| m.role == "system") {
        prompt.push_str(&msg.content.text());
        prompt.push('\n');
    }
    for msg in history.iter().filter(|m| m.role != "system") {
        let text = msg.content.text();
        if text.is_empty() {
            prompt.push_str(&format!("{}:\n", msg.role));
        } else {
            prompt.push_str(&format!("{}: {}\n", msg.role, text));
        }
    }
    prompt
}

// ============================================================================
// Response projection
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Whitespace-token estimate for backends that report nothing
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = count_words(prompt) as u32;
        let completion_tokens = count_words(completion) as u32;
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

/// `chat.completion` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
    pub usage: Usage,
}

/// Text and upstream usage carried by a terminal payload.
///
/// Accepts a bare string, `{"text": ..}` (optionally with `usage`), or a
/// full OpenAI completion.
pub fn extract_completion(node: &str, value: &Value) -> Result<(String, Option<Usage>), GatewayError> {
    let usage = value
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

    let text = match value {
        Value::String(s) => Some(s.clone()),
        _ => value
            .get("text")
            .or_else(|| value.pointer("/choices/0/message/content"))
            .or_else(|| value.pointer("/choices/0/text"))
            .or_else(|| value.get("generated_text"))
            .and_then(Value::as_str)
            .map(String::from),
    };

    text.map(|t| (t, usage)).ok_or_else(|| GatewayError::Projection {
        node: node.to_string(),
        reason: "no generated text in result".to_string(),
    })
}

/// Wrap the terminal node's result into a chat completion
pub fn project_completion(
    id: &str,
    model: &str,
    prompt: &str,
    node: &str,
    value: &Value,
) -> Result<ChatCompletionResponse, GatewayError> {
    let (text, usage) = extract_completion(node, value)?;
    let usage = usage.unwrap_or_else(|| Usage::estimate(prompt, &text));

    Ok(ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ResponseChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: text,
            },
            finish_reason: "stop".to_string(),
        }],
        usage,
    })
}

/// One `chat.completion.chunk` event carrying `text`
pub fn completion_chunk(id: &str, model: &str, text: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {"content": text},
            "finish_reason": null
        }]
    })
}

/// Closing chunk with an empty delta and `finish_reason: "stop"`
pub fn final_chunk(id: &str, model: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": "stop"
        }]
    })
}

fn count_words(s: &str) -> usize {
    s.split_whitespace().count()
}
