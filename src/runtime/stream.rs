use futures::StreamExt;
use serde_json::Value;

use crate::client::ChunkStream;
use crate::runtime::OrchestratorError;

// ============================================================================
// SBIO: Pure chunk decoding
// ============================================================================

/// Extract the generated text carried by one stream chunk.
///
/// Understands OpenAI-style deltas and completions, TGI token events, plain
/// `{"text": ..}` objects, TTS audio chunks, JSON strings, and the `b'..'`
/// byte-literal framing some python backends emit. An OpenAI chunk without
/// content (a role-only or closing delta) carries no text; anything else is
/// returned verbatim.
/// Pure function - no I/O.
pub fn chunk_text(chunk: &str) -> String {
    let trimmed = chunk.trim();

    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        return match json {
            Value::String(s) => s,
            Value::Object(ref fields) => match json_text(&json) {
                Some(text) => text,
                None if fields.contains_key("choices") => String::new(),
                None => chunk.to_string(),
            },
            // Bare numbers and literals are plain tokens
            _ => chunk.to_string(),
        };
    }

    if let Some(inner) = trimmed
        .strip_prefix("b'")
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| trimmed.strip_prefix("b\"").and_then(|s| s.strip_suffix('"')))
    {
        return inner.replace("\\n", "\n");
    }

    chunk.to_string()
}

fn json_text(json: &Value) -> Option<String> {
    let choice = json.get("choices").and_then(|c| c.get(0));

    let candidates = [
        choice.and_then(|c| c.pointer("/delta/content")),
        choice.and_then(|c| c.get("text")),
        choice.and_then(|c| c.pointer("/message/content")),
        json.pointer("/token/text"),
        json.get("text"),
        json.get("generated_text"),
        json.get("byte_str"),
        json.get("tts_result"),
        json.get("audio"),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(String::from))
}

// ============================================================================
// Consume-once stream handle
// ============================================================================

/// Live stream produced by a node. It can be read exactly once, either by
/// draining it inside the orchestrator or by handing it to the caller.
pub struct StreamHandle {
    node: String,
    inner: Option<ChunkStream>,
}

impl StreamHandle {
    pub fn new(node: impl Into<String>, stream: ChunkStream) -> Self {
        Self {
            node: node.into(),
            inner: Some(stream),
        }
    }

    /// Name of the node that produced the stream
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.is_none()
    }

    /// Take the raw stream for passthrough
    pub fn take(&mut self) -> Result<ChunkStream, OrchestratorError> {
        self.inner.take().ok_or_else(|| {
            OrchestratorError::StreamMisuse(format!(
                "stream from node '{}' was already consumed",
                self.node
            ))
        })
    }

    /// Read the whole stream and concatenate the text of every chunk
    pub async fn drain(&mut self) -> Result<String, OrchestratorError> {
        let mut stream = self.take()?;
        let mut text = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|cause| OrchestratorError::NodeInvocation {
                node: self.node.clone(),
                cause,
            })?;
            text.push_str(&chunk_text(&chunk));
        }

        Ok(text)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("node", &self.node)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ServiceError;

    fn handle(chunks: Vec<&str>) -> StreamHandle {
        let items: Vec<Result<String, ServiceError>> =
            chunks.into_iter().map(|c| Ok(c.to_string())).collect();
        StreamHandle::new("llm", Box::pin(futures::stream::iter(items)))
    }

    #[test]
    fn test_chunk_text_openai_delta() {
        let chunk = r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(chunk_text(chunk), "Hel");
    }

    #[test]
    fn test_chunk_text_role_only_delta_is_empty() {
        let chunk = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(chunk_text(chunk), "");
    }

    #[test]
    fn test_chunk_text_tgi_and_plain() {
        assert_eq!(chunk_text(r#"{"token":{"id":1,"text":" world"}}"#), " world");
        assert_eq!(chunk_text(r#"{"text":"abc"}"#), "abc");
        assert_eq!(chunk_text(r#""quoted""#), "quoted");
        assert_eq!(chunk_text("b'Yes'"), "Yes");
        assert_eq!(chunk_text("raw words"), "raw words");
    }

    #[test]
    fn test_chunk_text_audio_and_unknown_objects() {
        assert_eq!(chunk_text(r#"{"byte_str":"UklGRg"}"#), "UklGRg");
        assert_eq!(chunk_text(r#"{"tts_result":"AAAA"}"#), "AAAA");
        // Nothing recognizable: keep the whole chunk rather than lose it
        assert_eq!(chunk_text(r#"{"score":0.9}"#), r#"{"score":0.9}"#);
        // OpenAI closing chunk with usage only
        assert_eq!(chunk_text(r#"{"choices":[],"usage":{"total_tokens":3}}"#), "");
    }

    #[tokio::test]
    async fn test_drain_concatenates() {
        let mut h = handle(vec![
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"{"choices":[{"delta":{"content":", world"}}]}"#,
        ]);
        assert_eq!(h.drain().await.unwrap(), "Hello, world");
        assert!(h.is_consumed());
    }

    #[tokio::test]
    async fn test_second_read_after_drain_is_misuse() {
        let mut h = handle(vec!["a"]);
        h.drain().await.unwrap();

        assert!(matches!(h.drain().await, Err(OrchestratorError::StreamMisuse(_))));
        assert!(matches!(h.take(), Err(OrchestratorError::StreamMisuse(_))));
    }

    #[tokio::test]
    async fn test_drain_after_take_is_misuse() {
        let mut h = handle(vec!["a"]);
        let _stream = h.take().unwrap();
        assert!(matches!(h.drain().await, Err(OrchestratorError::StreamMisuse(_))));
    }

    #[tokio::test]
    async fn test_drain_surfaces_stream_errors() {
        let items: Vec<Result<String, ServiceError>> = vec![
            Ok("a".to_string()),
            Err(ServiceError::Http("reset by peer".to_string())),
        ];
        let mut h = StreamHandle::new("grader", Box::pin(futures::stream::iter(items)));
        let err = h.drain().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NodeInvocation { ref node, .. } if node == "grader"));
    }
}
