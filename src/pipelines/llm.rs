//! LLM shapers shared by every pipeline

use serde_json::{json, Value};

use crate::runtime::alignment::{AlignmentError, InputShape, OutputShape};
use crate::runtime::context::{LlmParams, Payload};
use crate::runtime::stream::chunk_text;

pub const RAG_TEMPLATE: &str = "### You are a helpful, respectful and honest assistant to help the user with questions. \
Please refer to the search results obtained from the local knowledge base. \
But be careful to not incorporate the information that you think is not relevant to the question. \
If you don't know the answer to a question, please don't share false information.\n\
### Search results: {context}\n\
### Question: {question}\n\
### Answer:";

/// Build the prompt for `question`, grounding it on `documents` when there
/// are any. A custom template may use `{context}` and `{question}`.
/// Pure function - no I/O.
pub fn build_prompt(question: &str, documents: &[String], template: Option<&str>) -> String {
    if documents.is_empty() && template.is_none() {
        return question.to_string();
    }

    let context = documents.join("\n");
    template
        .unwrap_or(RAG_TEMPLATE)
        .replace("{context}", &context)
        .replace("{question}", question)
}

/// OpenAI-style chat request carrying every sampling parameter
pub fn chat_request(prompt: &str, params: &LlmParams, stream: bool) -> Value {
    let mut request = json!({
        "messages": [{"role": "user", "content": prompt}],
        "max_tokens": params.max_tokens,
        "top_k": params.top_k,
        "top_p": params.top_p,
        "temperature": params.temperature,
        "frequency_penalty": params.frequency_penalty,
        "presence_penalty": params.presence_penalty,
        "repetition_penalty": params.repetition_penalty,
        "stream": stream,
    });
    if let Some(model) = &params.model {
        request["model"] = Value::String(model.clone());
    }
    request
}

/// Documents as plain strings. Accepts strings or objects with `text` or
/// `page_content`.
pub fn document_texts(docs: &[Value]) -> Vec<String> {
    docs.iter()
        .filter_map(|d| match d {
            Value::String(s) => Some(s.clone()),
            other => other
                .get("text")
                .or_else(|| other.get("page_content"))
                .and_then(Value::as_str)
                .map(String::from),
        })
        .collect()
}

/// The question of this request: the upstream `text`, or the gateway's
pub fn question<'a>(inputs: &'a Payload, cx_payload: &'a Payload) -> Option<&'a str> {
    inputs
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| cx_payload.get("text").and_then(Value::as_str))
}

/// Generated text of a completion, a drained stream, or a `{"text"}` object
pub fn completion_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => Some(s.clone()),
        other => other
            .pointer("/choices/0/message/content")
            .or_else(|| other.pointer("/choices/0/text"))
            .or_else(|| other.get("text"))
            .or_else(|| other.get("generated_text"))
            .and_then(Value::as_str)
            .map(String::from),
    }
}

pub fn llm_inputs(inputs: Payload, cx: &InputShape<'_>) -> Result<Value, AlignmentError> {
    let question = question(&inputs, cx.ctx.payload()).ok_or_else(|| AlignmentError::MissingField {
        node: cx.node.name.clone(),
        field: "text".to_string(),
    })?;

    let docs = inputs
        .get("retrieved_docs")
        .and_then(Value::as_array)
        .map(|d| document_texts(d))
        .unwrap_or_default();

    let params = &cx.ctx.params().llm;
    let prompt = build_prompt(question, &docs, params.chat_template.as_deref());
    Ok(chat_request(&prompt, params, params.streaming))
}

pub fn llm_outputs(raw: Value, cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
    let text = completion_text(&raw).ok_or_else(|| AlignmentError::Malformed {
        node: cx.node.name.clone(),
        reason: "completion carries no text".to_string(),
    })?;

    let mut out = json!({"text": text});
    if let Some(usage) = raw.get("usage") {
        out["usage"] = usage.clone();
    }
    Ok(out)
}

/// Re-frame any upstream chunk as its bare text, dropping empty ones
pub fn text_chunks(_node: &crate::graph::NodeDescriptor, chunk: String) -> Option<String> {
    let text = chunk_text(&chunk);
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_without_documents_is_the_question() {
        assert_eq!(build_prompt("why?", &[], None), "why?");
    }

    #[test]
    fn test_rag_prompt() {
        let prompt = build_prompt("why?", &["doc one".to_string(), "doc two".to_string()], None);
        assert!(prompt.contains("### Search results: doc one\ndoc two\n"));
        assert!(prompt.contains("### Question: why?"));
    }

    #[test]
    fn test_custom_template() {
        let prompt = build_prompt("q", &["c".to_string()], Some("C={context} Q={question}"));
        assert_eq!(prompt, "C=c Q=q");
    }

    #[test]
    fn test_chat_request() {
        let mut params = LlmParams::default();
        params.model = Some("m".to_string());
        let req = chat_request("hi", &params, false);
        assert_eq!(req["messages"][0]["content"], "hi");
        assert_eq!(req["max_tokens"], 1024);
        assert_eq!(req["stream"], false);
        assert_eq!(req["model"], "m");
    }

    #[test]
    fn test_document_texts() {
        let docs = vec![json!("a"), json!({"text": "b"}), json!({"page_content": "c"}), json!(1)];
        assert_eq!(document_texts(&docs), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_completion_text() {
        let completion = json!({"choices": [{"message": {"role": "assistant", "content": "done"}}]});
        assert_eq!(completion_text(&completion).as_deref(), Some("done"));
        assert_eq!(completion_text(&json!("drained")).as_deref(), Some("drained"));
        assert_eq!(completion_text(&json!({"vector": []})), None);
    }
}
