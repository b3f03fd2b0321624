//! Retrieval-augmented chat: embedding -> retriever -> (rerank) -> llm,
//! optionally with a relevance grader in front of the llm.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::graph::Capability;
use crate::pipelines::llm::{self, completion_text, document_texts, question};
use crate::runtime::alignment::{
    require, require_array, require_str, AlignmentError, AlignmentTable, InputShape, OutputShape,
    ShaperPair,
};
use crate::runtime::context::Payload;

pub const GRADER_TEMPLATE: &str = "Given the following question and context, \
return YES if the context is relevant to the question and NO if it isn't.\n\n\
> Question: {question}\n\
> Context:\n>>>\n{context}\n>>>\n\
> Relevant (YES / NO):";

/// Dispatch table for the chat QnA pipeline
pub fn alignment() -> AlignmentTable {
    AlignmentTable::new()
        .on_capability(Capability::Embedding, ShaperPair::new(embedding_inputs, embedding_outputs))
        .on_capability(Capability::Retriever, ShaperPair::new(retriever_inputs, retriever_outputs))
        .on_capability(Capability::Rerank, ShaperPair::new(rerank_inputs, rerank_outputs))
        .on_capability(Capability::Llm, ShaperPair::new(llm::llm_inputs, llm::llm_outputs))
        .stream_shaper(llm::text_chunks)
}

pub fn grader() -> ShaperPair {
    ShaperPair::new(grader_inputs, grader_outputs)
}

// ============================================================================
// SBIO: Pure helpers (no I/O)
// ============================================================================

/// Embedding vector from an OpenAI/TEI response or a bare array.
/// Pure function - no I/O.
pub fn extract_embedding(raw: &Value) -> Option<Vec<Value>> {
    let vector = raw
        .pointer("/data/0/embedding")
        .or_else(|| raw.get("embedding"))
        .unwrap_or(raw);

    match vector.as_array()?.as_slice() {
        // TEI answers a single input with [[..]]
        [Value::Array(inner)] => Some(inner.clone()),
        flat => Some(flat.to_vec()),
    }
}

/// Retrieved documents under whichever key the retriever used
pub fn extract_documents(raw: &Value) -> Vec<String> {
    ["retrieved_docs", "documents", "docs", "data"]
        .iter()
        .find_map(|k| raw.get(*k).and_then(Value::as_array))
        .or_else(|| raw.as_array())
        .map(|docs| document_texts(docs))
        .unwrap_or_default()
}

/// `(index, score)` pairs of a rerank response, best first
pub fn ranked_indices(raw: &Value) -> Vec<(usize, f64)> {
    let entries = raw
        .as_array()
        .or_else(|| raw.get("results").and_then(Value::as_array))
        .cloned()
        .unwrap_or_default();

    let mut ranked: Vec<(usize, f64)> = entries
        .iter()
        .filter_map(|e| {
            let index = e.get("index")?.as_u64()? as usize;
            let score = e
                .get("score")
                .or_else(|| e.get("relevance_score"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            Some((index, score))
        })
        .collect();

    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Relevance verdict of a grader completion, if it contains one
pub fn parse_verdict(text: &str) -> Option<bool> {
    static VERDICT: OnceLock<Option<Regex>> = OnceLock::new();
    let re = VERDICT
        .get_or_init(|| Regex::new(r"(?i)\b(yes|no)\b").ok())
        .as_ref()?;

    re.captures(text)
        .map(|c| c[1].eq_ignore_ascii_case("yes"))
}

// ============================================================================
// Shapers
// ============================================================================

fn embedding_inputs(inputs: Payload, cx: &InputShape<'_>) -> Result<Value, AlignmentError> {
    let text = require_str(&inputs, "text", cx.node)?;
    Ok(json!({"input": text}))
}

fn embedding_outputs(raw: Value, cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
    let embedding = extract_embedding(&raw).ok_or_else(|| AlignmentError::Malformed {
        node: cx.node.name.clone(),
        reason: "response carries no embedding".to_string(),
    })?;
    let text = question(cx.inputs, cx.ctx.payload()).unwrap_or_default();

    Ok(json!({"text": text, "embedding": embedding}))
}

fn retriever_inputs(inputs: Payload, cx: &InputShape<'_>) -> Result<Value, AlignmentError> {
    let text = require_str(&inputs, "text", cx.node)?;
    let embedding = require_array(&inputs, "embedding", cx.node)?;
    let params = &cx.ctx.params().retriever;

    let mut request = json!({
        "text": text,
        "embedding": embedding,
        "search_type": params.search_type,
        "k": params.k,
        "fetch_k": params.fetch_k,
        "lambda_mult": params.lambda_mult,
        "score_threshold": params.score_threshold,
    });
    if let Some(threshold) = params.distance_threshold {
        request["distance_threshold"] = json!(threshold);
    }
    Ok(request)
}

/// Normalizes documents and, when nothing was found, removes every rerank
/// stage right after this node so retrieval feeds the next stage directly.
fn retriever_outputs(raw: Value, cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
    let docs = extract_documents(&raw);
    let text = question(cx.inputs, cx.ctx.payload()).unwrap_or_default().to_string();

    if docs.is_empty() {
        let rerankers: Vec<String> = cx
            .graph
            .downstream(&cx.node.name)
            .into_iter()
            .filter(|n| n.capability == Capability::Rerank)
            .map(|n| n.name.clone())
            .collect();

        for name in rerankers {
            if cx.graph.delete_node_if_exists(&name)? {
                info!("No documents retrieved; skipping '{}'", name);
            }
        }
    }

    Ok(json!({"text": text, "retrieved_docs": docs}))
}

/// Query plus candidates. A rendezvous value joins the candidates.
fn rerank_inputs(inputs: Payload, cx: &InputShape<'_>) -> Result<Value, AlignmentError> {
    let query = require_str(&inputs, "text", cx.node)?;
    let mut texts = document_texts(require_array(&inputs, "retrieved_docs", cx.node)?);

    if let Some(key) = cx.rendezvous {
        let extra = require(&inputs, key, cx.node)?;
        let extra = match extra {
            Value::String(s) => s.clone(),
            other => completion_text(other).unwrap_or_else(|| other.to_string()),
        };
        debug!("Adding handoff '{}' to rerank candidates", key);
        texts.push(extra);
    }

    Ok(json!({"query": query, "texts": texts}))
}

fn rerank_outputs(raw: Value, cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
    let texts: Vec<String> = cx
        .request
        .get("texts")
        .and_then(Value::as_array)
        .map(|t| document_texts(t))
        .unwrap_or_default();
    let top_n = cx.ctx.params().reranker.top_n as usize;

    let ranked = ranked_indices(&raw);
    if ranked.is_empty() && !texts.is_empty() {
        return Err(AlignmentError::Malformed {
            node: cx.node.name.clone(),
            reason: "rerank response carries no scores".to_string(),
        });
    }

    let kept: Vec<String> = ranked
        .into_iter()
        .filter_map(|(i, _)| texts.get(i).cloned())
        .take(top_n)
        .collect();
    let query = cx.request.get("query").cloned().unwrap_or(Value::Null);

    Ok(json!({"text": query, "retrieved_docs": kept}))
}

fn grader_inputs(inputs: Payload, cx: &InputShape<'_>) -> Result<Value, AlignmentError> {
    let query = require_str(&inputs, "text", cx.node)?;
    let docs = document_texts(require_array(&inputs, "retrieved_docs", cx.node)?);

    let prompt = GRADER_TEMPLATE
        .replace("{question}", query)
        .replace("{context}", &docs.join("\n"));
    let params = &cx.ctx.params().llm;
    Ok(llm::chat_request(&prompt, params, params.streaming))
}

/// A "no" verdict empties the documents so the answer is generated without
/// them.
fn grader_outputs(raw: Value, cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
    let verdict = completion_text(&raw).ok_or_else(|| AlignmentError::Malformed {
        node: cx.node.name.clone(),
        reason: "grader returned no text".to_string(),
    })?;
    let relevant = parse_verdict(&verdict).ok_or_else(|| AlignmentError::Malformed {
        node: cx.node.name.clone(),
        reason: format!("no yes/no verdict in '{}'", verdict.trim()),
    })?;

    let query = question(cx.inputs, cx.ctx.payload()).unwrap_or_default().to_string();
    let docs = if relevant {
        cx.inputs.get("retrieved_docs").cloned().unwrap_or_else(|| json!([]))
    } else {
        info!("Grader '{}' judged documents irrelevant", cx.node.name);
        json!([])
    };

    Ok(json!({"text": query, "retrieved_docs": docs, "relevant": relevant}))
}
