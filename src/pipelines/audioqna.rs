//! Spoken question answering: asr -> llm -> tts

use serde_json::{json, Value};

use crate::gateway::audio::DEFAULT_VOICE;
use crate::graph::Capability;
use crate::pipelines::llm;
use crate::runtime::alignment::{
    require_str, AlignmentError, AlignmentTable, InputShape, OutputShape, ShaperPair,
};
use crate::runtime::context::Payload;

pub fn alignment() -> AlignmentTable {
    AlignmentTable::new()
        .on_capability(Capability::Asr, ShaperPair::new(asr_inputs, asr_outputs))
        .on_capability(Capability::Llm, ShaperPair::new(llm::llm_inputs, llm::llm_outputs))
        .on_capability(Capability::Tts, ShaperPair::new(tts_inputs, tts_outputs))
}

fn first_str<'v>(raw: &'v Value, keys: &[&str]) -> Option<&'v str> {
    match raw {
        Value::String(s) => Some(s),
        _ => keys.iter().find_map(|k| raw.get(*k).and_then(Value::as_str)),
    }
}

fn asr_inputs(inputs: Payload, cx: &InputShape<'_>) -> Result<Value, AlignmentError> {
    let audio = require_str(&inputs, "audio", cx.node)?;
    Ok(json!({"audio": audio}))
}

/// The transcription becomes the question for the llm
fn asr_outputs(raw: Value, cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
    let text = first_str(&raw, &["asr_result", "text"]).ok_or_else(|| AlignmentError::Malformed {
        node: cx.node.name.clone(),
        reason: "no transcription in response".to_string(),
    })?;
    Ok(json!({"text": text}))
}

fn tts_inputs(inputs: Payload, cx: &InputShape<'_>) -> Result<Value, AlignmentError> {
    let text = require_str(&inputs, "text", cx.node)?;
    let voice = cx.ctx.params().extra_str("voice").unwrap_or(DEFAULT_VOICE);
    Ok(json!({"text": text, "voice": voice}))
}

fn tts_outputs(raw: Value, cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
    let audio = first_str(&raw, &["tts_result", "byte_str", "audio"]).ok_or_else(|| {
        AlignmentError::Malformed {
            node: cx.node.name.clone(),
            reason: "no audio in response".to_string(),
        }
    })?;
    Ok(json!({"tts_result": audio}))
}
