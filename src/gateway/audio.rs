use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::GatewayError;
use crate::runtime::context::{Parameters, Payload};

pub const DEFAULT_AUDIO_MAX_TOKENS: u32 = 64;
pub const DEFAULT_VOICE: &str = "default";

fn default_audio_max_tokens() -> u32 {
    DEFAULT_AUDIO_MAX_TOKENS
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

/// Spoken question, base64 encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioQnaRequest {
    pub audio: String,
    #[serde(default = "default_audio_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_voice")]
    pub voice: String,
}

impl AudioQnaRequest {
    /// Payload `{"audio": ..}`; the voice travels in the parameter extras
    pub fn into_parts(self) -> Result<(Payload, Parameters), GatewayError> {
        if self.audio.trim().is_empty() {
            return Err(GatewayError::BadRequest("audio is empty".to_string()));
        }

        let mut params = Parameters::default();
        params.llm.max_tokens = self.max_tokens;
        // Spoken answers are produced in one piece
        params.llm.streaming = false;
        params
            .extras
            .insert("voice".to_string(), Value::String(self.voice));

        let mut payload = Payload::new();
        payload.insert("audio".to_string(), Value::String(self.audio));
        Ok((payload, params))
    }
}

/// Base64 audio of the terminal TTS node
pub fn project_audio(node: &str, value: &Value) -> Result<String, GatewayError> {
    let audio = match value {
        Value::String(s) => Some(s.as_str()),
        _ => ["tts_result", "byte_str", "audio"]
            .iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str)),
    };

    audio.map(String::from).ok_or_else(|| GatewayError::Projection {
        node: node.to_string(),
        reason: "no audio in result".to_string(),
    })
}
