use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{Capability, NodeRole};
use crate::pipelines::{align_profile, PipelineKind};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SERVICE_HOST: &str = "localhost";

/// Errors that can occur while parsing and validating a pipeline file
#[derive(Error, Debug, PartialEq)]
pub enum PipelineFileError {
    #[error("Failed to parse pipeline: {0}")]
    ParseError(String),

    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error("Service '{0}' referenced but not defined")]
    UndefinedService(String),

    #[error("Service '{service}' uses unknown align profile '{profile}'")]
    UnknownAlignProfile { service: String, profile: String },

    #[error("Service '{0}' needs a port")]
    MissingPort(String),

    #[error("Composite service '{0}' needs a pipeline file")]
    MissingSubPipeline(String),

    #[error("Environment variable in '{0}' is not set")]
    UndefinedVariable(String),
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_service_host() -> String {
    DEFAULT_SERVICE_HOST.to_string()
}

/// The megaservice itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MegaserviceSpec {
    pub name: String,
    #[serde(default)]
    pub kind: PipelineKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Services run next to the graph, publishing into the request handoff
    #[serde(default)]
    pub auxiliary: Vec<String>,
}

/// One microservice wrapped as a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceSpec {
    pub name: String,
    pub capability: Capability,
    #[serde(default)]
    pub role: NodeRole,
    #[serde(default = "default_service_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Defaults by capability when absent
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub output_type: Option<String>,
    /// Named shaper profile overriding the capability default
    #[serde(default)]
    pub align: Option<String>,
    /// Handoff key the node waits for before running
    #[serde(default)]
    pub rendezvous: Option<String>,
    /// Sub-pipeline file of a composite service, relative to this file
    #[serde(default)]
    pub pipeline: Option<PathBuf>,
}

impl ServiceSpec {
    pub fn endpoint_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| default_path(&self.capability).to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowSpec {
    pub from: String,
    pub to: String,
}

/// A whole pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineFile {
    pub megaservice: MegaserviceSpec,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
}

impl PipelineFile {
    /// Parse and validate JSON or JSONC content
    pub fn from_jsonc(content: &str) -> Result<Self, PipelineFileError> {
        let file = parse_jsonc(content)?;
        validate_pipeline(&file)?;
        Ok(file)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> Result<Self, PipelineFileError> {
        let file = parse_yaml(content)?;
        validate_pipeline(&file)?;
        Ok(file)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn is_auxiliary(&self, name: &str) -> bool {
        self.megaservice.auxiliary.iter().any(|a| a == name)
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Conventional endpoint path of each capability.
/// Pure function - no I/O.
pub fn default_path(capability: &Capability) -> &'static str {
    match capability {
        Capability::Embedding => "/v1/embeddings",
        Capability::Retriever => "/v1/retrieval",
        Capability::Rerank => "/v1/reranking",
        Capability::Llm => "/v1/chat/completions",
        Capability::Asr => "/v1/asr",
        Capability::Tts => "/v1/tts",
        Capability::Animation => "/v1/animation",
        Capability::Lvm => "/v1/lvm",
        Capability::WebRetriever => "/v1/web_retrieval",
        Capability::Text2Query => "/v1/text2query",
        Capability::Gateway | Capability::Other(_) => "/",
    }
}

/// Strip C-style comments from JSONC content.
/// This is a pure function - no I/O.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                result.push(c);
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
                result.push(c);
            }
            '/' if !in_string && chars.peek() == Some(&'/') => {
                chars.next();
                // Keep the newline so line numbers in parse errors stay right
                if chars.by_ref().any(|nc| nc == '\n') {
                    result.push('\n');
                }
            }
            '/' if !in_string && chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    prev = nc;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

pub fn parse_jsonc(content: &str) -> Result<PipelineFile, PipelineFileError> {
    let stripped = strip_jsonc_comments(content);
    serde_json::from_str(&stripped).map_err(|e| PipelineFileError::ParseError(e.to_string()))
}

pub fn parse_yaml(content: &str) -> Result<PipelineFile, PipelineFileError> {
    serde_yaml::from_str(content).map_err(|e| PipelineFileError::ParseError(e.to_string()))
}

/// Expand `${VAR}` / `$VAR` references from the process environment
pub fn expand_env(value: &str) -> Result<String, PipelineFileError> {
    shellexpand::env(value)
        .map(|s| s.into_owned())
        .map_err(|_| PipelineFileError::UndefinedVariable(value.to_string()))
}

/// Check a pipeline definition for consistency.
/// Cycles are caught later, when the graph is assembled.
/// This is a pure function - no I/O.
pub fn validate_pipeline(file: &PipelineFile) -> Result<(), PipelineFileError> {
    let mut seen = HashSet::new();
    for service in &file.services {
        if !seen.insert(service.name.as_str()) {
            return Err(PipelineFileError::DuplicateService(service.name.clone()));
        }
    }

    for flow in &file.flows {
        for end in [&flow.from, &flow.to] {
            if !seen.contains(end.as_str()) {
                return Err(PipelineFileError::UndefinedService(end.clone()));
            }
        }
    }

    for aux in &file.megaservice.auxiliary {
        if !seen.contains(aux.as_str()) {
            return Err(PipelineFileError::UndefinedService(aux.clone()));
        }
    }

    for service in &file.services {
        if let Some(profile) = &service.align {
            if align_profile(profile).is_none() {
                return Err(PipelineFileError::UnknownAlignProfile {
                    service: service.name.clone(),
                    profile: profile.clone(),
                });
            }
        }

        match service.role {
            NodeRole::Leaf if service.port.is_none() => {
                return Err(PipelineFileError::MissingPort(service.name.clone()));
            }
            NodeRole::Composite if service.pipeline.is_none() => {
                return Err(PipelineFileError::MissingSubPipeline(service.name.clone()));
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHATQNA: &str = r#"{
        // RAG megaservice
        "megaservice": {"name": "chatqna", "kind": "chatqna"},
        "services": [
            {"name": "embedding", "capability": "EMBEDDING", "port": 6000},
            {"name": "retriever", "capability": "retriever", "port": 7000},
            {"name": "rerank", "capability": "RERANK", "port": 8000, "path": "rerank"},
            /* generation */
            {"name": "llm", "capability": "LLM", "host": "tgi", "port": 9000,
             "input-type": "ChatRequest", "output-type": "Text"}
        ],
        "flows": [
            {"from": "embedding", "to": "retriever"},
            {"from": "retriever", "to": "rerank"},
            {"from": "rerank", "to": "llm"}
        ]
    }"#;

    #[test]
    fn test_strip_comments_keeps_strings() {
        let input = r#"{"url": "http://x//y", /* c */ "a": 1} // tail"#;
        let stripped = strip_jsonc_comments(input);
        assert_eq!(stripped, r#"{"url": "http://x//y",  "a": 1} "#);
    }

    #[test]
    fn test_parse_chatqna() {
        let file = PipelineFile::from_jsonc(CHATQNA).unwrap();
        assert_eq!(file.megaservice.port, 8888);
        assert_eq!(file.megaservice.timeout, 120);
        assert_eq!(file.services.len(), 4);

        let llm = file.service("llm").unwrap();
        assert_eq!(llm.capability, Capability::Llm);
        assert_eq!(llm.host, "tgi");
        assert_eq!(llm.endpoint_path(), "/v1/chat/completions");
        assert_eq!(llm.input_type.as_deref(), Some("ChatRequest"));
        assert_eq!(file.service("rerank").unwrap().endpoint_path(), "rerank");
        assert_eq!(file.service("embedding").unwrap().host, "localhost");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
megaservice:
  name: audioqna
  kind: audioqna
  port: 3008
services:
  - name: asr
    capability: ASR
    port: 9099
  - name: tts
    capability: TTS
    port: 9088
flows:
  - from: asr
    to: tts
"#;
        let file = PipelineFile::from_yaml(yaml).unwrap();
        assert_eq!(file.megaservice.kind, PipelineKind::AudioQna);
        assert_eq!(file.megaservice.port, 3008);
        assert_eq!(file.flows.len(), 1);
    }

    #[test]
    fn test_duplicate_service() {
        let json = r#"{"megaservice": {"name": "m"}, "services": [
            {"name": "a", "capability": "LLM", "port": 1},
            {"name": "a", "capability": "LLM", "port": 2}
        ]}"#;
        assert_eq!(
            PipelineFile::from_jsonc(json).unwrap_err(),
            PipelineFileError::DuplicateService("a".to_string())
        );
    }

    #[test]
    fn test_undefined_flow_endpoint() {
        let json = r#"{"megaservice": {"name": "m"},
            "services": [{"name": "a", "capability": "LLM", "port": 1}],
            "flows": [{"from": "a", "to": "ghost"}]}"#;
        assert_eq!(
            PipelineFile::from_jsonc(json).unwrap_err(),
            PipelineFileError::UndefinedService("ghost".to_string())
        );
    }

    #[test]
    fn test_unknown_profile_and_missing_port() {
        let json = r#"{"megaservice": {"name": "m"},
            "services": [{"name": "a", "capability": "LLM", "port": 1, "align": "oracle"}]}"#;
        assert!(matches!(
            PipelineFile::from_jsonc(json),
            Err(PipelineFileError::UnknownAlignProfile { .. })
        ));

        let json = r#"{"megaservice": {"name": "m"},
            "services": [{"name": "a", "capability": "LLM"}]}"#;
        assert_eq!(
            PipelineFile::from_jsonc(json).unwrap_err(),
            PipelineFileError::MissingPort("a".to_string())
        );
    }

    #[test]
    fn test_composite_needs_pipeline() {
        let json = r#"{"megaservice": {"name": "m"},
            "services": [{"name": "sub", "capability": "RAG", "role": "composite"}]}"#;
        assert_eq!(
            PipelineFile::from_jsonc(json).unwrap_err(),
            PipelineFileError::MissingSubPipeline("sub".to_string())
        );
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("MEGASERVICE_TEST_HOST", "10.0.0.7");
        assert_eq!(expand_env("${MEGASERVICE_TEST_HOST}").unwrap(), "10.0.0.7");
        assert_eq!(expand_env("plain").unwrap(), "plain");
        assert!(expand_env("${MEGASERVICE_SURELY_UNSET_VAR}").is_err());
    }
}
