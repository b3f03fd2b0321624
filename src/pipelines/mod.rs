//! Alignment sets for the shipped megaservices

pub mod audioqna;
pub mod chatqna;
pub mod llm;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::Capability;
use crate::runtime::alignment::{AlignmentTable, ShaperPair};

#[derive(Error, Debug, PartialEq)]
pub enum PipelineError {
    #[error("Unknown align profile '{profile}' on node '{node}'")]
    UnknownProfile { node: String, profile: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    #[default]
    ChatQna,
    AudioQna,
}

impl PipelineKind {
    /// Capability whose live stream may be passed straight to the caller
    pub fn terminal(&self) -> Capability {
        match self {
            PipelineKind::ChatQna => Capability::Llm,
            PipelineKind::AudioQna => Capability::Tts,
        }
    }

    pub fn base_alignment(&self) -> AlignmentTable {
        match self {
            PipelineKind::ChatQna => chatqna::alignment(),
            PipelineKind::AudioQna => audioqna::alignment(),
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::ChatQna => write!(f, "chatqna"),
            PipelineKind::AudioQna => write!(f, "audioqna"),
        }
    }
}

/// Names accepted in a service's `align` field
pub const ALIGN_PROFILES: &[&str] = &["grader", "llm", "passthrough"];

/// Per-node shapers selectable by name
pub fn align_profile(name: &str) -> Option<ShaperPair> {
    match name {
        "grader" => Some(chatqna::grader()),
        "llm" => Some(ShaperPair::new(llm::llm_inputs, llm::llm_outputs)),
        "passthrough" => Some(ShaperPair::PASSTHROUGH),
        _ => None,
    }
}

/// Alignment wiring of one configured node
#[derive(Debug, Clone, Copy)]
pub struct NodeAlignment<'a> {
    pub node: &'a str,
    pub profile: Option<&'a str>,
    pub rendezvous: Option<&'a str>,
}

/// Build the dispatch table for a configured pipeline: the kind's base table
/// plus per-node profiles and rendezvous keys.
pub fn alignment_for<'a>(
    kind: PipelineKind,
    nodes: impl IntoIterator<Item = NodeAlignment<'a>>,
) -> Result<AlignmentTable, PipelineError> {
    let mut table = kind.base_alignment();

    for n in nodes {
        if let Some(profile) = n.profile {
            let pair = align_profile(profile).ok_or_else(|| PipelineError::UnknownProfile {
                node: n.node.to_string(),
                profile: profile.to_string(),
            })?;
            table = table.on_node(n.node, pair);
        }
        if let Some(key) = n.rendezvous {
            table = table.rendezvous(n.node, key);
        }
    }

    Ok(table)
}
