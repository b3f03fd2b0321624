use thiserror::Error;

use crate::client::ServiceError;
use crate::graph::GraphError;
use crate::runtime::alignment::AlignmentError;

/// Everything that can fail while scheduling one request
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Graph assembly error: {0}")]
    Assembly(GraphError),

    #[error("Node '{node}' invocation failed: {cause}")]
    NodeInvocation {
        node: String,
        #[source]
        cause: ServiceError,
    },

    #[error("Alignment error: {0}")]
    Alignment(#[from] AlignmentError),

    #[error("Stream misuse: {0}")]
    StreamMisuse(String),

    #[error("Timed out after {waited_ms}ms waiting for handoff '{key}'")]
    HandoffTimeout { key: String, waited_ms: u64 },

    #[error("Terminal node '{0}' produced no result")]
    MissingTerminal(String),
}

impl From<GraphError> for OrchestratorError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Sealed => OrchestratorError::StreamMisuse(
                "runtime graph mutated after scheduling finished".to_string(),
            ),
            other => OrchestratorError::Assembly(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_maps_to_stream_misuse() {
        let err: OrchestratorError = GraphError::Sealed.into();
        assert!(matches!(err, OrchestratorError::StreamMisuse(_)));

        let err: OrchestratorError = GraphError::DuplicateNode("llm".to_string()).into();
        assert!(matches!(err, OrchestratorError::Assembly(_)));
    }

    #[test]
    fn test_invocation_error_display() {
        let err = OrchestratorError::NodeInvocation {
            node: "retriever".to_string(),
            cause: ServiceError::Http("connection refused".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Node 'retriever' invocation failed: HTTP error: connection refused"
        );
    }
}
