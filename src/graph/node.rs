use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::client::{HttpServiceClient, NodeOutput, NodeService};
use crate::runtime::OrchestratorError;

/// Capability tag of a node, used only to pick alignment logic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Embedding,
    Retriever,
    Rerank,
    Llm,
    Asr,
    Tts,
    Animation,
    Lvm,
    WebRetriever,
    Text2Query,
    Gateway,
    Other(String),
}

impl Capability {
    pub fn as_str(&self) -> &str {
        match self {
            Capability::Embedding => "EMBEDDING",
            Capability::Retriever => "RETRIEVER",
            Capability::Rerank => "RERANK",
            Capability::Llm => "LLM",
            Capability::Asr => "ASR",
            Capability::Tts => "TTS",
            Capability::Animation => "ANIMATION",
            Capability::Lvm => "LVM",
            Capability::WebRetriever => "WEB_RETRIEVER",
            Capability::Text2Query => "TEXT2QUERY",
            Capability::Gateway => "GATEWAY",
            Capability::Other(tag) => tag,
        }
    }
}

impl Capability {
    /// Map a tag to a known capability; unknown tags are kept as `Other`
    pub fn from_tag(tag: &str) -> Self {
        let normalized = tag.trim().to_uppercase().replace('-', "_");
        match normalized.as_str() {
            "EMBEDDING" => Capability::Embedding,
            "RETRIEVER" => Capability::Retriever,
            "RERANK" => Capability::Rerank,
            "LLM" => Capability::Llm,
            "ASR" => Capability::Asr,
            "TTS" => Capability::Tts,
            "ANIMATION" => Capability::Animation,
            "LVM" => Capability::Lvm,
            "WEB_RETRIEVER" => Capability::WebRetriever,
            "TEXT2QUERY" => Capability::Text2Query,
            "GATEWAY" => Capability::Gateway,
            _ => Capability::Other(normalized),
        }
    }
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Capability::from_tag(s))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Capability::from_tag(&s))
    }
}

/// Whether a node is a single service or a whole sub-pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    #[default]
    Leaf,
    Composite,
}

/// Where a node lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Remote { host: String, port: u16, path: String },
    InProcess,
}

impl Address {
    /// Full URL for remote nodes
    pub fn endpoint(&self) -> Option<String> {
        match self {
            Address::Remote { host, port, path } => {
                let path = if path.starts_with('/') {
                    path.clone()
                } else {
                    format!("/{}", path)
                };
                Some(format!("http://{}:{}{}", host, port, path))
            }
            Address::InProcess => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            Some(url) => f.write_str(&url),
            None => f.write_str("in-process"),
        }
    }
}

/// One capability participating in a pipeline.
///
/// Immutable once assembled; runtime graphs share descriptors through `Arc`
/// and only ever change which descriptors are connected.
#[derive(Clone)]
pub struct NodeDescriptor {
    pub name: String,
    pub role: NodeRole,
    pub capability: Capability,
    pub address: Address,
    pub input_type: Option<String>,
    pub output_type: Option<String>,
    service: Arc<dyn NodeService>,
}

impl NodeDescriptor {
    /// Node reached over HTTP through `client`'s connection pool
    pub fn remote(
        name: impl Into<String>,
        capability: Capability,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        client: &reqwest::Client,
    ) -> Self {
        let address = Address::Remote {
            host: host.into(),
            port,
            path: path.into(),
        };
        // Remote addresses always have an endpoint
        let endpoint = address.endpoint().unwrap_or_default();
        Self::with_service(
            name,
            capability,
            address,
            Arc::new(HttpServiceClient::new(endpoint).with_client(client.clone())),
        )
    }

    /// Node called directly in this process
    pub fn local(
        name: impl Into<String>,
        capability: Capability,
        service: impl NodeService + 'static,
    ) -> Self {
        Self::with_service(name, capability, Address::InProcess, Arc::new(service))
    }

    /// A full sub-pipeline exposed as one hop
    pub fn composite(
        name: impl Into<String>,
        capability: Capability,
        pipeline: Arc<dyn NodeService>,
    ) -> Self {
        let mut node = Self::with_service(name, capability, Address::InProcess, pipeline);
        node.role = NodeRole::Composite;
        node
    }

    pub fn with_service(
        name: impl Into<String>,
        capability: Capability,
        address: Address,
        service: Arc<dyn NodeService>,
    ) -> Self {
        Self {
            name: name.into(),
            role: NodeRole::Leaf,
            capability,
            address,
            input_type: None,
            output_type: None,
            service,
        }
    }

    /// Declared payload type names, for documentation and listing only
    pub fn with_types(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input_type = Some(input.into());
        self.output_type = Some(output.into());
        self
    }

    pub fn is_composite(&self) -> bool {
        self.role == NodeRole::Composite
    }

    /// Invoke the wrapped service. No reshaping happens here.
    pub async fn invoke(&self, request: Value) -> Result<NodeOutput, OrchestratorError> {
        self.service
            .invoke(request)
            .await
            .map_err(|cause| OrchestratorError::NodeInvocation {
                node: self.name.clone(),
                cause,
            })
    }
}

impl fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDescriptor")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("capability", &self.capability)
            .field("address", &self.address)
            .finish()
    }
}
