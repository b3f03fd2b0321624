pub mod pipeline;

pub use pipeline::{
    default_path, expand_env, parse_jsonc, parse_yaml, strip_jsonc_comments, validate_pipeline,
    FlowSpec, MegaserviceSpec, PipelineFile, PipelineFileError, ServiceSpec,
};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::client::pooled_client;
use crate::gateway::Gateway;
use crate::graph::{GraphError, NodeDescriptor, NodeRole, OrchestrationGraph};
use crate::pipelines::{alignment_for, NodeAlignment, PipelineError};
use crate::runtime::Orchestrator;

/// Composite services may nest pipelines this deep
pub const MAX_PIPELINE_DEPTH: usize = 8;

/// Errors for file I/O and assembly (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Pipeline error: {0}")]
    PipelineFile(#[from] PipelineFileError),

    #[error("Graph assembly error: {0}")]
    Assembly(#[from] GraphError),

    #[error("Alignment error: {0}")]
    Alignment(#[from] PipelineError),

    #[error("Pipelines nested deeper than {0} levels")]
    TooDeep(usize),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and validate a pipeline file. `.yaml`/`.yml` is read as YAML,
/// anything else as JSONC.
pub fn load_pipeline_file(path: &Path) -> Result<PipelineFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let file = if is_yaml {
        PipelineFile::from_yaml(&content)?
    } else {
        PipelineFile::from_jsonc(&content)?
    };
    Ok(file)
}

/// Assemble the gateway described by `file`. Sub-pipeline paths are
/// resolved against `base_dir`; every remote node, nested ones included,
/// shares one connection pool.
pub fn build_gateway(file: &PipelineFile, base_dir: &Path) -> Result<Gateway, ConfigError> {
    let client = pooled_client();
    let orchestrator = build_orchestrator(file, base_dir, 0, &client)?;
    let mut gateway = Gateway::new(Arc::new(orchestrator), file.megaservice.kind.terminal())
        .with_timeout(Duration::from_secs(file.megaservice.timeout));

    for name in &file.megaservice.auxiliary {
        if let Some(spec) = file.service(name) {
            gateway = gateway.with_auxiliary(build_descriptor(spec, base_dir, 0, &client)?);
        }
    }

    info!(
        "Assembled megaservice '{}' ({}) with {} nodes, {} auxiliary",
        file.megaservice.name,
        file.megaservice.kind,
        gateway.orchestrator().graph().len(),
        file.megaservice.auxiliary.len()
    );
    Ok(gateway)
}

/// The graph of `file` without its auxiliary services; remote nodes use
/// `client`'s connection pool
pub fn build_graph(
    file: &PipelineFile,
    base_dir: &Path,
    depth: usize,
    client: &reqwest::Client,
) -> Result<OrchestrationGraph, ConfigError> {
    let mut graph = OrchestrationGraph::new();

    for spec in file.services.iter().filter(|s| !file.is_auxiliary(&s.name)) {
        graph.add(build_descriptor(spec, base_dir, depth, client)?)?;
    }
    for flow in &file.flows {
        graph.flow_to(&flow.from, &flow.to)?;
    }

    Ok(graph)
}

fn build_orchestrator(
    file: &PipelineFile,
    base_dir: &Path,
    depth: usize,
    client: &reqwest::Client,
) -> Result<Orchestrator, ConfigError> {
    let graph = build_graph(file, base_dir, depth, client)?;
    let table = alignment_for(
        file.megaservice.kind,
        file.services.iter().map(|s| NodeAlignment {
            node: &s.name,
            profile: s.align.as_deref(),
            rendezvous: s.rendezvous.as_deref(),
        }),
    )?;
    Ok(Orchestrator::new(graph, &table))
}

fn build_descriptor(
    spec: &ServiceSpec,
    base_dir: &Path,
    depth: usize,
    client: &reqwest::Client,
) -> Result<NodeDescriptor, ConfigError> {
    let mut node = match (spec.role, &spec.pipeline, spec.port) {
        (NodeRole::Composite, Some(sub), _) => {
            if depth + 1 >= MAX_PIPELINE_DEPTH {
                return Err(ConfigError::TooDeep(MAX_PIPELINE_DEPTH));
            }
            let path = base_dir.join(sub);
            debug!("Loading sub-pipeline '{}' from {}", spec.name, path.display());

            let sub_file = load_pipeline_file(&path)?;
            let sub_dir = path.parent().unwrap_or(base_dir);
            let orchestrator = build_orchestrator(&sub_file, sub_dir, depth + 1, client)?;
            NodeDescriptor::composite(&spec.name, spec.capability.clone(), Arc::new(orchestrator))
        }
        (NodeRole::Leaf, _, Some(port)) => NodeDescriptor::remote(
            &spec.name,
            spec.capability.clone(),
            expand_env(&spec.host)?,
            port,
            spec.endpoint_path(),
            client,
        ),
        (NodeRole::Composite, None, _) => {
            return Err(PipelineFileError::MissingSubPipeline(spec.name.clone()).into())
        }
        (NodeRole::Leaf, _, None) => {
            return Err(PipelineFileError::MissingPort(spec.name.clone()).into())
        }
    };

    node.input_type = spec.input_type.clone();
    node.output_type = spec.output_type.clone();
    Ok(node)
}
