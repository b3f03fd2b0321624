use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "megaservice")]
#[command(about = "Serve a graph of inference microservices behind one gateway")]
#[command(version)]
pub struct Args {
    /// Path to the pipeline file (JSON, JSONC or YAML)
    #[arg(required = true)]
    pub pipeline_file: PathBuf,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate the pipeline and show its topology without serving
    #[arg(long)]
    pub dry_run: bool,

    /// Override the gateway bind address
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the gateway port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file for loading service hosts and keys
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Override the per-request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

use crate::config::{PipelineFile, ServiceSpec};
use crate::graph::NodeRole;

/// Format a dry-run output showing the pipeline topology.
/// Pure function - returns a formatted string.
pub fn format_dry_run(file: &PipelineFile, args: &Args) -> String {
    let mut output = String::new();
    let mega = &file.megaservice;

    output.push_str(&format!(
        "megaservice v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Pipeline: {}\n", args.pipeline_file.display()));
    output.push_str(&format!(
        "Megaservice: {} ({}) on {}:{}\n",
        mega.name,
        mega.kind,
        args.bind_addr.as_deref().unwrap_or(mega.host.as_str()),
        args.port.unwrap_or(mega.port)
    ));
    output.push_str(&format!(
        "Timeout: {}s\n\n",
        args.timeout.unwrap_or(mega.timeout)
    ));

    let (auxiliary, nodes): (Vec<&ServiceSpec>, Vec<&ServiceSpec>) = file
        .services
        .iter()
        .partition(|s| file.is_auxiliary(&s.name));

    output.push_str(&format!("Services ({}):\n", nodes.len()));
    for service in &nodes {
        output.push_str(&format!("  [{}] {}", service.name, describe(service)));

        let downstream: Vec<&str> = file
            .flows
            .iter()
            .filter(|f| f.from == service.name)
            .map(|f| f.to.as_str())
            .collect();
        if !downstream.is_empty() {
            output.push_str(&format!(" -> {}", downstream.join(", ")));
        }
        output.push('\n');

        if let Some(ref profile) = service.align {
            output.push_str(&format!("      Align: {}\n", profile));
        }
        if let Some(ref key) = service.rendezvous {
            output.push_str(&format!("      Waits for: {}\n", key));
        }
    }

    if !auxiliary.is_empty() {
        output.push_str(&format!("\nAuxiliary ({}):\n", auxiliary.len()));
        for service in auxiliary {
            output.push_str(&format!("  [{}] {}\n", service.name, describe(service)));
        }
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to serve. Remove --dry-run to start the gateway.\n");

    output
}

fn describe(service: &ServiceSpec) -> String {
    match (service.role, &service.pipeline, service.port) {
        (NodeRole::Composite, Some(sub), _) => {
            format!("{} composite <- {}", service.capability, sub.display())
        }
        (_, _, Some(port)) => format!(
            "{} {}:{}{}",
            service.capability,
            service.host,
            port,
            service.endpoint_path()
        ),
        _ => service.capability.to_string(),
    }
}
