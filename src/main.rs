use std::path::Path;
use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use megaservice::cli::{format_dry_run, Args};
use megaservice::config::{build_gateway, load_pipeline_file};
use megaservice::pipelines::PipelineKind;
use megaservice::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file before host names are expanded
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let file = match load_pipeline_file(&args.pipeline_file) {
        Ok(file) => file,
        Err(e) => {
            error!(
                "Failed to load pipeline file {}: {}",
                args.pipeline_file.display(),
                e
            );
            process::exit(1);
        }
    };

    // Dry-run mode: print topology and exit
    if args.dry_run {
        println!("{}", format_dry_run(&file, &args));
        return;
    }

    let base_dir = args.pipeline_file.parent().unwrap_or(Path::new("."));
    let mut gateway = match build_gateway(&file, base_dir) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to assemble megaservice: {}", e);
            process::exit(1);
        }
    };
    if let Some(secs) = args.timeout {
        gateway = gateway.with_timeout(Duration::from_secs(secs));
    }

    let bind_addr = args
        .bind_addr
        .clone()
        .unwrap_or_else(|| file.megaservice.host.clone());
    let port = args.port.unwrap_or(file.megaservice.port);
    let addr = format!("{}:{}", bind_addr, port);

    info!(
        "Starting megaservice '{}' ({}) on {}",
        file.megaservice.name, file.megaservice.kind, addr
    );

    let kind = file.megaservice.kind;
    let state = AppState::new(file.megaservice, gateway);
    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health               - Health check");
    info!("  GET  /v1/list_service      - Pipeline nodes");
    info!("  GET  /v1/list_parameters   - Request parameter defaults");
    match kind {
        PipelineKind::ChatQna => {
            info!("  POST /v1/chat/completions  - OpenAI-compatible chat endpoint");
            info!("  POST /v1/chatqna           - ChatQnA endpoint");
        }
        PipelineKind::AudioQna => info!("  POST /v1/audioqna          - AudioQnA endpoint"),
    }

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
