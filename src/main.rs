//! LLM Dispatcher Service
//! Routes inference requests to backend LLM services by capability type,
//! with priority-ordered failover, fan-out, and streaming relay.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

mod auth;
mod config;
mod dispatch;
mod handlers;
mod registry;
mod stream;
mod utils;

use config::{Config, RegistryImpl};
use dispatch::DispatchEngine;
use handlers::AppState;
use registry::{file::FileRegistry, memory::MemoryRegistry, EndpointRegistry};
use stream::StreamRelay;

/// LLM Dispatcher Service
#[derive(Parser, Debug)]
#[command(name = "llm-dispatcher")]
#[command(about = "Capability-routing dispatcher for backend LLM services", long_about = None)]
struct Args {
    /// Dispatcher port
    #[arg(long, env = "DISPATCHER_PORT", default_value = "8080")]
    port: u16,

    /// Registry storage backend: memory or file
    #[arg(long, env = "DISPATCHER_REGISTRY_IMPL", default_value = "memory")]
    registry_impl: RegistryImpl,

    /// Registry store path, required with --registry-impl file
    #[arg(long, env = "DISPATCHER_REGISTRY_FILE")]
    registry_file: Option<PathBuf>,

    /// Gate every dispatch behind the toxicity chain
    #[arg(
        long,
        env = "DISPATCHER_TOXICITY_FILTER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    toxicity_filter: bool,

    /// Comma-separated labels the content detection flow may produce
    #[arg(
        long,
        env = "DISPATCHER_DETECT_TYPES",
        default_value = "text,code,sql,summarization,translation"
    )]
    detect_types: String,

    /// Default backend timeout in seconds, overridable per request
    #[arg(long, env = "DISPATCHER_REQUEST_TIMEOUT", default_value = "300")]
    request_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    info!("Starting LLM Dispatcher Service");
    info!("Port: {}", args.port);
    info!("Registry: {:?}", args.registry_impl);

    let config = Config::new(
        args.port,
        args.registry_impl,
        args.registry_file,
        args.toxicity_filter,
        &args.detect_types,
        args.request_timeout,
    )?;

    let registry: Arc<dyn EndpointRegistry> = match config.registry_impl {
        RegistryImpl::Memory => Arc::new(MemoryRegistry::new()),
        RegistryImpl::File => {
            let path = config
                .registry_file
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("--registry-file is required"))?;
            Arc::new(FileRegistry::open(path)?)
        }
    };

    let state = Arc::new(AppState {
        engine: DispatchEngine::new(registry.clone(), &config),
        relay: Arc::new(StreamRelay::new(registry.clone())),
        registry,
        request_timeout: Duration::from_secs(config.request_timeout),
    });

    let app = handlers::create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Dispatcher listening on http://0.0.0.0:{}", config.port);

    // Handle graceful shutdown
    let shutdown_signal = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Dispatcher shutdown complete");
    Ok(())
}
