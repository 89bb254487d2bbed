//! Glimpse server: HTTP front end for the model registry and dispatch engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use glimpse_core::{Catalog, DeviceMap, EngineConfig, Governor, HubLoader};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Image captioning and text generation server")]
struct Args {
    /// Host address to bind the server to
    #[arg(long, env = "GLIMPSE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "GLIMPSE_PORT", default_value_t = 5000)]
    port: u16,

    /// Runtime worker threads
    #[arg(long, env = "GLIMPSE_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Threads available to model loading and inference
    #[arg(long, env = "GLIMPSE_BLOCKING_THREADS", default_value_t = 16)]
    blocking_threads: usize,

    /// Use CPU instead of GPU
    #[arg(long, env = "GLIMPSE_CPU")]
    cpu: bool,

    /// Device to place weights on: `cpu` or a GPU ordinal
    #[arg(long, env = "GLIMPSE_DEVICE", default_value = "0")]
    device: DeviceMap,

    /// Model to load at startup; may be repeated
    #[arg(long, env = "GLIMPSE_PRELOAD", value_delimiter = ',')]
    preload: Vec<String>,

    /// Upper bound for one request, in seconds
    #[arg(long, env = "GLIMPSE_REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    request_timeout_secs: u64,

    /// Memory units shared by loading and loaded models
    #[arg(long, env = "GLIMPSE_MEMORY_BUDGET", default_value_t = 8)]
    memory_budget: u32,

    #[arg(long, env = "GLIMPSE_MAX_IMAGE_BYTES", default_value_t = 50 * 1024 * 1024)]
    max_image_bytes: usize,

    #[arg(long, env = "GLIMPSE_MAX_PROMPT_CHARS", default_value_t = 8192)]
    max_prompt_chars: usize,

    #[arg(long, env = "GLIMPSE_MAX_NEW_TOKENS", default_value_t = 1024)]
    max_new_tokens_ceiling: usize,

    /// Requests served at once; the rest are turned away with 503
    #[arg(long, env = "GLIMPSE_MAX_CONCURRENT_REQUESTS", default_value_t = 4)]
    max_concurrent_requests: usize,

    /// Sampling seed for text generation
    #[arg(long, env = "GLIMPSE_SEED", default_value_t = 299_792_458)]
    seed: u64,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            memory_budget: self.memory_budget,
            max_image_bytes: self.max_image_bytes,
            max_prompt_chars: self.max_prompt_chars,
            max_new_tokens_ceiling: self.max_new_tokens_ceiling,
            max_concurrent_requests: self.max_concurrent_requests,
            seed: self.seed,
            device_map: if self.cpu {
                DeviceMap::ForceCpu
            } else {
                self.device
            },
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "glimpse_server=info,glimpse_core=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.workers.max(1))
        .max_blocking_threads(args.blocking_threads.max(1))
        .enable_all()
        .build()?
        .block_on(serve(args))
}

async fn serve(args: Args) -> Result<()> {
    let config = args.engine_config();
    info!(device = ?config.device_map, budget = config.memory_budget, "starting glimpse server");

    let loader = HubLoader::new(config.device_map, config.seed)?;
    let catalog = Arc::new(Catalog::builtin());
    let governor = Governor::new(&config, catalog, Arc::new(loader))?;
    let state = AppState::new(governor);

    for key in args.preload.iter().filter(|key| !key.trim().is_empty()) {
        let registry = state.governor.registry().clone();
        let key = key.trim().to_string();
        tokio::spawn(async move {
            match registry.preload(&key).await {
                Ok(()) => info!(model = %key, "preloaded"),
                Err(err) => warn!(model = %key, error = %err, "preload failed"),
            }
        });
    }

    let app = api::create_router(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
