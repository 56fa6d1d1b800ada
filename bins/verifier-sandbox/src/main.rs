mod handlers;
mod metrics;

use anyhow::{bail, Context};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics::Metrics;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use verifier_runner::{CodeRunner, LocalRunner};

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONCURRENCY: usize = 8;
const DEFAULT_MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_PYTHON: &str = "python3";

pub struct AppState {
    pub runner: Arc<dyn CodeRunner>,
    pub permits: Semaphore,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq)]
struct SandboxConfig {
    bind: String,
    max_concurrency: usize,
    max_request_bytes: usize,
    python: String,
}

impl SandboxConfig {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let config = Self {
            bind: lookup("SANDBOX_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            max_concurrency: parse_var(&lookup, "SANDBOX_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY)?,
            max_request_bytes: parse_var(
                &lookup,
                "SANDBOX_MAX_REQUEST_BYTES",
                DEFAULT_MAX_REQUEST_BYTES,
            )?,
            python: lookup("PYTHON_BIN").unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
        };
        if config.max_concurrency == 0 {
            bail!("SANDBOX_MAX_CONCURRENCY must be at least 1");
        }
        if config.max_request_bytes == 0 {
            bail!("SANDBOX_MAX_REQUEST_BYTES must be at least 1");
        }
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {:?}", name, raw)),
        None => Ok(default),
    }
}

fn routes(state: Arc<AppState>, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/run_code", post(handlers::run_code))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Verifier sandbox booting...");

    let config = SandboxConfig::from_env()?;

    let runner = LocalRunner::new(&config.python);
    if !runner.is_available() {
        warn!(python = %config.python, "Interpreter not found, every run will fail");
    }

    let state = Arc::new(AppState {
        runner: Arc::new(runner),
        permits: Semaphore::new(config.max_concurrency),
        metrics: Metrics::new().context("Failed to register metrics")?,
    });

    let app = routes(state, config.max_request_bytes);

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;

    info!(
        bind = %config.bind,
        max_concurrency = config.max_concurrency,
        max_request_bytes = config.max_request_bytes,
        "HTTP server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal, draining requests");
            }
        })
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
