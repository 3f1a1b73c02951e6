//! CodeFRAME daemon — builds the dependency container and serves the
//! HTTP/WS surface.

use std::sync::Arc;

use anyhow::{Context, Result};

use cf_core::config::Config;
use cf_harness::provider::{CompletionProvider, StubProvider};

use cf_daemon::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    cf_telemetry::logging::init_logging("cf-daemon", "info");

    tracing::info!(
        database = %config.database_path.display(),
        workspaces = %config.workspaces_root.display(),
        bind = %config.backend_bind,
        max_concurrent = config.max_concurrent_agents,
        mode = ?config.deployment_mode,
        "cf-daemon starting"
    );

    // The LLM SDK is an external collaborator; without one wired in, the
    // stub refuses completions and sessions fail fast on their first task.
    let provider: Arc<dyn CompletionProvider> = Arc::new(StubProvider);
    if config.provider_api_key.is_none() {
        tracing::warn!("PROVIDER_API_KEY is not set; completion calls will be refused");
    }

    let daemon = Daemon::new(config.clone(), provider)
        .await
        .context("building daemon")?;

    let listener = tokio::net::TcpListener::bind(&config.backend_bind)
        .await
        .with_context(|| format!("binding {}", config.backend_bind))?;

    daemon.run_with_listener(listener).await
}
