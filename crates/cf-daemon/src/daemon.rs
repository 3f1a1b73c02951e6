//! Daemon wiring — the dependency container constructed at startup.
//!
//! Everything is built here and handed down explicitly: store (with its
//! change-notification lane), event bus, store-change forwarder, worker
//! factory, quality gates, the coordinator hub, the checkpoint manager,
//! and finally the router. No component reaches for a global.

use std::sync::Arc;

use anyhow::{Context, Result};

use cf_agents::gates::QualityGate;
use cf_agents::hub::CoordinatorHub;
use cf_agents::worker::DefaultWorkerFactory;
use cf_bridge::auth::{StaticTokenVerifier, TokenVerifier};
use cf_bridge::event_bus::ProjectBus;
use cf_bridge::forwarder::spawn_store_forwarder;
use cf_bridge::http_api::{api_router, ApiState};
use cf_core::checkpoint::CheckpointManager;
use cf_core::config::Config;
use cf_core::store::Store;
use cf_core::workspace::WorkspaceLocks;
use cf_harness::provider::CompletionProvider;

pub struct Daemon {
    state: Arc<ApiState>,
    hub: Arc<CoordinatorHub>,
    _forwarder: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// Build the daemon with the default quality gates.
    pub async fn new(config: Config, provider: Arc<dyn CompletionProvider>) -> Result<Self> {
        Self::with_gates(config, provider, QualityGate::with_default_executors()).await
    }

    /// Build the daemon with injected gates (tests script these).
    pub async fn with_gates(
        config: Config,
        provider: Arc<dyn CompletionProvider>,
        gates: QualityGate,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.workspaces_root)
            .await
            .with_context(|| format!("creating workspaces root {:?}", config.workspaces_root))?;
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating database directory {:?}", parent))?;
            }
        }

        let (change_tx, change_rx) = flume::unbounded();
        let store = Arc::new(
            Store::open(&config.database_path)
                .await
                .context("opening store")?
                .with_notifier(change_tx),
        );

        let bus = Arc::new(ProjectBus::new(
            config.subscriber_queue_size,
            config.subscriber_eviction_ticks,
        ));
        let forwarder = spawn_store_forwarder(change_rx, bus.clone());

        let locks = Arc::new(WorkspaceLocks::new());
        let factory = Arc::new(DefaultWorkerFactory::new(
            provider.clone(),
            bus.clone(),
            locks.clone(),
        ));
        let hub = Arc::new(CoordinatorHub::new(
            store.clone(),
            bus.clone(),
            provider,
            factory,
            Arc::new(gates),
            locks.clone(),
            config.clone(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(store.clone(), locks));

        let verifier: Option<Arc<dyn TokenVerifier>> = config
            .api_token
            .as_ref()
            .map(|token| Arc::new(StaticTokenVerifier::new(token.clone())) as Arc<dyn TokenVerifier>);

        let state = Arc::new(ApiState {
            store,
            bus: bus.clone(),
            orchestrator: hub.clone(),
            checkpoints,
            verifier,
            started_at: std::time::Instant::now(),
        });

        // wiring complete; the readiness probe may now answer
        bus.mark_ready();

        Ok(Self {
            state,
            hub,
            _forwarder: forwarder,
        })
    }

    pub fn api_state(&self) -> Arc<ApiState> {
        self.state.clone()
    }

    pub fn router(&self) -> axum::Router {
        api_router(self.state.clone())
    }

    /// Serve until the listener errors or shutdown is requested.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "HTTP surface serving");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("serving HTTP")?;
        self.hub.shutdown().await;
        tracing::info!("daemon stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
