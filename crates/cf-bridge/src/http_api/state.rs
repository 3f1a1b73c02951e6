use std::sync::Arc;

use cf_core::store::Store;

use crate::auth::TokenVerifier;
use crate::event_bus::ProjectBus;
use crate::orchestrator::Orchestrator;

/// Shared application state for all HTTP/WS handlers.
///
/// Queries read the store directly; commands go through the injected
/// [`Orchestrator`]; the push channel subscribes on the bus. Constructed
/// once at startup by the daemon's dependency container.
pub struct ApiState {
    pub store: Arc<Store>,
    pub bus: Arc<ProjectBus>,
    pub orchestrator: Arc<dyn Orchestrator>,
    #[cfg(feature = "libgit2")]
    pub checkpoints: Arc<cf_core::checkpoint::CheckpointManager>,
    /// `None` disables auth (development mode). The websocket handler uses
    /// this directly because its token arrives in the query string.
    pub verifier: Option<Arc<dyn TokenVerifier>>,
    pub started_at: std::time::Instant,
}
