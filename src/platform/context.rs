use std::sync::Arc;

use icmpmon_assignment::Rebalancer;
use icmpmon_ingest::WriteAheadBuffer;
use icmpmon_model::Store;
use icmpmon_registry::AgentRegistry;
use tokio_util::sync::CancellationToken;

use crate::platform::config::ControlPlaneConfig;

/// Shared state every control-plane service and HTTP handler sees; cheap to
/// clone.
#[derive(Clone)]
pub struct AppContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

struct SharedState {
    config: ControlPlaneConfig,
    store: Store,
    registry: AgentRegistry,
    rebalancer: Rebalancer,
    buffer: WriteAheadBuffer,
}

impl AppContext {
    pub(crate) fn new(
        config: ControlPlaneConfig,
        store: Store,
        registry: AgentRegistry,
        rebalancer: Rebalancer,
        buffer: WriteAheadBuffer,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = SharedState {
            config,
            store,
            registry,
            rebalancer,
            buffer,
        };

        Self {
            shared: Arc::new(shared),
            shutdown,
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.shared.registry
    }

    pub fn rebalancer(&self) -> &Rebalancer {
        &self.shared.rebalancer
    }

    pub fn buffer(&self) -> &WriteAheadBuffer {
        &self.shared.buffer
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
