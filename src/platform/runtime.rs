use anyhow::{Context, Result};
use async_trait::async_trait;
use icmpmon_assignment::Rebalancer;
use icmpmon_evaluator::Evaluator;
use icmpmon_ingest::{Flusher, WriteAheadBuffer};
use icmpmon_model::Store;
use icmpmon_registry::{AgentRegistry, LivenessMonitor, RebalanceHook};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::api;
use crate::platform::config::ControlPlaneConfig;
use crate::platform::context::AppContext;
use crate::platform::telemetry;

/// The fixed set of long-running control-plane services. Each gets a child
/// of the root cancellation token and is joined on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlPlaneService {
    Telemetry,
    HttpApi,
    IngestFlusher,
    Evaluator,
    LivenessMonitor,
}

impl ControlPlaneService {
    const ALL: [ControlPlaneService; 5] = [
        ControlPlaneService::Telemetry,
        ControlPlaneService::HttpApi,
        ControlPlaneService::IngestFlusher,
        ControlPlaneService::Evaluator,
        ControlPlaneService::LivenessMonitor,
    ];

    fn name(self) -> &'static str {
        match self {
            ControlPlaneService::Telemetry => "telemetry",
            ControlPlaneService::HttpApi => "http-api",
            ControlPlaneService::IngestFlusher => "ingest-flusher",
            ControlPlaneService::Evaluator => "evaluator",
            ControlPlaneService::LivenessMonitor => "liveness-monitor",
        }
    }

    fn spawn(self, ctx: AppContext, token: CancellationToken) -> JoinHandle<Result<()>> {
        match self {
            ControlPlaneService::Telemetry => {
                let settings = ctx.config().observability.clone();
                tokio::spawn(telemetry::serve_metrics(settings, token))
            }
            ControlPlaneService::HttpApi => tokio::spawn(serve_api(ctx, token)),
            ControlPlaneService::IngestFlusher => tokio::spawn(async move {
                let flusher = Flusher::new(
                    ctx.buffer().clone(),
                    ctx.store().clone(),
                    ctx.config().ingest.to_flusher_config(),
                );
                flusher.run(token).await;
                Ok(())
            }),
            ControlPlaneService::Evaluator => tokio::spawn(async move {
                let evaluator = Evaluator::new(
                    ctx.store().clone(),
                    ctx.config().evaluator.to_evaluator_config(),
                );
                evaluator.run(token).await;
                Ok(())
            }),
            ControlPlaneService::LivenessMonitor => tokio::spawn(async move {
                let hook = Arc::new(RebalancerHook {
                    rebalancer: ctx.rebalancer().clone(),
                });
                let monitor = LivenessMonitor::new(
                    ctx.store().clone(),
                    ctx.config().liveness.to_liveness_config(),
                    hook,
                );
                monitor.run(token).await;
                Ok(())
            }),
        }
    }
}

/// The agent-facing HTTP API, shut down gracefully with the root token.
async fn serve_api(ctx: AppContext, token: CancellationToken) -> Result<()> {
    let addr = ctx.config().http.listen_addr.clone();
    let app = api::router(ctx);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = addr.as_str(), "http api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            info!("shutting down http api");
        })
        .await?;
    Ok(())
}

/// Control-plane bootstrapper: connects the store and the queue, runs the
/// migrations (fatal on failure), and supervises the service set under one
/// cancellation token.
pub struct ControlPlane {
    config: ControlPlaneConfig,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self { config }
    }

    pub async fn start(self) -> Result<ControlPlaneHandle> {
        let store = Store::connect(&self.config.database.url)
            .await
            .context("postgres connection failed")?;

        // Migration failure is fatal; the process refuses to serve.
        sqlx::migrate!("./migrations")
            .run(store.pool())
            .await
            .context("migrations failed")?;
        info!("migrations applied");

        let redis_client = redis::Client::open(self.config.queue.redis_url.as_str())
            .context("invalid redis url")?;
        let redis_conn = ConnectionManager::new(redis_client)
            .await
            .context("redis connection failed")?;
        let buffer =
            WriteAheadBuffer::new(redis_conn).with_key(self.config.queue.results_key.clone());

        let registry = AgentRegistry::new(store.clone());
        let rebalancer = Rebalancer::new(store.clone());

        let root_token = CancellationToken::new();
        let context = AppContext::new(
            self.config,
            store,
            registry,
            rebalancer,
            buffer,
            root_token.child_token(),
        );

        let mut tasks = Vec::new();
        for service in ControlPlaneService::ALL {
            let handle = service.spawn(context.clone(), root_token.child_token());
            tasks.push((service.name(), handle));
        }

        info!("control plane boot completed");

        Ok(ControlPlaneHandle {
            context,
            cancel_token: root_token,
            tasks,
        })
    }
}

/// Running control plane; shutdown cancels and joins every service.
pub struct ControlPlaneHandle {
    context: AppContext,
    cancel_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl ControlPlaneHandle {
    pub fn context(&self) -> AppContext {
        self.context.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => info!(service = name, "service shutdown cleanly"),
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

/// Bridges liveness transitions into the assignment engine.
pub struct RebalancerHook {
    pub rebalancer: Rebalancer,
}

#[async_trait]
impl RebalanceHook for RebalancerHook {
    async fn on_agent_failure(&self, agent_id: Uuid) {
        if let Err(err) = self.rebalancer.handle_agent_failure(agent_id).await {
            error!(agent = %agent_id, error = %err, "failover rebalance failed");
        }
    }

    async fn on_agent_recovery(&self, agent_id: Uuid) {
        if let Err(err) = self.rebalancer.handle_agent_recovery(agent_id).await {
            error!(agent = %agent_id, error = %err, "recovery rebalance failed");
        }
    }
}
