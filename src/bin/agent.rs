use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use icmpmon_core::client::ControlPlaneClient;
use icmpmon_core::AgentSettings;
use icmpmon_probes::{ExecutorRegistry, FpingExecutor, MtrExecutor, ProbeTarget, TieredScheduler};
use icmpmon_registry::types::CommandResultBody;
use icmpmon_registry::{AgentRegistration, Heartbeat};
use icmpmon_shipper::{ResultShipper, ShipperStats};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "agent", author, version, about = "icmp-mon probing agent")]
struct Args {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control plane base URL
    #[arg(long = "control-plane")]
    control_plane: Option<String>,

    /// Bearer token for the control plane
    #[arg(long)]
    token: Option<String>,

    /// Agent name (unique)
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    region: Option<String>,

    #[arg(long)]
    location: Option<String>,

    #[arg(long)]
    provider: Option<String>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let mut settings = AgentSettings::load_from_path(args.config.as_ref())?;
    if let Some(url) = args.control_plane {
        settings.control_plane.url = url;
    }
    if let Some(token) = args.token {
        settings.control_plane.token = Some(token);
    }
    if let Some(name) = args.name {
        settings.name = name;
    }
    if let Some(region) = args.region {
        settings.region = region;
    }
    if let Some(location) = args.location {
        settings.location = location;
    }
    if let Some(provider) = args.provider {
        settings.provider = provider;
    }

    let log_level = if args.debug {
        "debug".to_string()
    } else {
        settings.observability.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();
    settings.validate()?;

    info!(name = settings.name.as_str(), "starting icmp-mon agent");

    // Executors degrade gracefully: a missing binary only costs the
    // capability.
    let mut registry = ExecutorRegistry::new();
    if let Err(err) = registry.register(Arc::new(FpingExecutor::new())) {
        warn!(error = %err, "icmp_ping executor unavailable");
    }
    if let Err(err) = registry.register(Arc::new(MtrExecutor::new())) {
        warn!(error = %err, "mtr executor unavailable");
    }
    if registry.is_empty() {
        anyhow::bail!("no probe executors available; install fping or mtr");
    }
    let registry = Arc::new(registry);

    let client = ControlPlaneClient::new(
        &settings.control_plane.url,
        settings.control_plane.token.clone(),
    )?;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            token.cancel();
        });
    }

    let agent_id = register_with_retry(&client, &settings, &registry, &token).await?;
    info!(agent_id = %agent_id, "registered with control plane");

    let (results_tx, results_rx) = mpsc::channel(4096);
    let shipper = Arc::new(ResultShipper::new(
        agent_id,
        settings.shipper.to_shipper_config(&settings.control_plane),
    )?);
    let stats = shipper.stats();

    let scheduler = Arc::new(TieredScheduler::new(
        agent_id,
        Arc::clone(&registry),
        results_tx,
    ));

    let shipper_task = {
        let shipper = Arc::clone(&shipper);
        let token = token.child_token();
        tokio::spawn(async move { shipper.run(results_rx, token).await })
    };
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        let token = token.child_token();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    control_loop(
        &client,
        agent_id,
        &settings,
        &scheduler,
        &registry,
        &stats,
        &token,
    )
    .await;

    let _ = scheduler_task.await;
    let _ = shipper_task.await;
    info!("agent stopped");
    Ok(())
}

/// Registration retries with doubling backoff until the control plane
/// answers or shutdown wins.
async fn register_with_retry(
    client: &ControlPlaneClient,
    settings: &AgentSettings,
    registry: &ExecutorRegistry,
    token: &CancellationToken,
) -> Result<Uuid> {
    let registration = AgentRegistration {
        name: settings.name.clone(),
        region: settings.region.clone(),
        location: settings.location.clone(),
        provider: settings.provider.clone(),
        tags: settings.tags.clone(),
        public_ip: settings.public_ip.clone(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        executors: registry.type_names(),
        max_targets: settings.max_targets,
    };

    let mut backoff = Duration::from_secs(1);
    loop {
        if token.is_cancelled() {
            anyhow::bail!("shutdown before registration completed");
        }
        match client.register(&registration).await {
            Ok(agent_id) => return Ok(agent_id),
            Err(err) => {
                warn!(error = %err, retry_in_secs = backoff.as_secs(), "registration failed");
                tokio::select! {
                    _ = token.cancelled() => anyhow::bail!("shutdown before registration completed"),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        }
    }
}

/// Heartbeat loop: reports runtime counters, pulls the schedule when the
/// control plane says it is stale, and runs any pending commands.
async fn control_loop(
    client: &ControlPlaneClient,
    agent_id: Uuid,
    settings: &AgentSettings,
    scheduler: &Arc<TieredScheduler>,
    registry: &Arc<ExecutorRegistry>,
    stats: &Arc<ShipperStats>,
    token: &CancellationToken,
) {
    let mut version_seen: i64 = 0;

    // Initial schedule, before the first heartbeat fires.
    match apply_assignments(client, agent_id, scheduler).await {
        Ok(version) => version_seen = version,
        Err(err) => warn!(error = %err, "initial assignment fetch failed"),
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(
        settings.heartbeat_interval_secs.max(1),
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = stats.snapshot();
        let sched_stats = scheduler.stats().await;
        let heartbeat = Heartbeat {
            queue_depth: snapshot.depth.min(i32::MAX as u64) as i32,
            shipped_total: snapshot.shipped as i64,
            failed_total: snapshot.failed as i64,
            memory_bytes: resident_memory_bytes(),
            task_count: Some(sched_stats.total_targets.min(i32::MAX as usize) as i32),
            assignment_version_seen: version_seen,
            public_ip: settings.public_ip.clone(),
        };

        let response = match client.heartbeat(agent_id, &heartbeat).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "heartbeat failed");
                continue;
            }
        };

        if response.assignment_stale {
            match apply_assignments(client, agent_id, scheduler).await {
                Ok(version) => version_seen = version,
                Err(err) => warn!(error = %err, "assignment refresh failed"),
            }
        }

        for command in response.commands {
            let client = client.clone();
            let registry = Arc::clone(registry);
            let token = token.child_token();
            tokio::spawn(async move {
                run_command(client, agent_id, registry, command, token).await;
            });
        }
    }
}

async fn apply_assignments(
    client: &ControlPlaneClient,
    agent_id: Uuid,
    scheduler: &Arc<TieredScheduler>,
) -> Result<i64> {
    let response = client.assignments(agent_id, None).await?;
    info!(
        version = response.version,
        assignments = response.assignments.len(),
        tiers = response.tiers.len(),
        "assignments refreshed"
    );
    scheduler.set_tiers(response.tiers).await;
    scheduler.update_assignments(response.assignments).await;
    Ok(response.version)
}

/// Executes one fan-out command via the matching executor and posts the
/// outcome back.
async fn run_command(
    client: ControlPlaneClient,
    agent_id: Uuid,
    registry: Arc<ExecutorRegistry>,
    command: icmpmon_model::Command,
    token: CancellationToken,
) {
    let started = std::time::Instant::now();
    let body = match registry.get(&command.command_type) {
        Some(executor) => {
            let target = ProbeTarget {
                target_id: Uuid::nil(),
                agent_id,
                ip: command.target_ip.clone(),
                timeout_ms: 30_000,
                retries: 0,
            };
            match executor.execute(&token, &target).await {
                Ok(result) => CommandResultBody {
                    success: result.success,
                    error: result.error,
                    payload: serde_json::to_value(&result.payload).ok(),
                    duration_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                },
                Err(err) => CommandResultBody {
                    success: false,
                    error: Some(err.to_string()),
                    payload: None,
                    duration_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                },
            }
        }
        None => CommandResultBody {
            success: false,
            error: Some(format!("no executor for {}", command.command_type)),
            payload: None,
            duration_ms: None,
        },
    };

    if let Err(err) = client.post_command_result(agent_id, command.id, &body).await {
        error!(command = %command.id, error = %err, "command result delivery failed");
    }
}

/// Resident set size from /proc, for the heartbeat report.
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<i64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: i64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<i64> {
    None
}
