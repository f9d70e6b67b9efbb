//! Tiered probe scheduler.
//!
//! One cooperative loop per tier wakes at the tier's probe interval, copies
//! the current assignment snapshot under a read lock, fans the targets out
//! to executors in capability-sized chunks and hands results to the shipper
//! channel. Assignment and tier swaps take the write lock only long enough
//! to replace a map, so in-flight probes are never disturbed. An overrun
//! cycle is never queued twice; the next one simply starts late.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use icmpmon_model::{AssignmentView, ProbeResult, Tier};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::ExecutorRegistry;
use crate::metrics;
use crate::types::{ProbeTarget, DEFAULT_EXECUTOR};

/// Per-tier target counts plus the total, as reported by `stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub per_tier: HashMap<String, usize>,
    pub total_targets: usize,
}

#[derive(Default)]
struct ScheduleState {
    tiers: HashMap<String, Tier>,
    /// Assignment groups keyed by tier name
    groups: HashMap<String, Vec<AssignmentView>>,
}

/// Drives probe loops for every configured tier.
pub struct TieredScheduler {
    agent_id: Uuid,
    state: Arc<RwLock<ScheduleState>>,
    registry: Arc<ExecutorRegistry>,
    results_tx: mpsc::Sender<ProbeResult>,
}

impl TieredScheduler {
    pub fn new(
        agent_id: Uuid,
        registry: Arc<ExecutorRegistry>,
        results_tx: mpsc::Sender<ProbeResult>,
    ) -> Self {
        Self {
            agent_id,
            state: Arc::new(RwLock::new(ScheduleState::default())),
            registry,
            results_tx,
        }
    }

    /// Replaces the tier configuration. In-flight probe cycles keep the
    /// snapshot they already copied.
    pub async fn set_tiers(&self, tiers: HashMap<String, Tier>) {
        let mut state = self.state.write().await;
        state.tiers = tiers;
    }

    /// Atomically swaps the per-tier assignment groups for the next cycle.
    pub async fn update_assignments(&self, assignments: Vec<AssignmentView>) {
        let mut groups: HashMap<String, Vec<AssignmentView>> = HashMap::new();
        for assignment in assignments {
            groups
                .entry(assignment.tier.clone())
                .or_default()
                .push(assignment);
        }

        let mut state = self.state.write().await;
        let total: usize = groups.values().map(Vec::len).sum();
        state.groups = groups;
        debug!(targets = total, "assignment snapshot swapped");
    }

    /// Per-tier target counts and totals.
    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.read().await;
        let per_tier: HashMap<String, usize> = state
            .groups
            .iter()
            .map(|(tier, group)| (tier.clone(), group.len()))
            .collect();
        let total_targets = per_tier.values().sum();
        SchedulerStats {
            per_tier,
            total_targets,
        }
    }

    /// Runs until cancellation, reconciling one probe loop per tier.
    ///
    /// Tiers added after startup get a loop on the next reconcile pass;
    /// loops of removed tiers are cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!("tiered scheduler started");
        let mut loops: HashMap<String, CancellationToken> = HashMap::new();
        let mut reconcile = tokio::time::interval(Duration::from_secs(1));
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = reconcile.tick() => {
                    let current: Vec<String> = {
                        let state = self.state.read().await;
                        state.tiers.keys().cloned().collect()
                    };

                    for tier in &current {
                        if !loops.contains_key(tier) {
                            let child = token.child_token();
                            loops.insert(tier.clone(), child.clone());
                            self.spawn_tier_loop(tier.clone(), child);
                        }
                    }

                    loops.retain(|tier, loop_token| {
                        if current.contains(tier) {
                            true
                        } else {
                            info!(tier = tier.as_str(), "tier removed, stopping probe loop");
                            loop_token.cancel();
                            false
                        }
                    });
                }
            }
        }

        for loop_token in loops.values() {
            loop_token.cancel();
        }
        info!("tiered scheduler stopped");
    }

    fn spawn_tier_loop(&self, tier_name: String, token: CancellationToken) {
        let agent_id = self.agent_id;
        let state = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);
        let results_tx = self.results_tx.clone();

        tokio::spawn(async move {
            info!(tier = tier_name.as_str(), "probe loop started");
            let mut period_secs = 0u32;
            let mut ticker = tokio::time::interval(Duration::from_secs(1));

            loop {
                // Rebuild the ticker whenever the tier's interval changes.
                let interval_secs = {
                    let state = state.read().await;
                    match state.tiers.get(&tier_name) {
                        Some(tier) => tier.probe_interval_secs.max(1),
                        None => break,
                    }
                };
                if interval_secs != period_secs {
                    ticker = tokio::time::interval_at(
                        Instant::now() + Duration::from_secs(u64::from(interval_secs)),
                        Duration::from_secs(u64::from(interval_secs)),
                    );
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    period_secs = interval_secs;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let started = Instant::now();
                run_tier_cycle(agent_id, &tier_name, &state, &registry, &results_tx, &token)
                    .await;
                metrics::PROBE_CYCLE_SECONDS.observe(started.elapsed().as_secs_f64());
            }

            info!(tier = tier_name.as_str(), "probe loop stopped");
        });
    }
}

/// Executes one probe cycle for a tier against the current snapshot.
async fn run_tier_cycle(
    agent_id: Uuid,
    tier_name: &str,
    state: &Arc<RwLock<ScheduleState>>,
    registry: &Arc<ExecutorRegistry>,
    results_tx: &mpsc::Sender<ProbeResult>,
    token: &CancellationToken,
) {
    // Copy the snapshot; the lock is never held across probe execution.
    let (tier, assignments) = {
        let state = state.read().await;
        let Some(tier) = state.tiers.get(tier_name) else {
            warn!(tier = tier_name, "tier vanished before its cycle, skipping");
            return;
        };
        let group = state.groups.get(tier_name).cloned().unwrap_or_default();
        (tier.clone(), group)
    };

    if assignments.is_empty() {
        return;
    }

    // Group targets by the executor the assignment names.
    let mut by_executor: HashMap<String, Vec<ProbeTarget>> = HashMap::new();
    for assignment in &assignments {
        let executor = assignment
            .executor
            .clone()
            .unwrap_or_else(|| DEFAULT_EXECUTOR.to_string());
        by_executor.entry(executor).or_default().push(ProbeTarget {
            target_id: assignment.target_id,
            agent_id,
            ip: assignment.ip.clone(),
            timeout_ms: tier.probe_timeout_ms,
            retries: tier.retries,
        });
    }

    for (executor_name, targets) in by_executor {
        let Some(executor) = registry.get(&executor_name) else {
            warn!(
                tier = tier_name,
                executor = executor_name.as_str(),
                "executor not registered, skipping its targets this cycle"
            );
            continue;
        };

        let caps = executor.capabilities();
        let chunk_size = if caps.supports_batching {
            caps.max_batch_size.max(1)
        } else {
            1
        };

        for chunk in targets.chunks(chunk_size) {
            if token.is_cancelled() {
                return;
            }

            match executor.execute_batch(token, chunk).await {
                Ok(results) => {
                    for result in results {
                        if results_tx.send(result).await.is_err() {
                            // Shipper is gone; the agent is shutting down.
                            return;
                        }
                    }
                }
                Err(err) => {
                    metrics::PROBE_BATCH_FAILURES.inc();
                    // Batch-level retries are deliberately absent; the tier's
                    // retry budget already rode along in each probe.
                    error!(
                        tier = tier_name,
                        executor = executor_name.as_str(),
                        batch_first = chunk.first().map(|t| t.ip.as_str()).unwrap_or("-"),
                        batch_last = chunk.last().map(|t| t.ip.as_str()).unwrap_or("-"),
                        batch_len = chunk.len(),
                        error = %err,
                        "probe batch failed, skipping for this cycle"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProbeExecutor;
    use crate::types::{ExecutorCapabilities, ProbeError};
    use async_trait::async_trait;
    use icmpmon_model::{PingStats, ProbePayload, SelectionPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingExecutor {
        batches: AtomicUsize,
        fail: bool,
    }

    impl RecordingExecutor {
        fn new(fail: bool) -> Self {
            Self {
                batches: AtomicUsize::new(0),
                fail,
            }
        }

        fn result_for(target: &ProbeTarget) -> ProbeResult {
            ProbeResult {
                time: chrono::Utc::now(),
                target_id: target.target_id,
                agent_id: target.agent_id,
                success: true,
                error: None,
                payload: ProbePayload::IcmpPing(PingStats {
                    packets_sent: 1,
                    packets_recvd: 1,
                    packet_loss_pct: 0.0,
                    min_rtt_ms: Some(1.0),
                    max_rtt_ms: Some(1.0),
                    avg_rtt_ms: Some(1.0),
                    stddev_rtt_ms: None,
                    latency_ms: Some(1.0),
                    rtts_ms: vec![Some(1.0)],
                }),
            }
        }
    }

    #[async_trait]
    impl ProbeExecutor for RecordingExecutor {
        fn type_name(&self) -> &'static str {
            "icmp_ping"
        }

        fn capabilities(&self) -> ExecutorCapabilities {
            ExecutorCapabilities {
                supports_batching: true,
                max_batch_size: 2,
                requires_privilege: false,
                dependencies: vec![],
            }
        }

        async fn execute(
            &self,
            token: &CancellationToken,
            target: &ProbeTarget,
        ) -> Result<ProbeResult, ProbeError> {
            let mut results = self
                .execute_batch(token, std::slice::from_ref(target))
                .await?;
            Ok(results.remove(0))
        }

        async fn execute_batch(
            &self,
            _token: &CancellationToken,
            targets: &[ProbeTarget],
        ) -> Result<Vec<ProbeResult>, ProbeError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProbeError::EmptyOutput);
            }
            Ok(targets.iter().map(Self::result_for).collect())
        }
    }

    fn tier(name: &str, interval_secs: u32) -> Tier {
        Tier {
            name: name.to_string(),
            probe_interval_secs: interval_secs,
            probe_timeout_ms: 500,
            retries: 1,
            policy: SelectionPolicy::default(),
            expected: None,
            thresholds: None,
        }
    }

    fn assignment(agent_id: Uuid, tier: &str, ip: &str) -> AssignmentView {
        AssignmentView {
            target_id: Uuid::new_v4(),
            agent_id,
            ip: ip.to_string(),
            tier: tier.to_string(),
            executor: None,
        }
    }

    async fn scheduler_with_executor(
        executor: Arc<RecordingExecutor>,
    ) -> (TieredScheduler, mpsc::Receiver<ProbeResult>, Uuid) {
        let agent_id = Uuid::new_v4();
        let mut registry = ExecutorRegistry::new();
        registry.register(executor).unwrap();
        let (tx, rx) = mpsc::channel(64);
        (
            TieredScheduler::new(agent_id, Arc::new(registry), tx),
            rx,
            agent_id,
        )
    }

    #[tokio::test]
    async fn cycle_chunks_by_batch_size_and_forwards_results() {
        let executor = Arc::new(RecordingExecutor::new(false));
        let (scheduler, mut rx, agent_id) =
            scheduler_with_executor(Arc::clone(&executor)).await;

        scheduler
            .set_tiers(HashMap::from([("core".to_string(), tier("core", 30))]))
            .await;
        scheduler
            .update_assignments(vec![
                assignment(agent_id, "core", "10.0.0.1"),
                assignment(agent_id, "core", "10.0.0.2"),
                assignment(agent_id, "core", "10.0.0.3"),
            ])
            .await;

        let token = CancellationToken::new();
        run_tier_cycle(
            agent_id,
            "core",
            &scheduler.state,
            &scheduler.registry,
            &scheduler.results_tx,
            &token,
        )
        .await;

        // Three targets, max batch two: one full chunk plus the remainder.
        assert_eq!(executor.batches.load(Ordering::SeqCst), 2);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn failed_batch_is_skipped_without_retry() {
        let executor = Arc::new(RecordingExecutor::new(true));
        let (scheduler, mut rx, agent_id) =
            scheduler_with_executor(Arc::clone(&executor)).await;

        scheduler
            .set_tiers(HashMap::from([("core".to_string(), tier("core", 30))]))
            .await;
        scheduler
            .update_assignments(vec![assignment(agent_id, "core", "10.0.0.1")])
            .await;

        let token = CancellationToken::new();
        run_tier_cycle(
            agent_id,
            "core",
            &scheduler.state,
            &scheduler.registry,
            &scheduler.results_tx,
            &token,
        )
        .await;

        assert_eq!(executor.batches.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_executor_skips_targets() {
        let executor = Arc::new(RecordingExecutor::new(false));
        let (scheduler, mut rx, agent_id) =
            scheduler_with_executor(Arc::clone(&executor)).await;

        scheduler
            .set_tiers(HashMap::from([("core".to_string(), tier("core", 30))]))
            .await;
        let mut odd = assignment(agent_id, "core", "10.0.0.9");
        odd.executor = Some("teleport".to_string());
        scheduler.update_assignments(vec![odd]).await;

        let token = CancellationToken::new();
        run_tier_cycle(
            agent_id,
            "core",
            &scheduler.state,
            &scheduler.registry,
            &scheduler.results_tx,
            &token,
        )
        .await;

        assert_eq!(executor.batches.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stats_reports_per_tier_counts() {
        let executor = Arc::new(RecordingExecutor::new(false));
        let (scheduler, _rx, agent_id) = scheduler_with_executor(executor).await;

        scheduler
            .update_assignments(vec![
                assignment(agent_id, "core", "10.0.0.1"),
                assignment(agent_id, "core", "10.0.0.2"),
                assignment(agent_id, "edge", "10.0.1.1"),
            ])
            .await;

        let stats = scheduler.stats().await;
        assert_eq!(stats.total_targets, 3);
        assert_eq!(stats.per_tier.get("core"), Some(&2));
        assert_eq!(stats.per_tier.get("edge"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn run_executes_cycles_until_cancelled() {
        let executor = Arc::new(RecordingExecutor::new(false));
        let (scheduler, mut rx, agent_id) =
            scheduler_with_executor(Arc::clone(&executor)).await;

        scheduler
            .set_tiers(HashMap::from([("core".to_string(), tier("core", 5))]))
            .await;
        scheduler
            .update_assignments(vec![assignment(agent_id, "core", "10.0.0.1")])
            .await;

        let scheduler = Arc::new(scheduler);
        let token = CancellationToken::new();
        let run_token = token.clone();
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(run_token).await })
        };

        let first = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("a probe cycle should have run")
            .expect("channel open");
        assert_eq!(first.agent_id, agent_id);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(60), runner)
            .await
            .expect("scheduler should stop on cancellation")
            .unwrap();
    }
}
