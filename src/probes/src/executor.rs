//! Executor abstraction and registry.
//!
//! Executors are trait objects selected by type name from assignments. The
//! registry verifies an executor's declared external binaries at
//! registration time and refuses it when one is missing, so an agent keeps
//! running with whatever capabilities its host actually has.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use icmpmon_model::ProbeResult;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::types::{ExecutorCapabilities, ProbeError, ProbeTarget};

/// A probe implementation.
///
/// `execute_batch` is the hot path; executors that cannot batch get
/// single-target calls from the scheduler.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn capabilities(&self) -> ExecutorCapabilities;

    async fn execute(
        &self,
        token: &CancellationToken,
        target: &ProbeTarget,
    ) -> Result<ProbeResult, ProbeError>;

    async fn execute_batch(
        &self,
        token: &CancellationToken,
        targets: &[ProbeTarget],
    ) -> Result<Vec<ProbeResult>, ProbeError>;
}

/// Registry of admitted executors, keyed by type name.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ProbeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an executor after verifying its external dependencies.
    ///
    /// A missing binary refuses registration; callers log and continue
    /// without that capability.
    pub fn register(&mut self, executor: Arc<dyn ProbeExecutor>) -> Result<(), ProbeError> {
        let caps = executor.capabilities();
        for dep in &caps.dependencies {
            if find_binary(dep).is_none() {
                warn!(
                    executor = executor.type_name(),
                    binary = dep.as_str(),
                    "executor refused: dependency not found on PATH"
                );
                return Err(ProbeError::MissingDependency(dep.clone()));
            }
        }

        info!(executor = executor.type_name(), "executor registered");
        self.executors
            .insert(executor.type_name().to_string(), executor);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn ProbeExecutor>> {
        self.executors.get(type_name).cloned()
    }

    /// Type names of every admitted executor, for registration payloads.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Resolves a binary on PATH, requiring the executable bit on unix.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use icmpmon_model::{PingStats, ProbePayload};

    struct NoDepExecutor;

    #[async_trait]
    impl ProbeExecutor for NoDepExecutor {
        fn type_name(&self) -> &'static str {
            "noop"
        }

        fn capabilities(&self) -> ExecutorCapabilities {
            ExecutorCapabilities {
                supports_batching: false,
                max_batch_size: 1,
                requires_privilege: false,
                dependencies: vec![],
            }
        }

        async fn execute(
            &self,
            _token: &CancellationToken,
            target: &ProbeTarget,
        ) -> Result<ProbeResult, ProbeError> {
            Ok(ProbeResult {
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
            })
        }

        async fn execute_batch(
            &self,
            token: &CancellationToken,
            targets: &[ProbeTarget],
        ) -> Result<Vec<ProbeResult>, ProbeError> {
            let mut out = Vec::with_capacity(targets.len());
            for target in targets {
                out.push(self.execute(token, target).await?);
            }
            Ok(out)
        }
    }

    struct ImpossibleDepExecutor;

    #[async_trait]
    impl ProbeExecutor for ImpossibleDepExecutor {
        fn type_name(&self) -> &'static str {
            "impossible"
        }

        fn capabilities(&self) -> ExecutorCapabilities {
            ExecutorCapabilities {
                supports_batching: false,
                max_batch_size: 1,
                requires_privilege: false,
                dependencies: vec!["definitely-not-a-real-binary-name".to_string()],
            }
        }

        async fn execute(
            &self,
            _token: &CancellationToken,
            _target: &ProbeTarget,
        ) -> Result<ProbeResult, ProbeError> {
            unreachable!("never registered")
        }

        async fn execute_batch(
            &self,
            _token: &CancellationToken,
            _targets: &[ProbeTarget],
        ) -> Result<Vec<ProbeResult>, ProbeError> {
            unreachable!("never registered")
        }
    }

    #[test]
    fn registry_admits_executor_without_dependencies() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoDepExecutor)).unwrap();
        assert!(registry.get("noop").is_some());
        assert_eq!(registry.type_names(), vec!["noop".to_string()]);
    }

    #[test]
    fn registry_refuses_executor_with_missing_binary() {
        let mut registry = ExecutorRegistry::new();
        let err = registry
            .register(Arc::new(ImpossibleDepExecutor))
            .unwrap_err();
        assert!(matches!(err, ProbeError::MissingDependency(_)));
        assert!(registry.get("impossible").is_none());
    }

    #[test]
    fn find_binary_locates_a_shell() {
        // Something from coreutils is present on any unix test host.
        assert!(find_binary("sh").is_some() || find_binary("ls").is_some());
        assert!(find_binary("definitely-not-a-real-binary-name").is_none());
    }
}
