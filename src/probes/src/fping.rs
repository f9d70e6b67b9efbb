//! Bulk ICMP executor backed by the external `fping` binary.
//!
//! One invocation probes up to `MAX_BATCH` targets:
//! `fping -C <count> -q -t <timeout_ms> -p <interval_ms> -B 1 <ip>…`.
//! With `-C -q` fping prints one summary line per target, on stderr, in the
//! form `IP : v1 v2 … vN` where each value is an RTT in milliseconds or the
//! `-` sentinel for a lost packet. Both output streams are parsed so the
//! stream choice stays an fping implementation detail.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use icmpmon_model::{PingStats, ProbePayload, ProbeResult};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::ProbeExecutor;
use crate::metrics;
use crate::types::{ExecutorCapabilities, ProbeError, ProbeTarget};

/// Largest target count per fping invocation.
pub const MAX_BATCH: usize = 500;

const DEFAULT_PACKET_INTERVAL_MS: u32 = 500;

/// `fping`-based ICMP executor.
pub struct FpingExecutor {
    binary: String,
    packet_interval_ms: u32,
}

impl FpingExecutor {
    pub fn new() -> Self {
        Self {
            binary: "fping".to_string(),
            packet_interval_ms: DEFAULT_PACKET_INTERVAL_MS,
        }
    }

    /// Overrides the binary path, for hosts that ship fping off-PATH.
    pub fn with_binary<S: Into<String>>(mut self, binary: S) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run_fping(
        &self,
        token: &CancellationToken,
        targets: &[ProbeTarget],
    ) -> Result<String, ProbeError> {
        // Every target in a chunk shares its tier's budget; take the widest
        // so mixed chunks never cut a slower tier short.
        let count = targets.iter().map(ProbeTarget::packet_count).max().unwrap_or(1);
        let timeout_ms = targets.iter().map(|t| t.timeout_ms).max().unwrap_or(1_000);

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-C")
            .arg(count.to_string())
            .arg("-q")
            .arg("-t")
            .arg(timeout_ms.to_string())
            .arg("-p")
            .arg(self.packet_interval_ms.to_string())
            .arg("-B")
            .arg("1");
        for target in targets {
            cmd.arg(&target.ip);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        // Subprocess bound: the full packet train plus the final timeout,
        // doubled, so a wedged fping cannot stall the tier loop.
        let budget_ms = (u64::from(count) * u64::from(self.packet_interval_ms)
            + u64::from(timeout_ms))
            * 2
            + 5_000;

        let output = tokio::select! {
            _ = token.cancelled() => return Err(ProbeError::Cancelled),
            result = tokio::time::timeout(Duration::from_millis(budget_ms), cmd.output()) => {
                match result {
                    Ok(output) => output?,
                    Err(_) => return Err(ProbeError::Timeout(budget_ms)),
                }
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        // fping exits non-zero whenever any target was unreachable; output
        // present means the run itself worked.
        if text.trim().is_empty() {
            return Err(ProbeError::EmptyOutput);
        }

        debug!(targets = targets.len(), exit = ?output.status.code(), "fping batch finished");
        Ok(text)
    }
}

impl Default for FpingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeExecutor for FpingExecutor {
    fn type_name(&self) -> &'static str {
        "icmp_ping"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supports_batching: true,
            max_batch_size: MAX_BATCH,
            requires_privilege: false,
            dependencies: vec![self.binary.clone()],
        }
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        target: &ProbeTarget,
    ) -> Result<ProbeResult, ProbeError> {
        let mut results = self.execute_batch(token, std::slice::from_ref(target)).await?;
        results
            .pop()
            .ok_or_else(|| ProbeError::Parse("fping returned no result".to_string()))
    }

    async fn execute_batch(
        &self,
        token: &CancellationToken,
        targets: &[ProbeTarget],
    ) -> Result<Vec<ProbeResult>, ProbeError> {
        let output = self.run_fping(token, targets).await?;
        let results = parse_batch_output(&output, targets);
        metrics::PROBES_EXECUTED.inc_by(results.len() as u64);
        Ok(results)
    }
}

/// Parses a full fping run into one result per requested target.
///
/// Targets absent from the output get a synthetic 100%-loss result; lines
/// for unrequested IPs are ignored.
pub fn parse_batch_output(output: &str, targets: &[ProbeTarget]) -> Vec<ProbeResult> {
    let mut per_ip: HashMap<&str, Vec<Option<f64>>> = HashMap::new();
    for line in output.lines() {
        if let Some((ip, rtts)) = parse_summary_line(line) {
            per_ip.insert(ip, rtts);
        }
    }

    let now = Utc::now();
    targets
        .iter()
        .map(|target| {
            let rtts = per_ip
                .get(target.ip.as_str())
                .cloned()
                .unwrap_or_else(|| vec![None; target.packet_count() as usize]);

            let stats = compute_ping_stats(rtts);
            let success = stats.packets_recvd > 0;
            let error = if success {
                None
            } else {
                Some(format!(
                    "100% packet loss ({} packets sent)",
                    stats.packets_sent
                ))
            };

            ProbeResult {
                time: now,
                target_id: target.target_id,
                agent_id: target.agent_id,
                success,
                error,
                payload: ProbePayload::IcmpPing(stats),
            }
        })
        .collect()
}

/// Parses one `IP : v1 v2 … vN` summary line. Returns `None` for anything
/// that is not a summary line (warnings, blank lines).
fn parse_summary_line(line: &str) -> Option<(&str, Vec<Option<f64>>)> {
    // The separator is " : " rather than ':' so v6 addresses stay intact.
    let (ip, values) = line.split_once(" : ")?;
    let ip = ip.trim();
    if ip.is_empty() || ip.contains(' ') {
        return None;
    }

    let rtts: Vec<Option<f64>> = values
        .split_whitespace()
        .map(|token| token.parse::<f64>().ok())
        .collect();
    if rtts.is_empty() {
        return None;
    }
    Some((ip, rtts))
}

/// Aggregates a per-packet RTT list into probe statistics.
pub fn compute_ping_stats(rtts: Vec<Option<f64>>) -> PingStats {
    let packets_sent = rtts.len() as u32;
    let received: Vec<f64> = rtts.iter().filter_map(|rtt| *rtt).collect();
    let packets_recvd = received.len() as u32;

    let packet_loss_pct = if packets_sent == 0 {
        100.0
    } else {
        f64::from(packets_sent - packets_recvd) / f64::from(packets_sent) * 100.0
    };

    let min_rtt_ms = received.iter().copied().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.min(v)))
    });
    let max_rtt_ms = received.iter().copied().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.max(v)))
    });
    let avg_rtt_ms = if received.is_empty() {
        None
    } else {
        Some(received.iter().sum::<f64>() / received.len() as f64)
    };

    // Unbiased sample stddev; undefined below two observations.
    let stddev_rtt_ms = if received.len() >= 2 {
        let mean = avg_rtt_ms.unwrap_or(0.0);
        let var = received.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (received.len() - 1) as f64;
        Some(var.sqrt())
    } else {
        None
    };

    let latency_ms = received.last().copied();

    PingStats {
        packets_sent,
        packets_recvd,
        packet_loss_pct,
        min_rtt_ms,
        max_rtt_ms,
        avg_rtt_ms,
        stddev_rtt_ms,
        latency_ms,
        rtts_ms: rtts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn target(ip: &str, retries: u32) -> ProbeTarget {
        ProbeTarget {
            target_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            ip: ip.to_string(),
            timeout_ms: 1_000,
            retries,
        }
    }

    fn ping_stats(result: &ProbeResult) -> &PingStats {
        match &result.payload {
            ProbePayload::IcmpPing(stats) => stats,
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn all_success_batch() {
        let targets = vec![target("8.8.8.8", 2)];
        let results = parse_batch_output("8.8.8.8 : 12.45 13.22 11.80", &targets);
        assert_eq!(results.len(), 1);

        let result = &results[0];
        assert!(result.success);
        assert!(result.error.is_none());

        let stats = ping_stats(result);
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_recvd, 3);
        assert_eq!(stats.packet_loss_pct, 0.0);
        assert_eq!(stats.min_rtt_ms, Some(11.80));
        assert_eq!(stats.max_rtt_ms, Some(13.22));
        assert!((stats.avg_rtt_ms.unwrap() - 12.49).abs() < 0.01);
        assert_eq!(stats.latency_ms, Some(11.80));
    }

    #[test]
    fn partial_loss_batch() {
        let targets = vec![target("1.1.1.1", 2)];
        let results = parse_batch_output("1.1.1.1 : 5.5 - 6.2", &targets);

        let stats = ping_stats(&results[0]);
        assert!(results[0].success);
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_recvd, 2);
        assert!((stats.packet_loss_pct - 33.333).abs() < 0.01);
        assert_eq!(stats.min_rtt_ms, Some(5.5));
        assert_eq!(stats.max_rtt_ms, Some(6.2));
    }

    #[test]
    fn total_loss_batch() {
        let targets = vec![target("10.0.0.99", 2)];
        let results = parse_batch_output("10.0.0.99 : - - -", &targets);

        let result = &results[0];
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("100% packet loss (3 packets sent)")
        );

        let stats = ping_stats(result);
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_recvd, 0);
        assert_eq!(stats.packet_loss_pct, 100.0);
        assert_eq!(stats.latency_ms, None);
    }

    #[test]
    fn quarter_loss_arithmetic() {
        // Four packets, one lost: 25% within 1e-6.
        let stats = compute_ping_stats(vec![Some(4.1), Some(4.3), None, Some(4.2)]);
        assert_eq!(stats.packets_sent, 4);
        assert_eq!(stats.packets_recvd, 3);
        assert!((stats.packet_loss_pct - 25.0).abs() < 1e-6);
    }

    #[test]
    fn missing_ip_gets_synthetic_total_loss() {
        let targets = vec![target("8.8.8.8", 1), target("9.9.9.9", 1)];
        let results = parse_batch_output("8.8.8.8 : 1.0 2.0", &targets);
        assert_eq!(results.len(), 2);

        let missing = &results[1];
        assert!(!missing.success);
        let stats = ping_stats(missing);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.packet_loss_pct, 100.0);
        assert_eq!(stats.rtts_ms, vec![None, None]);
    }

    #[test]
    fn warning_lines_are_ignored() {
        let targets = vec![target("8.8.8.8", 0)];
        let output = "ICMP Host Unreachable from 10.0.0.1\n8.8.8.8 : 3.3";
        let results = parse_batch_output(output, &targets);
        assert!(results[0].success);
        assert_eq!(ping_stats(&results[0]).latency_ms, Some(3.3));
    }

    #[test]
    fn stddev_is_unbiased_and_absent_below_two_samples() {
        let one = compute_ping_stats(vec![Some(5.0)]);
        assert_eq!(one.stddev_rtt_ms, None);

        let stats = compute_ping_stats(vec![Some(2.0), Some(4.0)]);
        // Sample variance of {2,4} is 2; stddev sqrt(2).
        assert!((stats.stddev_rtt_ms.unwrap() - 2.0_f64.sqrt()).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn loss_pct_matches_sent_and_received(pattern in proptest::collection::vec(any::<bool>(), 1..32)) {
            let rtts: Vec<Option<f64>> = pattern
                .iter()
                .map(|ok| if *ok { Some(1.0) } else { None })
                .collect();
            let stats = compute_ping_stats(rtts);

            let sent = pattern.len() as u32;
            let recvd = pattern.iter().filter(|ok| **ok).count() as u32;
            prop_assert_eq!(stats.packets_sent, sent);
            prop_assert_eq!(stats.packets_recvd, recvd);

            let expected = f64::from(sent - recvd) / f64::from(sent) * 100.0;
            prop_assert!((stats.packet_loss_pct - expected).abs() < 1e-6);
            prop_assert!(stats.packet_loss_pct >= 0.0 && stats.packet_loss_pct <= 100.0);
        }

        #[test]
        fn min_never_exceeds_max(values in proptest::collection::vec(0.1f64..1000.0, 2..16)) {
            let rtts: Vec<Option<f64>> = values.iter().copied().map(Some).collect();
            let stats = compute_ping_stats(rtts);
            prop_assert!(stats.min_rtt_ms.unwrap() <= stats.max_rtt_ms.unwrap());
            prop_assert!(stats.stddev_rtt_ms.unwrap() >= 0.0);
        }
    }
}
