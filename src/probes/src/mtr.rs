//! Path-trace executor backed by the external `mtr` binary.
//!
//! Single-target only; the scheduler never batches it. Also used directly by
//! the command poller to answer on-demand trace requests from the control
//! plane.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use icmpmon_model::{MtrHop, MtrTrace, ProbePayload, ProbeResult};
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::executor::ProbeExecutor;
use crate::types::{ExecutorCapabilities, ProbeError, ProbeTarget};

/// Host string mtr prints for hops that never answered.
const UNKNOWN_HOST: &str = "???";

const DEFAULT_REPORT_CYCLES: u32 = 10;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// `mtr`-based trace executor.
pub struct MtrExecutor {
    binary: String,
    report_cycles: u32,
    timeout: Duration,
}

impl MtrExecutor {
    pub fn new() -> Self {
        Self {
            binary: "mtr".to_string(),
            report_cycles: DEFAULT_REPORT_CYCLES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one trace against `ip` and parses the JSON report.
    pub async fn trace(
        &self,
        token: &CancellationToken,
        ip: &str,
    ) -> Result<MtrTrace, ProbeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--json")
            .arg("--no-dns")
            .arg("-c")
            .arg(self.report_cycles.to_string())
            .arg(ip)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = token.cancelled() => return Err(ProbeError::Cancelled),
            result = tokio::time::timeout(self.timeout, cmd.output()) => {
                match result {
                    Ok(output) => output?,
                    Err(_) => return Err(ProbeError::Timeout(self.timeout.as_millis() as u64)),
                }
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(ProbeError::EmptyOutput);
        }

        parse_report(&stdout)
    }
}

impl Default for MtrExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeExecutor for MtrExecutor {
    fn type_name(&self) -> &'static str {
        "mtr"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supports_batching: false,
            max_batch_size: 1,
            requires_privilege: false,
            dependencies: vec![self.binary.clone()],
        }
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        target: &ProbeTarget,
    ) -> Result<ProbeResult, ProbeError> {
        let trace = self.trace(token, &target.ip).await?;
        let success = trace.reached;
        let error = if success {
            None
        } else {
            Some(format!("destination {} not reached", target.ip))
        };

        Ok(ProbeResult {
            time: Utc::now(),
            target_id: target.target_id,
            agent_id: target.agent_id,
            success,
            error,
            payload: ProbePayload::Mtr(trace),
        })
    }

    async fn execute_batch(
        &self,
        token: &CancellationToken,
        targets: &[ProbeTarget],
    ) -> Result<Vec<ProbeResult>, ProbeError> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.execute(token, target).await?);
        }
        Ok(results)
    }
}

// mtr's JSON report shape; field names are mtr's, not ours.
#[derive(Debug, Deserialize)]
struct RawReport {
    report: RawReportBody,
}

#[derive(Debug, Deserialize)]
struct RawReportBody {
    hubs: Vec<RawHub>,
}

#[derive(Debug, Deserialize)]
struct RawHub {
    count: u32,
    host: String,
    #[serde(rename = "Loss%")]
    loss_pct: f64,
    #[serde(rename = "Snt")]
    sent: u32,
    #[serde(rename = "Best")]
    best_ms: f64,
    #[serde(rename = "Avg")]
    avg_ms: f64,
    #[serde(rename = "Wrst")]
    worst_ms: f64,
    #[serde(rename = "StDev")]
    stddev_ms: f64,
}

/// Parses the mtr JSON report into a typed trace.
pub fn parse_report(json: &str) -> Result<MtrTrace, ProbeError> {
    let raw: RawReport =
        serde_json::from_str(json).map_err(|err| ProbeError::Parse(err.to_string()))?;

    let hops: Vec<MtrHop> = raw
        .report
        .hubs
        .into_iter()
        .map(|hub| {
            let recv =
                (f64::from(hub.sent) * (1.0 - hub.loss_pct / 100.0)).round() as u32;
            MtrHop {
                number: hub.count,
                host: hub.host,
                loss_pct: hub.loss_pct,
                sent: hub.sent,
                recv,
                best_ms: hub.best_ms,
                avg_ms: hub.avg_ms,
                worst_ms: hub.worst_ms,
                stddev_ms: hub.stddev_ms,
            }
        })
        .collect();

    let reached = hops
        .last()
        .map(|hop| hop.loss_pct < 50.0 && hop.host != UNKNOWN_HOST)
        .unwrap_or(false);

    Ok(MtrTrace { hops, reached })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "report": {
            "mtr": {"src": "probe-1", "dst": "8.8.8.8", "tests": 10},
            "hubs": [
                {"count": 1, "host": "192.168.1.1", "Loss%": 0.0, "Snt": 10,
                 "Last": 1.2, "Avg": 1.3, "Best": 1.1, "Wrst": 2.0, "StDev": 0.2},
                {"count": 2, "host": "10.10.0.1", "Loss%": 10.0, "Snt": 10,
                 "Last": 4.0, "Avg": 4.5, "Best": 3.9, "Wrst": 6.1, "StDev": 0.6},
                {"count": 3, "host": "8.8.8.8", "Loss%": 0.0, "Snt": 10,
                 "Last": 8.8, "Avg": 8.9, "Best": 8.5, "Wrst": 9.9, "StDev": 0.4}
            ]
        }
    }"#;

    #[test]
    fn parses_hops_and_reaches_destination() {
        let trace = parse_report(SAMPLE).unwrap();
        assert_eq!(trace.hops.len(), 3);
        assert!(trace.reached);

        let first = &trace.hops[0];
        assert_eq!(first.number, 1);
        assert_eq!(first.host, "192.168.1.1");
        assert_eq!(first.recv, 10);

        let lossy = &trace.hops[1];
        assert_eq!(lossy.recv, 9);
    }

    #[test]
    fn unknown_final_hop_means_unreached() {
        let json = r#"{
            "report": {
                "hubs": [
                    {"count": 1, "host": "192.168.1.1", "Loss%": 0.0, "Snt": 10,
                     "Last": 1.0, "Avg": 1.0, "Best": 1.0, "Wrst": 1.0, "StDev": 0.0},
                    {"count": 2, "host": "???", "Loss%": 100.0, "Snt": 10,
                     "Last": 0.0, "Avg": 0.0, "Best": 0.0, "Wrst": 0.0, "StDev": 0.0}
                ]
            }
        }"#;
        let trace = parse_report(json).unwrap();
        assert!(!trace.reached);
    }

    #[test]
    fn heavy_final_loss_means_unreached() {
        let json = r#"{
            "report": {
                "hubs": [
                    {"count": 1, "host": "8.8.8.8", "Loss%": 60.0, "Snt": 10,
                     "Last": 9.0, "Avg": 9.0, "Best": 9.0, "Wrst": 9.0, "StDev": 0.0}
                ]
            }
        }"#;
        let trace = parse_report(json).unwrap();
        assert!(!trace.reached);
        assert_eq!(trace.hops[0].recv, 4);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_report("not json"),
            Err(ProbeError::Parse(_))
        ));
    }
}
