//! Pure evaluation logic: anomaly classification and the hysteresis state
//! machine. Everything here is clock-free except for the `now` the caller
//! passes in, which keeps the transition rules directly testable.

use chrono::{DateTime, Utc};
use icmpmon_model::{AlertThresholds, Baseline, PairState, PairStatus};
use uuid::Uuid;

/// Aggregated probe statistics for one pair over the evaluation window.
#[derive(Debug, Clone)]
pub struct PairWindowStats {
    pub agent_id: Uuid,
    pub target_id: Uuid,
    pub success_count: i64,
    pub total_count: i64,
    pub avg_latency_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub stddev_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub last_probe_time: DateTime<Utc>,
}

/// Raw anomaly level of one observation window, before hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyLevel {
    Healthy,
    Warning,
    Critical,
}

/// Latency z-score against the learned baseline. Disabled (None) without a
/// baseline or when the baseline stddev is zero.
pub fn z_score(avg_latency_ms: Option<f64>, baseline: Option<&Baseline>) -> Option<f64> {
    let avg = avg_latency_ms?;
    let baseline = baseline?;
    if baseline.stddev_ms <= 0.0 {
        return None;
    }
    Some((avg - baseline.p50_ms) / baseline.stddev_ms)
}

/// Classifies one window, in strict priority order: complete failure, then
/// critical loss, critical latency, warning loss, warning latency.
pub fn classify(
    stats: &PairWindowStats,
    z: Option<f64>,
    thresholds: &AlertThresholds,
) -> AnomalyLevel {
    let loss = stats.packet_loss_pct.unwrap_or(0.0);

    if stats.success_count == 0 || loss >= 100.0 {
        return AnomalyLevel::Critical;
    }
    if loss >= thresholds.packet_loss_critical_pct {
        return AnomalyLevel::Critical;
    }
    if let Some(z) = z {
        if z >= thresholds.z_crit {
            return AnomalyLevel::Critical;
        }
    }
    if loss >= thresholds.packet_loss_warning_pct {
        return AnomalyLevel::Warning;
    }
    if let Some(z) = z {
        if z >= thresholds.z_warn {
            return AnomalyLevel::Warning;
        }
    }
    AnomalyLevel::Healthy
}

fn severity(status: PairStatus) -> u8 {
    match status {
        PairStatus::Up => 0,
        PairStatus::Degraded => 1,
        PairStatus::Down => 2,
    }
}

/// Whether the previous window classified as critical, reconstructed from
/// the values recorded on the state. Down demands an unbroken critical
/// streak; a warning in between restarts the count toward it.
fn prev_was_critical(state: &PairState, thresholds: &AlertThresholds) -> bool {
    let loss = state.last_packet_loss_pct.unwrap_or(0.0);
    if loss >= 100.0 || loss >= thresholds.packet_loss_critical_pct {
        return true;
    }
    state
        .last_z_score
        .map_or(false, |z| z >= thresholds.z_crit)
}

/// Applies one observation to a pair state. Returns true when any persisted
/// field changed.
///
/// Transition rules:
/// - an anomalous window increments `consecutive_anomalies` and zeroes
///   `consecutive_successes`; `anomaly_start` is preserved across a run of
///   anomalies;
/// - `down` requires `down_after` consecutive anomalies with the latest at
///   critical level; two or more anomalies of any level show `degraded`;
///   a single anomaly only arms the counter;
/// - anomalous windows never improve the status: recovery happens only
///   through healthy windows;
/// - a healthy window zeroes the anomaly counter, clears `anomaly_start`
///   and increments `consecutive_successes`; a non-up status clears to `up`
///   after `up_after` consecutive healthy windows.
pub fn advance_state(
    state: &mut PairState,
    level: AnomalyLevel,
    z: Option<f64>,
    stats: &PairWindowStats,
    now: DateTime<Utc>,
    thresholds: &AlertThresholds,
    down_after: i32,
    up_after: i32,
) -> bool {
    let before_status = state.status;
    let before_anomalies = state.consecutive_anomalies;
    let before_successes = state.consecutive_successes;
    let before_latency = state.last_latency_ms;
    let before_z = state.last_z_score;
    let before_loss = state.last_packet_loss_pct;

    match level {
        AnomalyLevel::Healthy => {
            state.consecutive_anomalies = 0;
            state.anomaly_start = None;
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);

            if state.status != PairStatus::Up && state.consecutive_successes >= up_after {
                state.status = PairStatus::Up;
            }
        }
        AnomalyLevel::Warning | AnomalyLevel::Critical => {
            // A critical window landing on a streak of warnings restarts the
            // counter; down is reached only over consecutive criticals.
            if level == AnomalyLevel::Critical
                && state.consecutive_anomalies > 0
                && !prev_was_critical(state, thresholds)
            {
                state.consecutive_anomalies = 1;
            } else {
                state.consecutive_anomalies = state.consecutive_anomalies.saturating_add(1);
            }
            state.consecutive_successes = 0;
            if state.anomaly_start.is_none() {
                state.anomaly_start = Some(now);
            }

            let candidate = if level == AnomalyLevel::Critical
                && state.consecutive_anomalies >= down_after
            {
                PairStatus::Down
            } else if state.consecutive_anomalies >= 2 {
                PairStatus::Degraded
            } else {
                state.status
            };

            if severity(candidate) > severity(state.status) {
                state.status = candidate;
            }
        }
    }

    state.last_latency_ms = stats.avg_latency_ms;
    state.last_z_score = z;
    state.last_packet_loss_pct = stats.packet_loss_pct;

    if state.status != before_status {
        state.status_since = now;
    }

    state.status != before_status
        || state.consecutive_anomalies != before_anomalies
        || state.consecutive_successes != before_successes
        || state.last_latency_ms != before_latency
        || state.last_z_score != before_z
        || state.last_packet_loss_pct != before_loss
}

/// Creates a baseline from window stats once enough successful samples have
/// accumulated.
pub fn create_baseline(
    stats: &PairWindowStats,
    min_samples: i64,
    now: DateTime<Utc>,
) -> Option<Baseline> {
    if stats.success_count < min_samples {
        return None;
    }
    let p50 = stats.p50_ms?;
    Some(Baseline {
        agent_id: stats.agent_id,
        target_id: stats.target_id,
        p50_ms: p50,
        p95_ms: stats.p95_ms.unwrap_or(p50),
        p99_ms: stats.p99_ms.or(stats.max_ms).unwrap_or(p50),
        stddev_ms: stats.stddev_ms.unwrap_or(0.0).max(0.0),
        sample_count: stats.success_count,
        first_seen: now,
        last_updated: now,
    })
}

/// Folds fresh window stats into an existing baseline with an EMA.
/// `last_updated` moves forward and the sample count never decreases.
pub fn refresh_baseline(
    baseline: &mut Baseline,
    stats: &PairWindowStats,
    alpha: f64,
    now: DateTime<Utc>,
) -> bool {
    let Some(p50) = stats.p50_ms else {
        return false;
    };
    if now <= baseline.last_updated {
        return false;
    }

    let blend = |old: f64, new: f64| alpha * new + (1.0 - alpha) * old;
    baseline.p50_ms = blend(baseline.p50_ms, p50);
    baseline.p95_ms = blend(baseline.p95_ms, stats.p95_ms.unwrap_or(baseline.p95_ms));
    baseline.p99_ms = blend(
        baseline.p99_ms,
        stats.p99_ms.or(stats.max_ms).unwrap_or(baseline.p99_ms),
    );
    baseline.stddev_ms = blend(
        baseline.stddev_ms,
        stats.stddev_ms.unwrap_or(baseline.stddev_ms),
    )
    .max(0.0);
    baseline.sample_count = baseline
        .sample_count
        .saturating_add(stats.success_count.max(0));
    baseline.last_updated = now;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stats(success: i64, total: i64, avg: Option<f64>, loss: Option<f64>) -> PairWindowStats {
        PairWindowStats {
            agent_id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
            success_count: success,
            total_count: total,
            avg_latency_ms: avg,
            p50_ms: avg,
            p95_ms: avg,
            p99_ms: avg,
            max_ms: avg,
            stddev_ms: Some(1.0),
            packet_loss_pct: loss,
            last_probe_time: Utc::now(),
        }
    }

    fn baseline(p50: f64, stddev: f64) -> Baseline {
        Baseline {
            agent_id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
            p50_ms: p50,
            p95_ms: p50 * 1.5,
            p99_ms: p50 * 2.0,
            stddev_ms: stddev,
            sample_count: 500,
            first_seen: Utc::now(),
            last_updated: Utc::now(),
        }
    }

    /// Runs a z-score sequence through the state machine, one window per
    /// entry, and returns the status after each.
    fn trajectory(z_values: &[f64]) -> Vec<PairStatus> {
        let thresholds = AlertThresholds::default();
        let base = baseline(10.0, 1.0);
        let mut state = PairState::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        let mut statuses = Vec::new();

        for (idx, z_val) in z_values.iter().enumerate() {
            let avg = base.p50_ms + z_val * base.stddev_ms;
            let window = stats(10, 10, Some(avg), Some(0.0));
            let z = z_score(window.avg_latency_ms, Some(&base));
            let level = classify(&window, z, &thresholds);
            let now = Utc::now() + chrono::Duration::seconds(idx as i64 * 30);
            advance_state(&mut state, level, z, &window, now, &thresholds, 3, 3);
            statuses.push(state.status);
        }
        statuses
    }

    #[test]
    fn hysteresis_reaches_down_after_three_consecutive_criticals() {
        assert_eq!(
            trajectory(&[6.0, 0.0, 6.0, 6.0, 6.0]),
            vec![
                PairStatus::Up,
                PairStatus::Up,
                PairStatus::Up,
                PairStatus::Degraded,
                PairStatus::Down,
            ]
        );
    }

    #[test]
    fn one_healthy_window_resets_the_streak() {
        assert_eq!(
            trajectory(&[6.0, 6.0, 0.0, 6.0, 6.0]),
            vec![
                PairStatus::Up,
                PairStatus::Degraded,
                PairStatus::Degraded,
                PairStatus::Degraded,
                PairStatus::Degraded,
            ]
        );
        // With the third window healthy, the full run never leaves up.
        assert_eq!(
            trajectory(&[6.0, 0.0, 6.0, 0.0, 6.0]),
            vec![PairStatus::Up; 5]
        );
    }

    #[test]
    fn warnings_cap_at_degraded() {
        // z of 4 sits between z_warn (3) and z_crit (5).
        assert_eq!(
            trajectory(&[4.0, 4.0, 4.0, 4.0, 4.0]),
            vec![
                PairStatus::Up,
                PairStatus::Degraded,
                PairStatus::Degraded,
                PairStatus::Degraded,
                PairStatus::Degraded,
            ]
        );
    }

    #[test]
    fn recovery_requires_three_healthy_windows() {
        let statuses = trajectory(&[6.0, 6.0, 6.0, 0.0, 0.0, 0.0]);
        assert_eq!(statuses[2], PairStatus::Down);
        assert_eq!(statuses[3], PairStatus::Down);
        assert_eq!(statuses[4], PairStatus::Down);
        assert_eq!(statuses[5], PairStatus::Up);
    }

    #[test]
    fn healthy_window_clears_anomaly_bookkeeping() {
        let thresholds = AlertThresholds::default();
        let base = baseline(10.0, 1.0);
        let mut state = PairState::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());

        let bad = stats(10, 10, Some(20.0), Some(0.0));
        let z = z_score(bad.avg_latency_ms, Some(&base));
        advance_state(
            &mut state,
            classify(&bad, z, &thresholds),
            z,
            &bad,
            Utc::now(),
            &thresholds,
            3,
            3,
        );
        assert_eq!(state.consecutive_anomalies, 1);
        assert!(state.anomaly_start.is_some());

        let good = stats(10, 10, Some(10.0), Some(0.0));
        let z = z_score(good.avg_latency_ms, Some(&base));
        advance_state(
            &mut state,
            classify(&good, z, &thresholds),
            z,
            &good,
            Utc::now(),
            &thresholds,
            3,
            3,
        );
        assert_eq!(state.consecutive_anomalies, 0);
        assert_eq!(state.consecutive_successes, 1);
        assert!(state.anomaly_start.is_none());
    }

    #[test]
    fn anomaly_start_is_preserved_across_a_run() {
        let thresholds = AlertThresholds::default();
        let base = baseline(10.0, 1.0);
        let mut state = PairState::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        let bad = stats(10, 10, Some(30.0), Some(0.0));

        let t0 = Utc::now();
        for i in 0..3 {
            let z = z_score(bad.avg_latency_ms, Some(&base));
            advance_state(
                &mut state,
                classify(&bad, z, &thresholds),
                z,
                &bad,
                t0 + chrono::Duration::seconds(30 * i),
                &thresholds,
                3,
                3,
            );
        }
        assert_eq!(state.anomaly_start, Some(t0));
        assert_eq!(state.status, PairStatus::Down);
        assert_eq!(state.status_since, t0 + chrono::Duration::seconds(60));
    }

    #[test]
    fn classification_priority_order() {
        let thresholds = AlertThresholds::default();

        // Complete failure beats everything.
        let dead = stats(0, 10, None, Some(100.0));
        assert_eq!(classify(&dead, None, &thresholds), AnomalyLevel::Critical);

        // Loss at the critical threshold is critical even with a calm z.
        let lossy = stats(8, 10, Some(10.0), Some(20.0));
        assert_eq!(
            classify(&lossy, Some(0.0), &thresholds),
            AnomalyLevel::Critical
        );

        // Critical latency.
        let slow = stats(10, 10, Some(15.0), Some(0.0));
        assert_eq!(
            classify(&slow, Some(5.0), &thresholds),
            AnomalyLevel::Critical
        );

        // Warning latency.
        assert_eq!(
            classify(&slow, Some(3.5), &thresholds),
            AnomalyLevel::Warning
        );

        // Calm window.
        assert_eq!(
            classify(&slow, Some(0.5), &thresholds),
            AnomalyLevel::Healthy
        );
    }

    #[test]
    fn zero_stddev_disables_z_score() {
        let base = baseline(10.0, 0.0);
        assert_eq!(z_score(Some(100.0), Some(&base)), None);
        assert_eq!(z_score(None, Some(&base)), None);
        assert_eq!(z_score(Some(100.0), None), None);

        let base = baseline(10.0, 2.0);
        assert_eq!(z_score(Some(14.0), Some(&base)), Some(2.0));
    }

    #[test]
    fn baseline_created_only_past_sample_threshold() {
        let below = stats(99, 120, Some(10.0), Some(0.0));
        assert!(create_baseline(&below, 100, Utc::now()).is_none());

        let enough = stats(100, 120, Some(10.0), Some(0.0));
        let created = create_baseline(&enough, 100, Utc::now()).unwrap();
        assert_eq!(created.sample_count, 100);
        assert!(created.p50_ms >= 0.0);
        assert!(created.stddev_ms >= 0.0);
    }

    #[test]
    fn baseline_refresh_is_monotonic() {
        let mut base = baseline(10.0, 1.0);
        let before_count = base.sample_count;
        let before_updated = base.last_updated;

        let window = stats(50, 50, Some(12.0), Some(0.0));
        let later = before_updated + chrono::Duration::hours(1);
        assert!(refresh_baseline(&mut base, &window, 0.2, later));

        assert!(base.last_updated > before_updated);
        assert!(base.sample_count >= before_count);
        assert!((base.p50_ms - (0.2 * 12.0 + 0.8 * 10.0)).abs() < 1e-9);

        // A refresh dated before the current one is refused.
        assert!(!refresh_baseline(&mut base, &window, 0.2, before_updated));
    }

    proptest! {
        #[test]
        fn down_needs_three_consecutive_criticals(levels in proptest::collection::vec(0u8..3, 1..40)) {
            let thresholds = AlertThresholds::default();
            let base = baseline(10.0, 1.0);
            let mut state = PairState::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
            let mut critical_streak = 0i32;

            for (idx, code) in levels.iter().enumerate() {
                // 0 healthy, 1 warning (z≈4), 2 critical (z≈6).
                let z_val = match code { 0 => 0.0, 1 => 4.0, _ => 6.0 };
                let window = stats(10, 10, Some(base.p50_ms + z_val * base.stddev_ms), Some(0.0));
                let z = z_score(window.avg_latency_ms, Some(&base));
                let level = classify(&window, z, &thresholds);

                match level {
                    AnomalyLevel::Critical => critical_streak += 1,
                    _ => critical_streak = 0,
                }

                let was_down = state.status == PairStatus::Down;
                let now = Utc::now() + chrono::Duration::seconds(idx as i64);
                advance_state(&mut state, level, z, &window, now, &thresholds, 3, 3);

                if state.status == PairStatus::Down && !was_down {
                    // Entering down demands three consecutive criticals.
                    prop_assert!(critical_streak >= 3);
                }
                if *code == 0 {
                    prop_assert_eq!(state.consecutive_anomalies, 0);
                    prop_assert!(state.anomaly_start.is_none());
                }
            }
        }
    }
}
