//! Deterministic agent selection.
//!
//! Selection depends only on the target IP, the eligible-agent order and the
//! policy. No clock, no randomness: the same inputs always produce the same
//! set, which is what lets every control-plane replica and every re-run of
//! the rebalancer agree without coordination.

use std::collections::HashSet;

use icmpmon_model::{Agent, SelectionPolicy, SelectionStrategy};

/// Horner-style hash of the target IP string: `h = 31·h + byte`, wrapping
/// 32-bit unsigned.
pub fn ip_hash(ip: &str) -> u32 {
    ip.bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
}

/// Filters agents down to the set the policy admits.
///
/// Archived, degraded and offline agents never pass; tag requirements match
/// on key and value.
pub fn eligible_agents<'a>(agents: &'a [Agent], policy: &SelectionPolicy) -> Vec<&'a Agent> {
    agents
        .iter()
        .filter(|agent| agent.is_selectable())
        .filter(|agent| {
            policy.allowed_regions.is_empty() || policy.allowed_regions.contains(&agent.region)
        })
        .filter(|agent| !policy.excluded_regions.contains(&agent.region))
        .filter(|agent| {
            policy.allowed_providers.is_empty()
                || policy.allowed_providers.contains(&agent.provider)
        })
        .filter(|agent| {
            policy
                .required_tags
                .iter()
                .all(|(key, value)| agent.tags.get(key) == Some(value))
        })
        .filter(|agent| {
            policy
                .excluded_tags
                .iter()
                .all(|(key, value)| agent.tags.get(key) != Some(value))
        })
        .collect()
}

/// Selects the probing set for one target from an already-filtered,
/// fixed-order eligible list.
pub fn select<'a>(
    ip: &str,
    eligible: &[&'a Agent],
    policy: &SelectionPolicy,
) -> Vec<&'a Agent> {
    if eligible.is_empty() {
        return Vec::new();
    }

    match policy.strategy {
        SelectionStrategy::All => eligible.to_vec(),
        SelectionStrategy::Distributed => {
            let n = policy.count.max(1);
            if eligible.len() <= n {
                return eligible.to_vec();
            }

            let start = (ip_hash(ip) as usize) % eligible.len();
            let mut selected: Vec<&Agent> = (0..n)
                .map(|offset| eligible[(start + offset) % eligible.len()])
                .collect();

            if let Some(diversity) = policy.diversity {
                apply_diversity(
                    &mut selected,
                    eligible,
                    start,
                    diversity.min_regions,
                    diversity.min_providers,
                );
            }
            selected
        }
    }
}

/// Best-effort diversity overlay: swap over-represented members for agents
/// from regions/providers not yet covered, walking candidates in the same
/// hash order the base selection used. The selection never grows beyond the
/// eligible set and never changes size.
fn apply_diversity<'a>(
    selected: &mut Vec<&'a Agent>,
    eligible: &[&'a Agent],
    start: usize,
    min_regions: usize,
    min_providers: usize,
) {
    rebalance_dimension(selected, eligible, start, min_regions, |agent| {
        agent.region.as_str()
    });
    rebalance_dimension(selected, eligible, start, min_providers, |agent| {
        agent.provider.as_str()
    });
}

fn rebalance_dimension<'a, F>(
    selected: &mut Vec<&'a Agent>,
    eligible: &[&'a Agent],
    start: usize,
    minimum: usize,
    key: F,
) where
    F: Fn(&Agent) -> &str,
{
    if minimum <= 1 {
        return;
    }

    loop {
        let covered: HashSet<&str> = selected.iter().map(|a| key(a)).collect();
        if covered.len() >= minimum.min(distinct_keys(eligible, &key)) {
            return;
        }

        // Candidate: first eligible agent (in hash order from the base
        // start) from a key not yet covered and not already selected.
        let candidate = (0..eligible.len())
            .map(|offset| eligible[(start + offset) % eligible.len()])
            .find(|agent| {
                !covered.contains(key(agent))
                    && !selected.iter().any(|s| s.id == agent.id)
            });
        let Some(candidate) = candidate else {
            return;
        };

        // Victim: the weakest contributor, i.e. the last selected member
        // whose key would still be covered after its removal.
        let victim_idx = selected
            .iter()
            .enumerate()
            .rev()
            .find(|(idx, agent)| {
                selected
                    .iter()
                    .enumerate()
                    .any(|(other, peer)| other != *idx && key(peer) == key(agent))
            })
            .map(|(idx, _)| idx);
        let Some(victim_idx) = victim_idx else {
            return;
        };

        selected[victim_idx] = candidate;
    }
}

fn distinct_keys<'a, F>(eligible: &[&'a Agent], key: &F) -> usize
where
    F: Fn(&Agent) -> &str,
{
    eligible.iter().map(|a| key(a)).collect::<HashSet<_>>().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use icmpmon_model::{AgentStatus, DiversityRequirement};
    use proptest::prelude::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn agent(name: &str, region: &str, provider: &str) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            region: region.to_string(),
            provider: provider.to_string(),
            location: String::new(),
            tags: HashMap::new(),
            executors: vec!["icmp_ping".to_string()],
            max_targets: 10_000,
            status: AgentStatus::Active,
            version: None,
            public_ip: None,
            last_heartbeat: None,
            assignment_version_seen: 0,
            created_at: Utc::now(),
        }
    }

    fn policy(strategy: SelectionStrategy, count: usize) -> SelectionPolicy {
        SelectionPolicy {
            strategy,
            count,
            ..SelectionPolicy::default()
        }
    }

    #[test]
    fn hash_is_horner_over_bytes() {
        // "a" = 97; "ab" = 31*97 + 98.
        assert_eq!(ip_hash("a"), 97);
        assert_eq!(ip_hash("ab"), 31 * 97 + 98);
        assert_eq!(ip_hash(""), 0);
    }

    #[test]
    fn eligibility_applies_every_filter() {
        let mut agents = vec![
            agent("a", "us-east", "aws"),
            agent("b", "us-west", "gcp"),
            agent("c", "eu-west", "aws"),
        ];
        agents[2].status = AgentStatus::Offline;
        agents[0].tags.insert("ring".to_string(), "prod".to_string());

        let mut pol = policy(SelectionStrategy::Distributed, 2);
        pol.allowed_regions = vec!["us-east".to_string(), "eu-west".to_string()];
        let picked = eligible_agents(&agents, &pol);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "a");

        let mut pol = policy(SelectionStrategy::Distributed, 2);
        pol.required_tags
            .insert("ring".to_string(), "prod".to_string());
        let picked = eligible_agents(&agents, &pol);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "a");

        let mut pol = policy(SelectionStrategy::Distributed, 2);
        pol.excluded_tags
            .insert("ring".to_string(), "prod".to_string());
        let picked = eligible_agents(&agents, &pol);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "b");
    }

    #[test]
    fn all_strategy_selects_everyone_eligible() {
        let agents = vec![
            agent("a", "us-east", "aws"),
            agent("b", "us-west", "gcp"),
        ];
        let pol = policy(SelectionStrategy::All, 1);
        let eligible = eligible_agents(&agents, &pol);
        let selected = select("10.0.0.1", &eligible, &pol);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn distributed_takes_n_from_hash_start_with_wraparound() {
        let agents = vec![
            agent("a", "r1", "p1"),
            agent("b", "r2", "p2"),
            agent("c", "r3", "p3"),
            agent("d", "r4", "p4"),
            agent("e", "r5", "p5"),
        ];
        let pol = policy(SelectionStrategy::Distributed, 2);
        let eligible = eligible_agents(&agents, &pol);

        let ip = "192.0.2.7";
        let start = (ip_hash(ip) as usize) % eligible.len();
        let selected = select(ip, &eligible, &pol);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].id, eligible[start].id);
        assert_eq!(selected[1].id, eligible[(start + 1) % eligible.len()].id);
    }

    #[test]
    fn distributed_selects_all_when_pool_is_small() {
        let agents = vec![agent("a", "r1", "p1"), agent("b", "r2", "p2")];
        let pol = policy(SelectionStrategy::Distributed, 4);
        let eligible = eligible_agents(&agents, &pol);
        assert_eq!(select("10.1.2.3", &eligible, &pol).len(), 2);
    }

    #[test]
    fn diversity_spans_required_regions() {
        // Four eligible agents across three regions; force a window that
        // would otherwise sit inside one region.
        let agents = vec![
            agent("a", "us-east", "aws"),
            agent("b", "us-east", "aws"),
            agent("c", "us-west", "gcp"),
            agent("d", "eu-west", "do"),
        ];
        let mut pol = policy(SelectionStrategy::Distributed, 2);
        pol.diversity = Some(DiversityRequirement {
            min_regions: 2,
            min_providers: 1,
        });
        let eligible = eligible_agents(&agents, &pol);

        for ip in ["10.0.0.1", "10.0.0.2", "203.0.113.9", "198.51.100.4"] {
            let selected = select(ip, &eligible, &pol);
            assert_eq!(selected.len(), 2);
            let regions: HashSet<&str> =
                selected.iter().map(|a| a.region.as_str()).collect();
            assert!(regions.len() >= 2, "ip {ip} selected {regions:?}");
        }
    }

    #[test]
    fn diversity_scenario_with_count_four() {
        let agents = vec![
            agent("us-east-A", "us-east", "aws"),
            agent("us-east-B", "us-east", "aws"),
            agent("us-west-C", "us-west", "gcp"),
            agent("eu-D", "eu-west", "do"),
        ];
        let mut pol = policy(SelectionStrategy::Distributed, 4);
        pol.diversity = Some(DiversityRequirement {
            min_regions: 2,
            min_providers: 1,
        });
        let eligible = eligible_agents(&agents, &pol);

        let first = select("192.0.2.55", &eligible, &pol);
        assert_eq!(first.len(), 4);
        let regions: HashSet<&str> = first.iter().map(|a| a.region.as_str()).collect();
        assert!(regions.len() >= 2);

        // Deterministic re-run produces an identical set.
        let second = select("192.0.2.55", &eligible, &pol);
        let first_ids: Vec<Uuid> = first.iter().map(|a| a.id).collect();
        let second_ids: Vec<Uuid> = second.iter().map(|a| a.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn diversity_never_expands_beyond_eligible() {
        let agents = vec![agent("a", "us-east", "aws"), agent("b", "us-east", "aws")];
        let mut pol = policy(SelectionStrategy::Distributed, 2);
        pol.diversity = Some(DiversityRequirement {
            min_regions: 3,
            min_providers: 1,
        });
        let eligible = eligible_agents(&agents, &pol);
        // Only one region exists; the overlay must settle for it.
        let selected = select("10.9.8.7", &eligible, &pol);
        assert_eq!(selected.len(), 2);
    }

    proptest! {
        #[test]
        fn selection_is_deterministic_and_clock_free(
            ip_octets in proptest::collection::vec(0u8..=255, 4),
            pool_size in 1usize..12,
            count in 1usize..6,
        ) {
            let ip = format!(
                "{}.{}.{}.{}",
                ip_octets[0], ip_octets[1], ip_octets[2], ip_octets[3]
            );
            let agents: Vec<Agent> = (0..pool_size)
                .map(|i| agent(&format!("agent-{i}"), &format!("r{}", i % 3), "aws"))
                .collect();
            let pol = policy(SelectionStrategy::Distributed, count);
            let eligible = eligible_agents(&agents, &pol);

            let a: Vec<Uuid> = select(&ip, &eligible, &pol).iter().map(|x| x.id).collect();
            let b: Vec<Uuid> = select(&ip, &eligible, &pol).iter().map(|x| x.id).collect();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.len(), pool_size.min(count));

            // Idempotent under repetition and bounded by the pool.
            let unique: HashSet<Uuid> = a.iter().copied().collect();
            prop_assert_eq!(unique.len(), a.len());
        }
    }
}
