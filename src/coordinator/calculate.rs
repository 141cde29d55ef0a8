//! Per-region contract calculation.
//!
//! `calculate_contract` computes the successor of one contract over a region
//! across which every input is homogeneous. It never fails: when an input it
//! would need is missing, it makes no change and waits for the next run.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::connectivity::ConnectivityMap;
use crate::core::contract::{AckState, Contract, PrimarySpec};
use crate::core::identity::ServerId;
use crate::core::table::ShardConfig;
use crate::core::time::StateTimestamp;

use super::fragment::AckFragment;

/// True if `target` definitely cannot be seen by a majority of `judges`.
/// A judge we cannot reach ourselves is assumed to see the target; losing
/// contact with a judge must not, by itself, look like the target failing.
fn invisible_to_majority_of_set(
    target: ServerId,
    judges: &BTreeSet<ServerId>,
    connectivity: &ConnectivityMap,
) -> bool {
    let count = judges
        .iter()
        .filter(|judge| {
            connectivity.can_see(**judge, target) || !connectivity.can_see(**judge, **judge)
        })
        .count();
    !(count > judges.len() / 2)
}

/// Members of `voters` and `temp_voters` that a majority of each set can
/// see.
fn visible_voters(contract: &Contract, connectivity: &ConnectivityMap) -> BTreeSet<ServerId> {
    let mut visible = BTreeSet::new();
    for server in &contract.replicas {
        let is_voter = contract.voters.contains(server)
            || contract
                .temp_voters
                .as_ref()
                .is_some_and(|temp| temp.contains(server));
        if !is_voter {
            continue;
        }
        if invisible_to_majority_of_set(*server, &contract.voters, connectivity) {
            continue;
        }
        if let Some(temp_voters) = &contract.temp_voters {
            if invisible_to_majority_of_set(*server, temp_voters, connectivity) {
                continue;
            }
        }
        visible.insert(*server);
    }
    visible
}

/// Compute a new contract for a region.
///
/// `acks` holds fragments from replicas that acked *this* contract; acks for
/// earlier contracts over the same region are excluded by the caller. Log
/// messages go out as `<log_prefix>: <message>`; an empty prefix suppresses
/// them.
pub fn calculate_contract(
    old: &Contract,
    config: &ShardConfig,
    acks: &BTreeMap<ServerId, AckFragment>,
    connectivity: &ConnectivityMap,
    log_prefix: &str,
) -> Contract {
    let mut new = old.clone();

    // Absorb servers the user added to the shard.
    new.replicas.extend(config.all_replicas.iter().copied());

    // Propose a voter change once a majority of the configured voter set is
    // already streaming; flipping temp_voters earlier would cost write
    // availability the moment both quorums are required.
    let config_voters = config.voting_replicas();
    if old.temp_voters.is_none() && old.voters != config_voters {
        let num_streaming = config_voters
            .iter()
            .filter(|server| match acks.get(*server) {
                Some(frag) => {
                    frag.state == AckState::SecondaryStreaming
                        || old.primary.as_ref().is_some_and(|p| p.server == **server)
                }
                None => false,
            })
            .count();
        if num_streaming > config_voters.len() / 2 {
            new.temp_voters = Some(config_voters.clone());
            if !log_prefix.is_empty() {
                tracing::info!("{log_prefix}: Beginning replica set change.");
            }
        }
    }

    // Commit a proposed voter change. PrimaryReady is the primary's promise
    // that it has been requiring acks from majorities of both voter sets and
    // has backfilled every earlier acked write to a majority of the new one;
    // switching before that could lose acked writes.
    if old.temp_voters.is_some() {
        let primary_ready = old.primary.as_ref().is_some_and(|primary| {
            acks.get(&primary.server)
                .is_some_and(|frag| frag.state == AckState::PrimaryReady)
        });
        if primary_ready {
            if let Some(temp_voters) = new.temp_voters.take() {
                new.voters = temp_voters;
            }
            if !log_prefix.is_empty() {
                tracing::info!("{log_prefix}: Committed replica set change.");
            }
        }
    }

    let visible = visible_voters(&new, connectivity);

    // Drop servers removed from the config once no voter set still needs
    // them. Killing a primary this way is deferred to the primary handling
    // below.
    let mut should_kill_primary = false;
    for server in &old.replicas {
        if !config.all_replicas.contains(server)
            && !new.voters.contains(server)
            && !new
                .temp_voters
                .as_ref()
                .is_some_and(|temp| temp.contains(server))
        {
            new.replicas.remove(server);
            if old.primary.as_ref().is_some_and(|p| p.server == *server) {
                should_kill_primary = true;
                if !log_prefix.is_empty() {
                    tracing::info!(
                        "{log_prefix}: Stopping server {server} as primary because it's no \
                         longer a voter."
                    );
                }
            }
        }
    }

    if old.primary.is_none() {
        // Elect a primary. Eligibility requires carrying every acked write:
        // a candidate must be at least as far along the canonical branch as
        // more than half of the voters, itself included. The server id is a
        // secondary sort key so re-runs pick the same server.
        let mut sorted_candidates: Vec<(StateTimestamp, ServerId)> = new
            .voters
            .iter()
            .filter_map(|server| {
                let frag = acks.get(server)?;
                if frag.state == AckState::SecondaryNeedPrimary {
                    frag.version.map(|timestamp| (timestamp, *server))
                } else {
                    None
                }
            })
            .collect();
        sorted_candidates.sort();

        let mut eligible_candidates: Vec<ServerId> = Vec::new();
        for (i, (timestamp, server)) in sorted_candidates.iter().enumerate() {
            if !visible.contains(server) {
                continue;
            }
            // Count the candidates this one is at least as up-to-date as:
            // everything before it in the sorted order, plus any ties after.
            let mut up_to_date_count = i + 1;
            while up_to_date_count < sorted_candidates.len()
                && sorted_candidates[up_to_date_count].0 == *timestamp
            {
                up_to_date_count += 1;
            }
            if up_to_date_count > new.voters.len() / 2 {
                eligible_candidates.push(*server);
            }
        }

        if eligible_candidates.contains(&config.primary_replica) {
            new.primary = Some(PrimarySpec::new(config.primary_replica));
        } else if let Some(most_up_to_date) = eligible_candidates.last().copied() {
            if !config.primary_replica.is_nil()
                && visible.contains(&config.primary_replica)
                && !acks.contains_key(&config.primary_replica)
            {
                // The designated primary is reachable and merely hasn't
                // acked yet. Wait for it rather than failing over to a
                // different server.
            } else {
                new.primary = Some(PrimarySpec::new(most_up_to_date));
            }
        }

        if let Some(primary) = &new.primary {
            if !log_prefix.is_empty() {
                tracing::info!(
                    "{log_prefix}: Selected server {} as primary.",
                    primary.server
                );
            }
        }
    } else if let Some(old_primary) = &old.primary {
        // We have a primary but may need a different one. Removing the
        // primary and electing its successor are separate contract
        // generations: a majority of replicas must first promise, by acking
        // the primaryless contract, to stop taking writes from the old
        // primary. Going straight to the new one could leave two primaries
        // acking overlapping writes.
        if !should_kill_primary && !visible.contains(&old_primary.server) {
            should_kill_primary = true;
            if !log_prefix.is_empty() {
                tracing::info!(
                    "{log_prefix}: Stopping server {} as primary because a majority of voters \
                     cannot reach it.",
                    old_primary.server
                );
            }
        }

        if should_kill_primary {
            new.primary = None;
        } else if old_primary.server != config.primary_replica {
            if old_primary.hand_over != Some(config.primary_replica) {
                // No hand-over yet, or one aimed at a server the user has
                // since moved away from.
                let target_ready = acks
                    .get(&config.primary_replica)
                    .is_some_and(|frag| frag.state == AckState::SecondaryStreaming)
                    && visible.contains(&config.primary_replica);
                if target_ready {
                    if let Some(primary) = new.primary.as_mut() {
                        primary.hand_over = Some(config.primary_replica);
                    }
                    if !log_prefix.is_empty() {
                        tracing::info!(
                            "{log_prefix}: Handing over primary from {} to {} to match table \
                             config.",
                            old_primary.server,
                            config.primary_replica
                        );
                    }
                } else if old_primary.hand_over.is_some() {
                    // The retargeted hand-over can't start yet; cancel the
                    // stale one.
                    if let Some(primary) = new.primary.as_mut() {
                        primary.hand_over = None;
                    }
                }
            } else if acks
                .get(&old_primary.server)
                .is_some_and(|frag| frag.state == AckState::PrimaryReady)
            {
                // Hand-over complete. The old primary stops now; the new one
                // is elected once a majority acks the primaryless contract.
                new.primary = None;
            } else if !visible.contains(&config.primary_replica) {
                // The target failed mid-hand-over; abort it.
                if let Some(primary) = new.primary.as_mut() {
                    primary.hand_over = None;
                }
            }
        } else if old_primary.hand_over.is_some() {
            // The user switched the config back to the current primary
            // mid-hand-over.
            if let Some(primary) = new.primary.as_mut() {
                primary.hand_over = None;
            }
        }
    }

    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::BranchId;
    use uuid::Uuid;

    fn server(seed: u128) -> ServerId {
        ServerId::new(Uuid::from_u128(seed))
    }

    fn ts(value: u64) -> StateTimestamp {
        StateTimestamp::new(value)
    }

    fn contract(replicas: &[ServerId], voters: &[ServerId], primary: Option<ServerId>) -> Contract {
        Contract {
            replicas: replicas.iter().copied().collect(),
            voters: voters.iter().copied().collect(),
            temp_voters: None,
            primary: primary.map(PrimarySpec::new),
            branch: BranchId::nil(),
        }
    }

    fn config(all: &[ServerId], primary: ServerId) -> ShardConfig {
        ShardConfig {
            all_replicas: all.iter().copied().collect(),
            nonvoting_replicas: BTreeSet::new(),
            primary_replica: primary,
        }
    }

    fn need_primary(timestamp: u64) -> AckFragment {
        AckFragment {
            state: AckState::SecondaryNeedPrimary,
            version: Some(ts(timestamp)),
            branch: None,
        }
    }

    fn in_state(state: AckState) -> AckFragment {
        AckFragment {
            state,
            version: None,
            branch: None,
        }
    }

    #[test]
    fn empty_acks_change_nothing() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], Some(a));
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let new = calculate_contract(&old, &config(&[a, b, c], a), &BTreeMap::new(), &connectivity, "");
        assert_eq!(new, old);
    }

    #[test]
    fn new_replicas_are_absorbed() {
        let (a, b, c, d) = (server(1), server(2), server(3), server(4));
        let old = contract(&[a, b, c], &[a, b, c], Some(a));
        let connectivity = ConnectivityMap::fully_connected([a, b, c, d]);
        let new = calculate_contract(&old, &config(&[a, b, c, d], a), &BTreeMap::new(), &connectivity, "");
        assert!(new.replicas.contains(&d));
        assert!(!new.voters.contains(&d));
    }

    #[test]
    fn voter_change_waits_for_streaming_majority() {
        let (a, b, c, d, e) = (server(1), server(2), server(3), server(4), server(5));
        let old = contract(&[a, b, c], &[a, b, c], Some(a));
        let cfg = config(&[a, b, c, d, e], a);
        let connectivity = ConnectivityMap::fully_connected([a, b, c, d, e]);

        // Only D is streaming; with the primary that's 2 of 5.
        let mut acks = BTreeMap::new();
        acks.insert(a, in_state(AckState::PrimaryInProgress));
        acks.insert(d, in_state(AckState::SecondaryStreaming));
        let new = calculate_contract(&old, &cfg, &acks, &connectivity, "");
        assert_eq!(new.temp_voters, None);

        // E comes up too: 3 of 5, proposal goes out.
        acks.insert(e, in_state(AckState::SecondaryStreaming));
        let new = calculate_contract(&old, &cfg, &acks, &connectivity, "");
        assert_eq!(new.temp_voters, Some(cfg.voting_replicas()));
        assert_eq!(new.voters, old.voters);
    }

    #[test]
    fn voter_change_commits_on_primary_ready() {
        let (a, b, c, d, e) = (server(1), server(2), server(3), server(4), server(5));
        let mut old = contract(&[a, b, c, d, e], &[a, b, c], Some(a));
        let cfg = config(&[a, b, c, d, e], a);
        old.temp_voters = Some(cfg.voting_replicas());
        let connectivity = ConnectivityMap::fully_connected([a, b, c, d, e]);

        let mut acks = BTreeMap::new();
        acks.insert(a, in_state(AckState::PrimaryInProgress));
        let new = calculate_contract(&old, &cfg, &acks, &connectivity, "");
        assert_eq!(new.temp_voters, old.temp_voters);
        assert_eq!(new.voters, old.voters);

        acks.insert(a, in_state(AckState::PrimaryReady));
        let new = calculate_contract(&old, &cfg, &acks, &connectivity, "");
        assert_eq!(new.temp_voters, None);
        assert_eq!(new.voters, cfg.voting_replicas());
    }

    #[test]
    fn removed_replicas_are_dropped() {
        let (a, b, c, d) = (server(1), server(2), server(3), server(4));
        let mut old = contract(&[a, b, c, d], &[a, b, c], Some(a));
        old.replicas.insert(d);
        let connectivity = ConnectivityMap::fully_connected([a, b, c, d]);
        let new = calculate_contract(&old, &config(&[a, b, c], a), &BTreeMap::new(), &connectivity, "");
        assert!(!new.replicas.contains(&d));
    }

    #[test]
    fn dropping_the_primary_replica_kills_the_primary() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[b, c], Some(a));
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let new = calculate_contract(&old, &config(&[b, c], b), &BTreeMap::new(), &connectivity, "");
        assert!(!new.replicas.contains(&a));
        assert_eq!(new.primary, None);
    }

    #[test]
    fn election_prefers_designated_primary_on_tie() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], None);
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let mut acks = BTreeMap::new();
        acks.insert(a, need_primary(5));
        acks.insert(b, need_primary(5));
        let new = calculate_contract(&old, &config(&[a, b, c], b), &acks, &connectivity, "");
        assert_eq!(new.primary, Some(PrimarySpec::new(b)));
    }

    #[test]
    fn election_is_stable_across_reruns() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], None);
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let mut acks = BTreeMap::new();
        acks.insert(a, need_primary(5));
        acks.insert(b, need_primary(5));
        acks.insert(c, need_primary(5));
        let cfg = config(&[a, b, c], ServerId::nil());
        let first = calculate_contract(&old, &cfg, &acks, &connectivity, "");
        let second = calculate_contract(&old, &cfg, &acks, &connectivity, "");
        assert_eq!(first, second);
        // All tied; the last in (timestamp, server id) order wins.
        assert_eq!(first.primary, Some(PrimarySpec::new(c)));
    }

    #[test]
    fn election_picks_most_up_to_date_without_designation() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], None);
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let mut acks = BTreeMap::new();
        acks.insert(a, need_primary(3));
        acks.insert(b, need_primary(7));
        acks.insert(c, need_primary(5));
        let new = calculate_contract(&old, &config(&[a, b, c], ServerId::nil()), &acks, &connectivity, "");
        assert_eq!(new.primary, Some(PrimarySpec::new(b)));
    }

    #[test]
    fn stale_candidate_is_not_eligible() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], None);
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        // Only A reports, and it lags: it is up-to-date relative to just
        // itself, which is not more than half of three voters.
        let mut acks = BTreeMap::new();
        acks.insert(a, need_primary(3));
        let new = calculate_contract(&old, &config(&[a, b, c], ServerId::nil()), &acks, &connectivity, "");
        assert_eq!(new.primary, None);
    }

    #[test]
    fn election_waits_for_visible_designated_primary() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], None);
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let mut acks = BTreeMap::new();
        acks.insert(a, need_primary(5));
        acks.insert(c, need_primary(5));

        // B is visible but hasn't acked: hold the election for it.
        let new = calculate_contract(&old, &config(&[a, b, c], b), &acks, &connectivity, "");
        assert_eq!(new.primary, None);

        // B acks behind the others: it is ineligible, so stop waiting.
        acks.insert(b, need_primary(2));
        let new = calculate_contract(&old, &config(&[a, b, c], b), &acks, &connectivity, "");
        assert_eq!(new.primary, Some(PrimarySpec::new(c)));
    }

    #[test]
    fn all_voters_invisible_elects_no_one() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], None);
        // Every server is reachable from us but sees only itself.
        let mut connectivity = ConnectivityMap::new();
        for s in [a, b, c] {
            connectivity.insert(s, s);
        }
        let mut acks = BTreeMap::new();
        acks.insert(a, need_primary(5));
        acks.insert(b, need_primary(5));
        acks.insert(c, need_primary(5));
        let new = calculate_contract(&old, &config(&[a, b, c], a), &acks, &connectivity, "");
        assert_eq!(new.primary, None);
    }

    #[test]
    fn unreachable_primary_is_removed() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], Some(a));
        // We can reach everyone, but B and C report no connection to A.
        let mut connectivity = ConnectivityMap::fully_connected([a, b, c]);
        connectivity.remove(b, a);
        connectivity.remove(c, a);
        let new = calculate_contract(&old, &config(&[a, b, c], a), &BTreeMap::new(), &connectivity, "");
        assert_eq!(new.primary, None);
    }

    #[test]
    fn judges_unreachable_from_us_count_as_seeing() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], Some(a));
        // We lost contact with B and C entirely. Assume they can still see
        // A rather than failing over on our own blindness.
        let mut connectivity = ConnectivityMap::new();
        connectivity.insert(a, a);
        let new = calculate_contract(&old, &config(&[a, b, c], a), &BTreeMap::new(), &connectivity, "");
        assert_eq!(new.primary, Some(PrimarySpec::new(a)));
    }

    #[test]
    fn handover_starts_when_target_streams() {
        let (a, b, c) = (server(1), server(2), server(3));
        let old = contract(&[a, b, c], &[a, b, c], Some(a));
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let cfg = config(&[a, b, c], b);

        // B not streaming yet: nothing happens.
        let new = calculate_contract(&old, &cfg, &BTreeMap::new(), &connectivity, "");
        assert_eq!(new.primary, Some(PrimarySpec::new(a)));

        let mut acks = BTreeMap::new();
        acks.insert(b, in_state(AckState::SecondaryStreaming));
        let new = calculate_contract(&old, &cfg, &acks, &connectivity, "");
        assert_eq!(
            new.primary,
            Some(PrimarySpec {
                server: a,
                hand_over: Some(b),
            })
        );
    }

    #[test]
    fn handover_completes_into_primaryless_contract() {
        let (a, b, c) = (server(1), server(2), server(3));
        let mut old = contract(&[a, b, c], &[a, b, c], Some(a));
        old.primary = Some(PrimarySpec {
            server: a,
            hand_over: Some(b),
        });
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let mut acks = BTreeMap::new();
        acks.insert(a, in_state(AckState::PrimaryReady));
        acks.insert(b, in_state(AckState::SecondaryStreaming));
        let new = calculate_contract(&old, &config(&[a, b, c], b), &acks, &connectivity, "");
        assert_eq!(new.primary, None);
    }

    #[test]
    fn handover_aborts_when_target_goes_invisible() {
        let (a, b, c) = (server(1), server(2), server(3));
        let mut old = contract(&[a, b, c], &[a, b, c], Some(a));
        old.primary = Some(PrimarySpec {
            server: a,
            hand_over: Some(b),
        });
        let mut connectivity = ConnectivityMap::fully_connected([a, b, c]);
        connectivity.remove(a, b);
        connectivity.remove(c, b);
        let new = calculate_contract(&old, &config(&[a, b, c], b), &BTreeMap::new(), &connectivity, "");
        assert_eq!(new.primary, Some(PrimarySpec::new(a)));
    }

    #[test]
    fn handover_retargets_after_config_change() {
        let (a, b, c) = (server(1), server(2), server(3));
        let mut old = contract(&[a, b, c], &[a, b, c], Some(a));
        // Mid-hand-over to B, the user retargets to C, and B is gone.
        old.primary = Some(PrimarySpec {
            server: a,
            hand_over: Some(b),
        });
        let mut connectivity = ConnectivityMap::fully_connected([a, b, c]);
        connectivity.remove(a, b);
        connectivity.remove(c, b);
        let cfg = config(&[a, b, c], c);

        // C isn't streaming yet, so the stale hand-over is cleared first.
        let new = calculate_contract(&old, &cfg, &BTreeMap::new(), &connectivity, "");
        assert_eq!(new.primary, Some(PrimarySpec::new(a)));

        // Once C streams, a fresh hand-over begins.
        old.primary = Some(PrimarySpec::new(a));
        let mut acks = BTreeMap::new();
        acks.insert(c, in_state(AckState::SecondaryStreaming));
        let new = calculate_contract(&old, &cfg, &acks, &connectivity, "");
        assert_eq!(
            new.primary,
            Some(PrimarySpec {
                server: a,
                hand_over: Some(c),
            })
        );
    }

    #[test]
    fn stale_handover_is_cleared_when_config_matches_primary() {
        let (a, b, c) = (server(1), server(2), server(3));
        let mut old = contract(&[a, b, c], &[a, b, c], Some(a));
        old.primary = Some(PrimarySpec {
            server: a,
            hand_over: Some(b),
        });
        let connectivity = ConnectivityMap::fully_connected([a, b, c]);
        let new = calculate_contract(&old, &config(&[a, b, c], a), &BTreeMap::new(), &connectivity, "");
        assert_eq!(new.primary, Some(PrimarySpec::new(a)));
    }
}
