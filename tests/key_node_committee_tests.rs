//! Integration tests for the key node committee
//!
//! Drives a chain through validator creation, jailing, heartbeats and
//! governance, checking the bonded set, the epochs and the jail queue after
//! every committed block.

mod common;

use common::*;
use silver_staking::codec;
use silver_staking::{
    export_genesis, BondStatus, Coin, EpochReader, JailQueueReader, JailReason, Params,
    RegistryReader, StakingError, StakingEvent, UpdateKeyNodesProposal,
};

#[test]
fn test_thirteen_validators_bond_after_two_blocks() {
    let chain = committee_of_13();
    let querier = chain.querier();

    let bonded = querier.validators(Some(BondStatus::Bonded)).unwrap();
    assert_eq!(bonded.len(), 13);
    let total: u128 = (1..=13u128).map(|id| 10 + id).sum();
    assert_eq!(querier.last_total_power().unwrap(), total);

    // Highest self delegation first
    let by_power = querier.bonded_validators_by_power().unwrap();
    assert_eq!(by_power[0].operator_address, addr(13));
    assert_eq!(by_power[12].operator_address, addr(1));

    let epoch = querier.latest_epoch().unwrap();
    assert_eq!(epoch.index, 2);
    assert_eq!(epoch.start_block_num, 2);
    assert_eq!(epoch.key_node_set.len(), 13);
    assert!(!epoch.migration_finished);
    assert!(bonded.iter().all(|v| v.is_key_node));
}

#[test]
fn test_jailed_key_nodes_released_within_quota() {
    let mut chain = committee_of_13();

    chain.block(|keeper, ctx| {
        for id in 1..=2u8 {
            let v = keeper
                .jail(ctx, &cons_addr(id), JailReason::ExcessiveDowntime)
                .unwrap();
            assert!(v.jailed);
            assert_ne!(v.jailed_index, 0);
        }
        // Both queued, neither finalized yet
        assert_eq!(ctx.store().jailed_queue().unwrap().len(), 2);
        assert_eq!(ctx.store().jailed_queue_info().unwrap().key_node_count, 2);

        keeper
            .jail(ctx, &cons_addr(3), JailReason::ExcessiveDowntime)
            .unwrap();
        assert!(!ctx
            .events()
            .iter()
            .any(|e| matches!(e, StakingEvent::KeyNodeJailDeferred { .. })));

        keeper
            .jail(ctx, &cons_addr(4), JailReason::DoubleSigning)
            .unwrap();
        assert!(ctx.events().contains(&StakingEvent::KeyNodeJailDeferred {
            validator: addr(4),
            key_node_count: 4,
        }));
    });

    // The quota of 3 releases 1..=3; validator 4 stays queued and keeps its
    // seat in the new epoch
    let snapshot = chain.snapshot();
    let queue: Vec<_> = snapshot
        .jailed_queue()
        .unwrap()
        .into_iter()
        .map(|(_, a)| a)
        .collect();
    assert_eq!(queue, vec![addr(4)]);
    assert_ne!(snapshot.must_validator(&addr(4)).unwrap().jailed_index, 0);
    for id in 1..=3u8 {
        let v = snapshot.must_validator(&addr(id)).unwrap();
        assert!(v.jailed);
        assert_eq!(v.jailed_index, 0);
        assert!(v.is_unbonding());
    }

    let epoch = snapshot.latest_epoch().unwrap();
    assert_eq!(epoch.index, 3);
    assert_eq!(epoch.key_node_set.len(), 10);
    assert!(epoch.contains(&addr(4)));
    assert_eq!(snapshot.jailed_queue_info().unwrap().key_node_count, 1);
    assert_eq!(queued_key_nodes(&snapshot), 1);
    assert!(chain
        .events
        .contains(&StakingEvent::MigrationBegin { new_epoch_index: 3 }));

    // Next epoch: validator 4 is released and leaves the committee
    chain.block(|_, _| {});
    let snapshot = chain.snapshot();
    assert!(snapshot.jailed_queue().unwrap().is_empty());
    let epoch = snapshot.latest_epoch().unwrap();
    assert_eq!(epoch.index, 4);
    assert_eq!(
        epoch.key_node_set,
        (5..=13u8).map(addr).collect::<Vec<_>>()
    );
    assert_eq!(snapshot.jailed_queue_info().unwrap().key_node_count, 0);
    assert!(!snapshot.must_validator(&addr(4)).unwrap().is_key_node);
}

#[test]
fn test_powerless_key_nodes_removed_within_quota() {
    let mut chain = committee_of_13();

    // Four members drop below one unit of consensus power without being jailed
    chain.block(|keeper, ctx| {
        for id in 10..=13u8 {
            let tokens = (10 + u128::from(id)) * REDUCTION;
            keeper
                .undelegate(ctx, addr(id), addr(id), Coin::new("sbtc", tokens - 500_000))
                .unwrap();
        }
    });

    let snapshot = chain.snapshot();
    for id in 10..=13u8 {
        assert!(!snapshot.must_validator(&addr(id)).unwrap().jailed);
    }
    let epochs = snapshot.epochs().unwrap();
    let (prev, next) = (
        epochs[epochs.len() - 2].key_nodes(),
        epochs[epochs.len() - 1].key_nodes(),
    );
    assert_eq!(prev.len(), 13);
    assert!(prev.difference(&next).count() <= 3);

    // Healthy members rank first, then the address tie-break keeps 13
    let mut expected: Vec<_> = (1..=9u8).map(addr).collect();
    expected.push(addr(13));
    expected.sort();
    assert_eq!(snapshot.latest_epoch().unwrap().key_node_set, expected);

    let kept = snapshot.must_validator(&addr(13)).unwrap();
    assert!(kept.is_key_node);
    assert!(kept.is_unbonding());
    for id in 10..=12u8 {
        assert!(!snapshot.must_validator(&addr(id)).unwrap().is_key_node);
    }
    assert_eq!(
        snapshot.jailed_queue_info().unwrap().key_node_count,
        queued_key_nodes(&snapshot)
    );
}

#[test]
fn test_stale_heartbeat_candidate_excluded() {
    let mut chain = TestChain::new(Params::default());
    chain.block(|keeper, ctx| {
        for id in 1..=3u8 {
            keeper
                .create_validator(ctx, create_msg(id, 20 * REDUCTION))
                .unwrap();
        }
    });
    assert_eq!(chain.key_nodes().len(), 3);

    // Incumbents stay live; the newcomer never sent a heartbeat
    chain.block_at(200, |keeper, ctx| {
        for id in 1..=3u8 {
            keeper.key_node_heartbeat(ctx, &addr(id), 199).unwrap();
        }
        keeper
            .create_validator(ctx, create_msg(9, 50 * REDUCTION))
            .unwrap();
    });
    let querier = chain.querier();
    let newcomer = querier.validator(&addr(9)).unwrap().unwrap();
    assert!(newcomer.is_bonded());
    assert!(!newcomer.is_key_node);
    assert!(!chain.key_nodes().contains(&addr(9)));

    chain.block(|keeper, ctx| {
        keeper.key_node_heartbeat(ctx, &addr(9), 200).unwrap();
    });
    assert!(chain.key_nodes().contains(&addr(9)));
    assert_eq!(chain.key_nodes().len(), 4);
}

#[test]
fn test_governance_removal_respects_churn_quota() {
    let mut chain = committee_of_13();

    chain.block(|keeper, ctx| {
        let remove_three = UpdateKeyNodesProposal {
            add: vec![],
            remove: vec![addr(1), addr(2), addr(3)],
        };
        assert!(matches!(
            keeper.update_key_nodes(ctx, &remove_three),
            Err(StakingError::MigrationInProgress(2))
        ));
        keeper.set_migration_finished(ctx, 2).unwrap();

        let remove_four = UpdateKeyNodesProposal {
            add: vec![],
            remove: vec![addr(1), addr(2), addr(3), addr(4)],
        };
        assert!(matches!(
            keeper.update_key_nodes(ctx, &remove_four),
            Err(StakingError::ChurnQuotaExceeded {
                requested: 4,
                quota: 3
            })
        ));

        let epoch = keeper.update_key_nodes(ctx, &remove_three).unwrap();
        assert_eq!(epoch.index, 3);
        assert_eq!(epoch.key_node_set.len(), 10);
        assert!(!epoch.contains(&addr(1)));
    });

    let snapshot = chain.snapshot();
    let epoch = snapshot.latest_epoch().unwrap();
    assert_eq!(epoch.index, 3);
    assert_eq!(epoch.key_node_set.len(), 10);
    // Removed members stay bonded validators
    assert!(snapshot.must_validator(&addr(1)).unwrap().is_bonded());
    assert!(!snapshot.must_validator(&addr(1)).unwrap().is_key_node);
    assert!(chain.events.contains(&StakingEvent::UpdateKeyNodes {
        epoch_index: 3,
        added: vec![],
        removed: vec![addr(1), addr(2), addr(3)],
    }));
}

#[test]
fn test_unjail_of_never_queued_validator() {
    let mut chain = TestChain::new(Params::default());
    chain.block(|keeper, ctx| {
        keeper
            .create_validator(ctx, create_msg(1, 20 * REDUCTION))
            .unwrap();
        let v = keeper
            .jail(ctx, &cons_addr(1), JailReason::Manual)
            .unwrap();
        assert!(v.is_unbonded());
        assert_eq!(v.jailed_index, 0);
    });
    let snapshot = chain.snapshot();
    assert!(snapshot.jailed_queue().unwrap().is_empty());
    let v = snapshot.must_validator(&addr(1)).unwrap();
    assert!(!snapshot.in_power_index(&v, REDUCTION));

    let updates = chain.block(|keeper, ctx| {
        keeper.unjail(ctx, &addr(1)).unwrap();
    });
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].power, 20);
    let snapshot = chain.snapshot();
    let v = snapshot.must_validator(&addr(1)).unwrap();
    assert!(snapshot.in_power_index(&v, REDUCTION));
    assert!(v.is_bonded());
}

#[test]
fn test_second_pass_at_same_height_is_empty() {
    let mut chain = committee_of_13();
    chain.block(|keeper, ctx| {
        keeper
            .jail(ctx, &cons_addr(7), JailReason::DoubleSigning)
            .unwrap();
        let first = keeper.apply_and_return_validator_set_updates(ctx).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].power, 0);
        let second = keeper.apply_and_return_validator_set_updates(ctx).unwrap();
        assert!(second.is_empty());
    });
    let snapshot = chain.snapshot();
    assert_eq!(snapshot.latest_epoch().unwrap().key_node_set.len(), 12);
    assert_eq!(queued_key_nodes(&snapshot), 0);
}

#[test]
fn test_independent_runs_are_identical() {
    fn run() -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let mut chain = committee_of_13();
        let mut updates = Vec::new();
        updates.push(chain.block(|keeper, ctx| {
            keeper
                .jail(ctx, &cons_addr(12), JailReason::ExcessiveDowntime)
                .unwrap();
            keeper
                .create_validator(ctx, create_msg(20, 40 * REDUCTION))
                .unwrap();
        }));
        updates.push(chain.block(|keeper, ctx| {
            keeper.unjail(ctx, &addr(12)).unwrap();
        }));
        let encoded_updates = updates
            .iter()
            .map(|u| serde_json::to_vec(u).unwrap())
            .collect();
        let encoded_epochs = chain
            .snapshot()
            .epochs()
            .unwrap()
            .iter()
            .map(|e| codec::encode(e).unwrap())
            .collect();
        (encoded_updates, encoded_epochs)
    }

    assert_eq!(run(), run());

    let a = committee_of_13();
    let b = committee_of_13();
    assert_eq!(
        export_genesis(&a.snapshot()).unwrap(),
        export_genesis(&b.snapshot()).unwrap()
    );
}
