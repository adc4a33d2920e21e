//! Validator set update engine
//!
//! Runs once per block at end-block. It derives the bonded set from the power
//! index, keeps the key node committee within its churn quota, opens a new
//! epoch when the committee changes, and returns the power changes for the
//! consensus engine.
//!
//! Status transitions live here too. Each one checks the starting status and
//! panics on a mismatch: a wrong-status transition means the indexes are out
//! of sync with the records.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info};

use crate::codec;
use crate::context::Context;
use crate::epoch::{get_retain_key_nodes, EpochReader, RetainCriteria};
use crate::error::Result;
use crate::events::StakingEvent;
use crate::jail_queue::{JailQueue, JailQueueReader};
use crate::keeper::StakingKeeper;
use crate::keys::{parse_validator_queue_key, validator_queue_key, VALIDATOR_QUEUE_PREFIX};
use crate::pool::PoolLedger;
use crate::registry::{Registry, RegistryReader};
use crate::store::{KvRead, KvStore, Order};
use crate::types::{max_churn, Address, BondStatus, Validator, ValidatorUpdate};

/// Running totals of one update pass
#[derive(Default)]
struct UpdatePass {
    updates: Vec<ValidatorUpdate>,
    total_power: u128,
    bonded_count: usize,
    not_bonded_to_bonded: u128,
    key_nodes: Vec<Address>,
}

impl UpdatePass {
    /// Record `validator` as bonded in this pass, emitting an update if its
    /// power differs from the previous pass
    fn confirm(
        &mut self,
        ctx: &mut Context,
        validator: &Validator,
        last: &mut BTreeMap<Address, u64>,
    ) {
        let power = validator.consensus_power(ctx.params().power_reduction);
        let addr = validator.operator_address;
        if last.remove(&addr) != Some(power) {
            debug!("Validator {} power -> {}", addr, power);
            self.updates.push(validator.update(power));
            ctx.store_mut().set_last_validator_power(&addr, power);
        }
        self.total_power += u128::from(power);
        self.bonded_count += 1;
    }
}

impl StakingKeeper {
    /// Compute this block's validator set and key node committee
    ///
    /// Incumbent key nodes are retained first (all but `ceil(n / 6)` of
    /// them), then the power index fills the bonded set up to
    /// `max_validators` and offers new key node candidates. Validators bonded
    /// in the previous pass but not confirmed now begin unbonding. Running
    /// the pass twice at one height produces no updates the second time.
    /// A retained member without consensus power keeps its seat but leaves
    /// the bonded set.
    ///
    /// # Panics
    ///
    /// Panics if the power index or the key node set references a missing
    /// validator, if the power index holds a jailed validator, or if a
    /// previously bonded validator is no longer bonded.
    pub fn apply_and_return_validator_set_updates(
        &self,
        ctx: &mut Context,
    ) -> Result<Vec<ValidatorUpdate>> {
        let params = ctx.params().clone();
        let height = ctx.height();
        let reduction = params.power_reduction;
        let max_key_nodes = params.max_key_nodes as usize;

        let latest = ctx.store().latest_epoch()?;
        let pending = latest.is_pending_at(height);
        let last_key_nodes = latest.key_nodes();
        let mut last = ctx.store().last_validator_powers()?;
        let mut pass = UpdatePass::default();

        let mut retained = Vec::new();
        let mut held = Vec::new();
        if pending {
            // The committee was already decided at this height; bond every
            // eligible member of it and leave the epoch alone.
            let criteria = RetainCriteria {
                min_delegation: 0,
                height,
                heartbeat_interval: u64::MAX,
                power_reduction: reduction,
            };
            retained = get_retain_key_nodes(
                ctx.store(),
                &latest.key_node_set,
                latest.key_node_set.len(),
                &criteria,
            )?;
            debug!(
                "Epoch {} pending at height {}, forcing {} members",
                latest.index,
                height,
                retained.len()
            );
        } else if height > 0 {
            let churn = max_churn(last_key_nodes.len());
            let released = ctx.store_mut().release_now(height, churn, &last_key_nodes)?;
            if !released.is_empty() {
                debug!("Finalized jailing of {:?}", released);
            }

            let retain_count = (last_key_nodes.len() - churn).min(max_key_nodes);
            let criteria = RetainCriteria {
                min_delegation: params.min_key_node_delegation,
                height,
                heartbeat_interval: params.max_key_node_heartbeat_interval,
                power_reduction: reduction,
            };
            retained = get_retain_key_nodes(
                ctx.store(),
                &latest.key_node_set,
                retain_count,
                &criteria,
            )?;

            held = ctx
                .store()
                .jailed_queue()?
                .into_iter()
                .map(|(_, addr)| addr)
                .filter(|addr| last_key_nodes.contains(addr))
                .collect();
        }

        let retained_addrs: BTreeSet<Address> =
            retained.iter().map(|v| v.operator_address).collect();
        for validator in retained {
            // A member without power keeps its seat but cannot be bonded
            if validator.potential_consensus_power(reduction) == 0 {
                debug!(
                    "Keeping key node {} without consensus power",
                    validator.operator_address
                );
                pass.key_nodes.push(validator.operator_address);
                continue;
            }
            let validator = self.bond_if_needed(ctx, validator, &mut pass)?;
            pass.confirm(ctx, &validator, &mut last);
            pass.key_nodes.push(validator.operator_address);
        }

        // Jailed key nodes the release quota did not reach keep their seat
        for addr in held {
            if pass.key_nodes.len() >= max_key_nodes {
                break;
            }
            debug!("Holding jailed key node {} in committee", addr);
            pass.key_nodes.push(addr);
        }

        let max_validators = params.max_validators as usize;
        for addr in ctx.store().power_index(Order::Descending) {
            if pass.bonded_count >= max_validators {
                break;
            }
            if retained_addrs.contains(&addr) {
                continue;
            }
            let validator = ctx.store().must_validator(&addr)?;
            if validator.jailed {
                error!("Jailed validator {} found in power index", addr);
                panic!("jailed validator {} in power index", addr);
            }
            if validator.potential_consensus_power(reduction) == 0
                || validator.tokens < params.min_validator_delegation
            {
                break;
            }

            let validator = self.bond_if_needed(ctx, validator, &mut pass)?;
            pass.confirm(ctx, &validator, &mut last);

            if !pending
                && pass.key_nodes.len() < max_key_nodes
                && validator.tokens >= params.min_key_node_delegation
                && validator.heartbeat_within(height, params.max_candidate_key_node_heartbeat_interval)
            {
                pass.key_nodes.push(addr);
            }
        }

        if !pending {
            let new_key_nodes: BTreeSet<Address> = pass.key_nodes.iter().copied().collect();
            if new_key_nodes != last_key_nodes {
                let removed = last_key_nodes.difference(&new_key_nodes).count();
                info!(
                    "Key node set changes at height {}: {} members, {} removed",
                    height,
                    new_key_nodes.len(),
                    removed
                );
                self.start_new_epoch(ctx, new_key_nodes.into_iter().collect())?;
            }
        }

        let mut bonded_to_not_bonded: u128 = 0;
        for (addr, _) in last {
            let validator = ctx.store().must_validator(&addr)?;
            let validator = self.bonded_to_unbonding(ctx, validator)?;
            bonded_to_not_bonded += validator.tokens;
            ctx.store_mut().delete_last_validator_power(&addr);
            pass.updates.push(validator.update_zero());
        }

        match pass.not_bonded_to_bonded.cmp(&bonded_to_not_bonded) {
            Ordering::Greater => ctx
                .store_mut()
                .not_bonded_to_bonded(pass.not_bonded_to_bonded - bonded_to_not_bonded)?,
            Ordering::Less => ctx
                .store_mut()
                .bonded_to_not_bonded(bonded_to_not_bonded - pass.not_bonded_to_bonded)?,
            Ordering::Equal => {}
        }

        if !pass.updates.is_empty() {
            ctx.store_mut().set_last_total_power(pass.total_power);
            info!(
                "Height {}: {} validator updates, {} bonded, total power {}",
                height,
                pass.updates.len(),
                pass.bonded_count,
                pass.total_power
            );
        }
        Ok(pass.updates)
    }

    fn bond_if_needed(
        &self,
        ctx: &mut Context,
        validator: Validator,
        pass: &mut UpdatePass,
    ) -> Result<Validator> {
        match validator.status {
            BondStatus::Bonded => Ok(validator),
            BondStatus::Unbonded => {
                pass.not_bonded_to_bonded += validator.tokens;
                self.unbonded_to_bonded(ctx, validator)
            }
            BondStatus::Unbonding => {
                pass.not_bonded_to_bonded += validator.tokens;
                self.unbonding_to_bonded(ctx, validator)
            }
        }
    }

    /// Move an unbonded validator into the bonded set
    pub(crate) fn unbonded_to_bonded(&self, ctx: &mut Context, validator: Validator) -> Result<Validator> {
        expect_status(&validator, BondStatus::Unbonded, BondStatus::Bonded);
        self.bond_validator(ctx, validator)
    }

    /// Move an unbonding validator back into the bonded set
    pub(crate) fn unbonding_to_bonded(&self, ctx: &mut Context, validator: Validator) -> Result<Validator> {
        expect_status(&validator, BondStatus::Unbonding, BondStatus::Bonded);
        self.bond_validator(ctx, validator)
    }

    /// Start unbonding a bonded validator
    pub(crate) fn bonded_to_unbonding(&self, ctx: &mut Context, validator: Validator) -> Result<Validator> {
        expect_status(&validator, BondStatus::Bonded, BondStatus::Unbonding);
        self.begin_unbonding(ctx, validator)
    }

    /// Finish unbonding a validator
    pub(crate) fn unbonding_to_unbonded(&self, ctx: &mut Context, validator: Validator) -> Result<Validator> {
        expect_status(&validator, BondStatus::Unbonding, BondStatus::Unbonded);
        let mut validator = validator;
        validator.status = BondStatus::Unbonded;
        ctx.store_mut().set_validator(&validator)?;
        info!("Validator {} unbonded", validator.operator_address);
        Ok(validator)
    }

    fn bond_validator(&self, ctx: &mut Context, mut validator: Validator) -> Result<Validator> {
        if validator.is_unbonding() {
            delete_validator_queue(ctx.store_mut(), &validator)?;
        }
        validator.status = BondStatus::Bonded;
        validator.unbonding_height = 0;
        validator.unbonding_time = 0;
        ctx.store_mut().set_validator(&validator)?;

        info!(
            "Validator {} bonded with {} tokens",
            validator.operator_address, validator.tokens
        );
        self.hooks().after_validator_bonded(ctx, &validator);
        Ok(validator)
    }

    fn begin_unbonding(&self, ctx: &mut Context, mut validator: Validator) -> Result<Validator> {
        let unbonding_time = ctx.params().unbonding_time;
        validator.status = BondStatus::Unbonding;
        validator.unbonding_height = ctx.height();
        validator.unbonding_time = ctx.block_time().saturating_add(unbonding_time);
        ctx.store_mut().set_validator(&validator)?;
        insert_validator_queue(ctx.store_mut(), &validator)?;

        info!(
            "Validator {} unbonding until {}",
            validator.operator_address, validator.unbonding_time
        );
        self.hooks().after_validator_begin_unbonding(ctx, &validator);
        Ok(validator)
    }

    /// Complete unbonding of every validator whose unbonding time and height
    /// have passed
    ///
    /// Validators left without tokens and outside the jail queue are removed.
    pub fn unbond_all_mature_validators(&self, ctx: &mut Context) -> Result<Vec<Address>> {
        let height = ctx.height();
        let block_time = ctx.block_time();
        let reduction = ctx.params().power_reduction;
        let end = validator_queue_key(block_time.saturating_add(1), 0);
        let slots = ctx
            .store()
            .range(VALIDATOR_QUEUE_PREFIX, Some(&end), Order::Ascending);

        let mut matured = Vec::new();
        for (key, value) in slots {
            let Some((_, unbonding_height)) = parse_validator_queue_key(&key) else {
                continue;
            };
            if unbonding_height > height {
                continue;
            }
            let addrs: Vec<Address> = codec::decode(&value)?;
            for addr in addrs {
                let validator = ctx.store().must_validator(&addr)?;
                if !validator.is_unbonding() {
                    error!(
                        "Validator {} in unbonding queue has status {}",
                        addr, validator.status
                    );
                    panic!("unexpected validator {} in unbonding queue", addr);
                }
                let validator = self.unbonding_to_unbonded(ctx, validator)?;
                ctx.emit(StakingEvent::CompleteValidatorUnbonding { validator: addr });
                // Seated key nodes keep their record
                if validator.tokens == 0 && validator.jailed_index == 0 && !validator.is_key_node {
                    ctx.store_mut().remove_validator(&addr, reduction)?;
                }
                matured.push(addr);
            }
            ctx.store_mut().delete(&key);
        }
        Ok(matured)
    }
}

fn expect_status(validator: &Validator, expected: BondStatus, target: BondStatus) {
    if validator.status != expected {
        error!(
            "Validator {} cannot move {} -> {}, status is {}",
            validator.operator_address, expected, target, validator.status
        );
        panic!(
            "bad state transition {} -> {} for validator {}",
            expected, target, validator.operator_address
        );
    }
}

pub(crate) fn insert_validator_queue<S: KvStore + ?Sized>(store: &mut S, validator: &Validator) -> Result<()> {
    let key = validator_queue_key(validator.unbonding_time, validator.unbonding_height);
    let mut addrs: Vec<Address> = store
        .get(&key)
        .map(|bytes| codec::decode(&bytes))
        .transpose()?
        .unwrap_or_default();
    addrs.push(validator.operator_address);
    store.set(key, codec::encode(&addrs)?);
    Ok(())
}

fn delete_validator_queue<S: KvStore + ?Sized>(store: &mut S, validator: &Validator) -> Result<()> {
    let key = validator_queue_key(validator.unbonding_time, validator.unbonding_height);
    let Some(bytes) = store.get(&key) else {
        return Ok(());
    };
    let mut addrs: Vec<Address> = codec::decode(&bytes)?;
    addrs.retain(|addr| *addr != validator.operator_address);
    if addrs.is_empty() {
        store.delete(&key);
    } else {
        store.set(key, codec::encode(&addrs)?);
    }
    Ok(())
}

/// Validators waiting to finish unbonding, by completion time
pub fn validator_queue<S: KvRead + ?Sized>(store: &S) -> Result<Vec<(u64, u64, Vec<Address>)>> {
    let mut slots = Vec::new();
    for (key, value) in store.prefix_scan(VALIDATOR_QUEUE_PREFIX, Order::Ascending) {
        if let Some((time, height)) = parse_validator_queue_key(&key) {
            slots.push((time, height, codec::decode(&value)?));
        }
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlockHeader;
    use crate::params::Params;
    use crate::pool::PoolReader;
    use crate::store::StateDb;
    use crate::types::{Commission, ConsPubKey, Description, ADDRESS_LEN};

    const REDUCTION: u128 = 1_000_000;

    fn test_params() -> Params {
        Params {
            max_validators: 3,
            max_key_nodes: 2,
            min_validator_delegation: REDUCTION,
            min_key_node_delegation: 5 * REDUCTION,
            unbonding_time: 100,
            ..Params::default()
        }
    }

    fn addr(id: u8) -> Address {
        Address::new([id; ADDRESS_LEN])
    }

    fn add_validator(ctx: &mut Context, id: u8, tokens: u128) {
        let mut v = Validator::new(
            addr(id),
            ConsPubKey::new(vec![id; 32]).unwrap(),
            Description::default(),
            Commission::default(),
            1,
        );
        v.tokens = tokens;
        let store = ctx.store_mut();
        store.set_validator(&v).unwrap();
        store.set_validator_by_cons_addr(&v);
        store.set_validator_by_power_index(&v, REDUCTION);
        store.deposit(false, tokens).unwrap();
    }

    fn ctx_at(db: &StateDb, height: u64) -> Context {
        Context::with_params(BlockHeader::new(height, height * 10), db.begin(), test_params())
    }

    #[test]
    fn test_genesis_bonds_top_validators() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let mut ctx = ctx_at(&db, 0);
        for (id, tokens) in [(1, 2), (2, 9), (3, 6), (4, 4)] {
            add_validator(&mut ctx, id, tokens * REDUCTION);
        }

        let updates = keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        let powers: Vec<u64> = updates.iter().map(|u| u.power).collect();
        assert_eq!(powers, vec![9, 6, 4]);

        let store = ctx.store();
        assert!(store.validator(&addr(2)).unwrap().unwrap().is_bonded());
        assert!(store.validator(&addr(1)).unwrap().unwrap().is_unbonded());
        assert_eq!(store.last_total_power().unwrap(), 19);
        assert_eq!(store.pool().unwrap().bonded_tokens, 19 * REDUCTION);
        assert_eq!(store.pool().unwrap().not_bonded_tokens, 2 * REDUCTION);

        // Key nodes: tokens >= 5, capped at two
        let epoch = store.epoch_by_height(0).unwrap();
        assert_eq!(epoch.key_node_set, vec![addr(2), addr(3)]);
        assert!(epoch.migration_finished);
        assert!(ctx.events().is_empty());
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let mut ctx = ctx_at(&db, 0);
        for (id, tokens) in [(1, 7), (2, 9), (3, 6)] {
            add_validator(&mut ctx, id, tokens * REDUCTION);
        }
        keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        ctx.commit(&db).unwrap();

        let mut ctx = ctx_at(&db, 1);
        let first = keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        let second = keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        assert!(first.is_empty());
        assert!(second.is_empty());
    }

    #[test]
    fn test_displaced_validator_unbonds() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let mut ctx = ctx_at(&db, 0);
        for (id, tokens) in [(1, 2), (2, 9), (3, 6)] {
            add_validator(&mut ctx, id, tokens * REDUCTION);
        }
        keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        ctx.commit(&db).unwrap();

        let mut ctx = ctx_at(&db, 1);
        add_validator(&mut ctx, 4, 3 * REDUCTION);
        let updates = keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();

        let v1 = ctx.store().validator(&addr(1)).unwrap().unwrap();
        let v4 = ctx.store().validator(&addr(4)).unwrap().unwrap();
        assert!(v1.is_unbonding());
        assert_eq!(v1.unbonding_time, 10 + 100);
        assert!(v4.is_bonded());
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], v4.update(3));
        assert_eq!(updates[1], v1.update_zero());

        let slots = validator_queue(ctx.store()).unwrap();
        assert_eq!(slots, vec![(110, 1, vec![addr(1)])]);
    }

    #[test]
    fn test_powerless_key_node_keeps_seat_within_churn() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let params = Params {
            max_validators: 10,
            max_key_nodes: 7,
            ..test_params()
        };
        let mut ctx = Context::with_params(BlockHeader::new(0, 0), db.begin(), params.clone());
        for id in 1..=7u8 {
            add_validator(&mut ctx, id, (10 + u128::from(id)) * REDUCTION);
        }
        keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        assert_eq!(ctx.store().latest_epoch().unwrap().key_node_set.len(), 7);
        ctx.commit(&db).unwrap();

        // Three members drop below one unit of power without being jailed
        let mut ctx = Context::with_params(BlockHeader::new(1, 10), db.begin(), params);
        for id in 5..=7u8 {
            let v = ctx.store().must_validator(&addr(id)).unwrap();
            let amount = v.tokens - REDUCTION / 2;
            ctx.store_mut()
                .remove_validator_tokens(v, amount, REDUCTION)
                .unwrap();
        }
        let updates = keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        assert_eq!(updates.len(), 3);
        assert!(updates.iter().all(|u| u.power == 0));

        // Quota is ceil(7 / 6) = 2: one powerless member is retained
        let epoch = ctx.store().latest_epoch().unwrap();
        assert_eq!(
            epoch.key_node_set,
            vec![addr(1), addr(2), addr(3), addr(4), addr(7)]
        );
        let v7 = ctx.store().must_validator(&addr(7)).unwrap();
        assert!(v7.is_unbonding());
        assert!(v7.is_key_node);
        assert!(ctx.store().last_validator_power(&addr(7)).unwrap().is_none());

        let second = keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_unbonding_matures() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let mut ctx = ctx_at(&db, 0);
        add_validator(&mut ctx, 1, 5 * REDUCTION);
        keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        let v = ctx.store().validator(&addr(1)).unwrap().unwrap();
        keeper.bonded_to_unbonding(&mut ctx, v).unwrap();
        ctx.commit(&db).unwrap();

        // Unbonding time is 100 seconds from block time 0
        let mut ctx = Context::with_params(BlockHeader::new(5, 99), db.begin(), test_params());
        assert!(keeper.unbond_all_mature_validators(&mut ctx).unwrap().is_empty());

        let mut ctx = Context::with_params(BlockHeader::new(6, 100), db.begin(), test_params());
        assert_eq!(
            keeper.unbond_all_mature_validators(&mut ctx).unwrap(),
            vec![addr(1)]
        );
        assert!(ctx.store().validator(&addr(1)).unwrap().unwrap().is_unbonded());
        assert!(validator_queue(ctx.store()).unwrap().is_empty());
    }

    #[test]
    fn test_rebond_clears_queue_entry() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let mut ctx = ctx_at(&db, 0);
        add_validator(&mut ctx, 1, 5 * REDUCTION);
        keeper.apply_and_return_validator_set_updates(&mut ctx).unwrap();
        let v = ctx.store().validator(&addr(1)).unwrap().unwrap();
        let v = keeper.bonded_to_unbonding(&mut ctx, v).unwrap();
        assert_eq!(validator_queue(ctx.store()).unwrap().len(), 1);

        let v = keeper.unbonding_to_bonded(&mut ctx, v).unwrap();
        assert!(v.is_bonded());
        assert!(validator_queue(ctx.store()).unwrap().is_empty());
    }

    #[test]
    #[should_panic]
    fn test_wrong_status_transition_panics() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let mut ctx = ctx_at(&db, 0);
        add_validator(&mut ctx, 1, 5 * REDUCTION);
        let v = ctx.store().validator(&addr(1)).unwrap().unwrap();
        let _ = keeper.bonded_to_unbonding(&mut ctx, v);
    }
}
