//! Delegations and unbonding delegations
//!
//! Delegators bond tokens to a validator; the validator's `tokens` is the sum
//! of its delegations. Undelegated tokens stay locked in the not-bonded pool
//! until the unbonding time elapses (immediately for unbonded validators).
//!
//! Features:
//! - Self delegation floor enforced on the operator (jails when crossed)
//! - At most `max_entries` pending unbonding entries per delegator/validator
//! - Maturity driven by block time only

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::context::Context;
use crate::error::{Result, StakingError};
use crate::events::StakingEvent;
use crate::keeper::StakingKeeper;
use crate::keys::{
    delegation_key, unbonding_delegation_key, unbonding_queue_key, DELEGATION_PREFIX,
    UNBONDING_DELEGATION_PREFIX, UNBONDING_QUEUE_PREFIX,
};
use crate::pool::PoolLedger;
use crate::registry::{Registry, RegistryReader};
use crate::slashing::JailReason;
use crate::store::{KvRead, KvStore, Order};
use crate::types::{Address, Coin};

/// Delegation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Delegator address
    pub delegator_address: Address,
    /// Validator operator address
    pub validator_address: Address,
    /// Delegated tokens
    pub amount: u128,
}

/// One pending undelegation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingDelegationEntry {
    /// Height of the undelegation
    pub creation_height: u64,
    /// Block time at which the tokens are released
    pub completion_time: u64,
    /// Tokens undelegated
    pub initial_balance: u128,
    /// Tokens still to be released
    pub balance: u128,
}

impl UnbondingDelegationEntry {
    /// Check if the unbonding period is complete at `block_time`
    pub fn is_mature(&self, block_time: u64) -> bool {
        self.completion_time <= block_time
    }
}

/// Pending undelegations of one delegator from one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingDelegation {
    /// Delegator address
    pub delegator_address: Address,
    /// Validator operator address
    pub validator_address: Address,
    /// Entries in creation order
    pub entries: Vec<UnbondingDelegationEntry>,
}

impl UnbondingDelegation {
    /// Get total balance still locked
    pub fn total_balance(&self) -> u128 {
        self.entries.iter().map(|e| e.balance).sum()
    }
}

/// Delegator/validator pair stored in the unbonding queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DvPair {
    /// Delegator address
    pub delegator: Address,
    /// Validator operator address
    pub validator: Address,
}

/// Read access to delegations
pub trait DelegationReader: KvRead {
    /// Get delegation
    fn delegation(&self, delegator: &Address, validator: &Address) -> Result<Option<Delegation>> {
        self.get(&delegation_key(delegator, validator))
            .map(|bytes| codec::decode(&bytes))
            .transpose()
    }

    /// All delegations ordered by delegator then validator
    fn delegations(&self) -> Result<Vec<Delegation>> {
        self.prefix_scan(DELEGATION_PREFIX, Order::Ascending)
            .into_iter()
            .map(|(_, bytes)| codec::decode(&bytes))
            .collect()
    }

    /// Delegations made to `validator`
    fn validator_delegations(&self, validator: &Address) -> Result<Vec<Delegation>> {
        Ok(self
            .delegations()?
            .into_iter()
            .filter(|d| d.validator_address == *validator)
            .collect())
    }

    /// Get unbonding delegation
    fn unbonding_delegation(
        &self,
        delegator: &Address,
        validator: &Address,
    ) -> Result<Option<UnbondingDelegation>> {
        self.get(&unbonding_delegation_key(delegator, validator))
            .map(|bytes| codec::decode(&bytes))
            .transpose()
    }

    /// All unbonding delegations ordered by delegator then validator
    fn unbonding_delegations(&self) -> Result<Vec<UnbondingDelegation>> {
        self.prefix_scan(UNBONDING_DELEGATION_PREFIX, Order::Ascending)
            .into_iter()
            .map(|(_, bytes)| codec::decode(&bytes))
            .collect()
    }
}

impl<S: KvRead + ?Sized> DelegationReader for S {}

/// Write access to delegations
pub trait DelegationStore: KvStore + DelegationReader {
    /// Store a delegation, deleting it when empty
    fn set_delegation(&mut self, delegation: &Delegation) -> Result<()> {
        let key = delegation_key(&delegation.delegator_address, &delegation.validator_address);
        if delegation.amount == 0 {
            self.delete(&key);
        } else {
            self.set(key, codec::encode(delegation)?);
        }
        Ok(())
    }

    /// Store an unbonding delegation, deleting it when it has no entries
    fn set_unbonding_delegation(&mut self, ubd: &UnbondingDelegation) -> Result<()> {
        let key = unbonding_delegation_key(&ubd.delegator_address, &ubd.validator_address);
        if ubd.entries.is_empty() {
            self.delete(&key);
        } else {
            self.set(key, codec::encode(ubd)?);
        }
        Ok(())
    }

    /// Add a pair to the unbonding queue slot of `completion_time`
    fn insert_unbonding_queue(&mut self, completion_time: u64, pair: DvPair) -> Result<()> {
        let key = unbonding_queue_key(completion_time);
        let mut pairs: Vec<DvPair> = self
            .get(&key)
            .map(|bytes| codec::decode(&bytes))
            .transpose()?
            .unwrap_or_default();
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
        self.set(key, codec::encode(&pairs)?);
        Ok(())
    }
}

impl<S: KvStore + ?Sized> DelegationStore for S {}

impl StakingKeeper {
    /// Tokens the operator has delegated to its own validator
    pub fn self_delegation(&self, ctx: &Context, operator: &Address) -> Result<u128> {
        Ok(ctx
            .store()
            .delegation(operator, operator)?
            .map(|d| d.amount)
            .unwrap_or(0))
    }

    /// Delegate tokens to a validator
    ///
    /// Jailed validators accept delegations so an operator can restore its
    /// self delegation before unjailing.
    pub fn delegate(
        &self,
        ctx: &mut Context,
        delegator: Address,
        validator_address: Address,
        amount: Coin,
    ) -> Result<Delegation> {
        check_denom(ctx, &amount)?;
        if amount.amount == 0 {
            return Err(StakingError::InvalidData(
                "delegation amount must be positive".to_string(),
            ));
        }
        let validator = ctx
            .store()
            .validator(&validator_address)?
            .ok_or(StakingError::ValidatorNotFound(validator_address))?;

        let reduction = ctx.params().power_reduction;
        let store = ctx.store_mut();
        store.deposit(validator.is_bonded(), amount.amount)?;
        store.add_validator_tokens(validator, amount.amount, reduction)?;

        let mut delegation = store
            .delegation(&delegator, &validator_address)?
            .unwrap_or(Delegation {
                delegator_address: delegator,
                validator_address,
                amount: 0,
            });
        delegation.amount += amount.amount;
        store.set_delegation(&delegation)?;

        debug!(
            "Delegated {} from {} to {} (total {})",
            amount.amount, delegator, validator_address, delegation.amount
        );
        ctx.emit(StakingEvent::Delegate {
            delegator,
            validator: validator_address,
            amount: amount.amount,
        });
        Ok(delegation)
    }

    /// Undelegate tokens from a validator
    ///
    /// Returns the completion time of the new unbonding entry. If the operator
    /// undelegates below its minimum self delegation, the validator is jailed.
    pub fn undelegate(
        &self,
        ctx: &mut Context,
        delegator: Address,
        validator_address: Address,
        amount: Coin,
    ) -> Result<u64> {
        check_denom(ctx, &amount)?;
        if amount.amount == 0 {
            return Err(StakingError::InvalidData(
                "undelegation amount must be positive".to_string(),
            ));
        }
        let mut delegation = ctx
            .store()
            .delegation(&delegator, &validator_address)?
            .ok_or(StakingError::DelegationNotFound {
                delegator,
                validator: validator_address,
            })?;
        if amount.amount > delegation.amount {
            return Err(StakingError::InsufficientDelegation {
                requested: amount.amount,
                available: delegation.amount,
            });
        }

        let max_entries = ctx.params().max_entries;
        let mut ubd = ctx
            .store()
            .unbonding_delegation(&delegator, &validator_address)?
            .unwrap_or(UnbondingDelegation {
                delegator_address: delegator,
                validator_address,
                entries: Vec::new(),
            });
        if ubd.entries.len() >= max_entries as usize {
            return Err(StakingError::MaxEntries(max_entries));
        }

        let validator = ctx
            .store()
            .validator(&validator_address)?
            .ok_or(StakingError::ValidatorNotFound(validator_address))?;
        let reduction = ctx.params().power_reduction;
        let was_bonded = validator.is_bonded();
        let validator = ctx
            .store_mut()
            .remove_validator_tokens(validator, amount.amount, reduction)?;
        if was_bonded {
            ctx.store_mut().bonded_to_not_bonded(amount.amount)?;
        }

        delegation.amount -= amount.amount;
        ctx.store_mut().set_delegation(&delegation)?;

        if delegator == validator_address
            && !validator.jailed
            && delegation.amount < validator.min_self_delegation
        {
            warn!(
                "Self delegation of {} fell to {}, below minimum {}",
                validator_address, delegation.amount, validator.min_self_delegation
            );
            self.jail_validator(ctx, validator.clone(), JailReason::LowSelfDelegation)?;
        }

        let completion_time = if validator.is_unbonded() {
            ctx.block_time()
        } else {
            ctx.block_time().saturating_add(ctx.params().unbonding_time)
        };
        ubd.entries.push(UnbondingDelegationEntry {
            creation_height: ctx.height(),
            completion_time,
            initial_balance: amount.amount,
            balance: amount.amount,
        });
        let store = ctx.store_mut();
        store.set_unbonding_delegation(&ubd)?;
        store.insert_unbonding_queue(
            completion_time,
            DvPair {
                delegator,
                validator: validator_address,
            },
        )?;

        // The record may have been rewritten by jailing
        if let Some(current) = store.validator(&validator_address)? {
            if current.is_unbonded()
                && current.tokens == 0
                && current.jailed_index == 0
                && !current.is_key_node
            {
                store.remove_validator(&validator_address, reduction)?;
            }
        }

        info!(
            "Undelegated {} from {} by {}, completes at {}",
            amount.amount, validator_address, delegator, completion_time
        );
        ctx.emit(StakingEvent::Unbond {
            delegator,
            validator: validator_address,
            amount: amount.amount,
            completion_time,
        });
        Ok(completion_time)
    }

    /// Release every unbonding delegation entry mature at the block time
    ///
    /// Returns the total tokens released from the not-bonded pool.
    pub fn complete_mature_unbonding_delegations(&self, ctx: &mut Context) -> Result<u128> {
        let block_time = ctx.block_time();
        let end = unbonding_queue_key(block_time.saturating_add(1));
        let slots = ctx
            .store()
            .range(UNBONDING_QUEUE_PREFIX, Some(&end), Order::Ascending);

        let mut released_total = 0u128;
        for (key, value) in slots {
            let pairs: Vec<DvPair> = codec::decode(&value)?;
            for pair in pairs {
                let Some(mut ubd) = ctx
                    .store()
                    .unbonding_delegation(&pair.delegator, &pair.validator)?
                else {
                    continue;
                };
                let (matured, pending): (Vec<_>, Vec<_>) = ubd
                    .entries
                    .into_iter()
                    .partition(|entry| entry.is_mature(block_time));
                ubd.entries = pending;

                let amount: u128 = matured.iter().map(|e| e.balance).sum();
                let store = ctx.store_mut();
                store.set_unbonding_delegation(&ubd)?;
                if amount > 0 {
                    store.withdraw(false, amount)?;
                    released_total += amount;
                }
                if !matured.is_empty() {
                    ctx.emit(StakingEvent::CompleteUnbonding {
                        delegator: pair.delegator,
                        validator: pair.validator,
                        amount,
                    });
                }
            }
            ctx.store_mut().delete(&key);
        }

        if released_total > 0 {
            debug!(
                "Released {} unbonded tokens at block time {}",
                released_total, block_time
            );
        }
        Ok(released_total)
    }
}

fn check_denom(ctx: &Context, amount: &Coin) -> Result<()> {
    let expected = &ctx.params().bond_denom;
    if amount.denom != *expected {
        return Err(StakingError::BadDenom {
            got: amount.denom.clone(),
            expected: expected.clone(),
        });
    }
    Ok(())
}
