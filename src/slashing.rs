//! Jailing and unjailing
//!
//! A jailed validator leaves the power index at once. If it was bonded or
//! unbonding, or sits in the key node set, it also enters the jail queue,
//! where its jailing waits to be
//! finalized by the next end-block release pass. Evidence handling and
//! slash amounts are decided outside this crate; callers only say who is
//! jailed and why.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::Context;
use crate::error::{Result, StakingError};
use crate::events::StakingEvent;
use crate::jail_queue::{JailQueue, JailQueueReader};
use crate::keeper::StakingKeeper;
use crate::registry::{Registry, RegistryReader};
use crate::types::{Address, ConsAddress, Validator};

/// Jail reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JailReason {
    /// Double signing detected
    DoubleSigning,

    /// Excessive downtime
    ExcessiveDowntime,

    /// Operator self delegation fell below its declared minimum
    LowSelfDelegation,

    /// Manual jailing by governance
    Manual,
}

impl std::fmt::Display for JailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JailReason::DoubleSigning => write!(f, "DoubleSigning"),
            JailReason::ExcessiveDowntime => write!(f, "ExcessiveDowntime"),
            JailReason::LowSelfDelegation => write!(f, "LowSelfDelegation"),
            JailReason::Manual => write!(f, "Manual"),
        }
    }
}

impl StakingKeeper {
    /// Jail the validator signing with `cons_addr`
    pub fn jail(
        &self,
        ctx: &mut Context,
        cons_addr: &ConsAddress,
        reason: JailReason,
    ) -> Result<Validator> {
        let validator = ctx
            .store()
            .validator_by_cons_addr(cons_addr)?
            .ok_or(StakingError::ConsAddressNotFound(*cons_addr))?;
        if validator.jailed {
            warn!(
                "Validator {} already jailed, ignoring {}",
                validator.operator_address, reason
            );
            return Err(StakingError::ValidatorJailed(validator.operator_address));
        }
        self.jail_validator(ctx, validator, reason)
    }

    /// Jail a validator that is known not to be jailed
    ///
    /// Bonded and unbonding validators are queued, and so is any key node
    /// whatever its status, so its seat is released within the churn quota.
    /// A key node queued while the
    /// release quota is already used up stays queued past the quota and a
    /// `KeyNodeJailDeferred` event records it.
    ///
    /// # Panics
    ///
    /// Panics if the validator is already jailed.
    pub(crate) fn jail_validator(
        &self,
        ctx: &mut Context,
        mut validator: Validator,
        reason: JailReason,
    ) -> Result<Validator> {
        let addr = validator.operator_address;
        if validator.jailed {
            error!("Attempt to jail already jailed validator {}", addr);
            panic!("cannot jail already jailed validator {}", addr);
        }

        let reduction = ctx.params().power_reduction;
        let key_nodes = self.jail_reference_set(ctx)?;
        ctx.store_mut()
            .delete_validator_by_power_index(&validator, reduction);
        validator.jailed = true;

        let queued = !validator.is_unbonded() || key_nodes.contains(&addr);
        if queued {
            let at_limit = ctx.store().jail_queue_reach_limit(&key_nodes)?;
            ctx.store_mut().insert_jailed(&mut validator, &key_nodes)?;
            if at_limit && key_nodes.contains(&addr) {
                let key_node_count = ctx.store().jailed_queue_info()?.key_node_count;
                warn!(
                    "Key node {} jailed with release quota used up ({} queued), release deferred",
                    addr, key_node_count
                );
                ctx.emit(StakingEvent::KeyNodeJailDeferred {
                    validator: addr,
                    key_node_count,
                });
            }
        } else {
            ctx.store_mut().set_validator(&validator)?;
        }

        info!(
            "Validator {} jailed for {} (status {}, queued: {})",
            addr, reason, validator.status, queued
        );
        ctx.emit(StakingEvent::Jail {
            validator: addr,
            queued,
        });
        Ok(validator)
    }

    /// Unjail a validator whose operator restored its self delegation
    ///
    /// A queued validator leaves the jail queue; in every case it re-enters
    /// the power index and competes for a bonded seat at end-block.
    pub fn unjail(&self, ctx: &mut Context, operator: &Address) -> Result<Validator> {
        let mut validator = ctx
            .store()
            .validator(operator)?
            .ok_or(StakingError::ValidatorNotFound(*operator))?;
        if !validator.jailed {
            return Err(StakingError::ValidatorNotJailed(*operator));
        }
        let self_delegation = self.self_delegation(ctx, operator)?;
        if self_delegation < validator.min_self_delegation {
            return Err(StakingError::SelfDelegationBelowMinimum {
                amount: self_delegation,
                min: validator.min_self_delegation,
            });
        }

        let reduction = ctx.params().power_reduction;
        let key_nodes = self.jail_reference_set(ctx)?;
        let was_queued = ctx.store_mut().delete_jailed(&mut validator, &key_nodes)?;
        validator.jailed = false;
        let store = ctx.store_mut();
        store.set_validator(&validator)?;
        store.set_validator_by_power_index(&validator, reduction);

        info!(
            "Validator {} unjailed (was queued: {})",
            operator, was_queued
        );
        ctx.emit(StakingEvent::Unjail {
            validator: *operator,
        });
        Ok(validator)
    }
}
