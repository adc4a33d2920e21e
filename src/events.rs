//! Staking events and hooks
//!
//! Events are collected in the block context and returned with the block's
//! results. `MigrationBegin` is the trigger consumed by the key resharding
//! subsystem; the others form the audit trail.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::Context;
use crate::epoch::Epoch;
use crate::types::{Address, Validator};

/// Event emitted by a staking operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StakingEvent {
    /// Validator created with its self delegation
    CreateValidator {
        /// Operator address
        validator: Address,
        /// Self delegation
        amount: u128,
    },

    /// Validator description or commission edited
    EditValidator {
        /// Operator address
        validator: Address,
        /// Commission rate after the edit
        commission_rate_bps: u32,
        /// Minimum self delegation after the edit
        min_self_delegation: u128,
    },

    /// Tokens delegated
    Delegate {
        /// Delegator
        delegator: Address,
        /// Validator
        validator: Address,
        /// Amount
        amount: u128,
    },

    /// Tokens undelegated, locked until `completion_time`
    Unbond {
        /// Delegator
        delegator: Address,
        /// Validator
        validator: Address,
        /// Amount
        amount: u128,
        /// Block time at which the tokens are released
        completion_time: u64,
    },

    /// Unbonding delegation matured and paid out
    CompleteUnbonding {
        /// Delegator
        delegator: Address,
        /// Validator
        validator: Address,
        /// Amount
        amount: u128,
    },

    /// Validator finished unbonding
    CompleteValidatorUnbonding {
        /// Operator address
        validator: Address,
    },

    /// Validator jailed
    Jail {
        /// Operator address
        validator: Address,
        /// Whether the validator entered the jail queue
        queued: bool,
    },

    /// Key node jailed while the concurrent-jail quota is already used up
    KeyNodeJailDeferred {
        /// Operator address
        validator: Address,
        /// Queued key nodes including this one
        key_node_count: u64,
    },

    /// Validator unjailed
    Unjail {
        /// Operator address
        validator: Address,
    },

    /// Key node heartbeat accepted
    KeyNodeHeartbeat {
        /// Operator address
        validator: Address,
        /// Reported height
        height: u64,
    },

    /// Key node committee changed; resharding must start
    MigrationBegin {
        /// Index of the epoch being migrated to
        new_epoch_index: u64,
    },

    /// Committee changed by governance proposal
    UpdateKeyNodes {
        /// New epoch index
        epoch_index: u64,
        /// Members added
        added: Vec<Address>,
        /// Members removed
        removed: Vec<Address>,
    },

    /// Resharding for an epoch completed
    MigrationFinished {
        /// Epoch index
        epoch_index: u64,
    },
}

impl StakingEvent {
    /// Event type name
    pub fn kind(&self) -> &'static str {
        match self {
            StakingEvent::CreateValidator { .. } => "create_validator",
            StakingEvent::EditValidator { .. } => "edit_validator",
            StakingEvent::Delegate { .. } => "delegate",
            StakingEvent::Unbond { .. } => "unbond",
            StakingEvent::CompleteUnbonding { .. } => "complete_unbonding",
            StakingEvent::CompleteValidatorUnbonding { .. } => "complete_validator_unbonding",
            StakingEvent::Jail { .. } => "jail",
            StakingEvent::KeyNodeJailDeferred { .. } => "key_node_jail_deferred",
            StakingEvent::Unjail { .. } => "unjail",
            StakingEvent::KeyNodeHeartbeat { .. } => "key_node_heartbeat",
            StakingEvent::MigrationBegin { .. } => "migration_begin",
            StakingEvent::UpdateKeyNodes { .. } => "update_key_nodes",
            StakingEvent::MigrationFinished { .. } => "migration_finished",
        }
    }
}

impl fmt::Display for StakingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Callbacks into other modules on validator lifecycle changes
///
/// All methods default to no-ops.
pub trait StakingHooks: Send + Sync {
    /// Validator entered the bonded set
    fn after_validator_bonded(&self, _ctx: &Context, _validator: &Validator) {}

    /// Validator left the bonded set
    fn after_validator_begin_unbonding(&self, _ctx: &Context, _validator: &Validator) {}

    /// A new key node epoch was created and resharding must start
    fn after_migration_begin(&self, _ctx: &Context, _epoch: &Epoch) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl StakingHooks for NoopHooks {}
