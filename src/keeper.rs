//! Staking keeper
//!
//! The keeper owns no state of its own: everything lives in the block
//! context's store. It carries the hooks into other modules and exposes the
//! operations that need them (epoch changes, validator transitions, the
//! end-block pass).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::Context;
use crate::epoch::{Epoch, EpochReader, EpochStore};
use crate::error::{Result, StakingError};
use crate::events::{NoopHooks, StakingEvent, StakingHooks};
use crate::jail_queue::JailQueue;
use crate::registry::{Registry, RegistryReader};
use crate::types::{Address, ValidatorUpdate};

/// Entry point for staking state transitions
#[derive(Clone)]
pub struct StakingKeeper {
    hooks: Arc<dyn StakingHooks>,
}

impl StakingKeeper {
    /// Create a keeper without hooks
    pub fn new() -> Self {
        Self::with_hooks(Arc::new(NoopHooks))
    }

    /// Create a keeper calling `hooks` on lifecycle changes
    pub fn with_hooks(hooks: Arc<dyn StakingHooks>) -> Self {
        Self { hooks }
    }

    /// Get hooks
    pub fn hooks(&self) -> &dyn StakingHooks {
        self.hooks.as_ref()
    }

    /// Epoch in effect at the context's height
    pub fn current_epoch(&self, ctx: &Context) -> Result<Epoch> {
        ctx.store().epoch_by_height(ctx.height())
    }

    /// Key node set the jail queue counts against
    ///
    /// This is the newest epoch's set, which differs from the current one
    /// only for the rest of the block that created a new epoch.
    pub fn jail_reference_set(&self, ctx: &Context) -> Result<BTreeSet<Address>> {
        Ok(ctx.store().latest_epoch()?.key_nodes())
    }

    /// Open a new key node epoch and signal the migration
    ///
    /// Keeps the advisory `is_key_node` flags and the jail queue's key node
    /// count in line with the new set. Above height 0 a `MigrationBegin`
    /// event is emitted and the migration hook is called.
    pub fn start_new_epoch(&self, ctx: &mut Context, key_nodes: Vec<Address>) -> Result<Epoch> {
        let height = ctx.height();
        let previous = ctx.store().latest_epoch()?.key_nodes();
        let epoch = ctx.store_mut().start_new_epoch(height, key_nodes)?;
        let current = epoch.key_nodes();

        for addr in previous.symmetric_difference(&current) {
            if let Some(mut validator) = ctx.store().validator(addr)? {
                validator.is_key_node = current.contains(addr);
                ctx.store_mut().set_validator(&validator)?;
                debug!(
                    "Validator {} key node flag set to {}",
                    addr, validator.is_key_node
                );
            }
        }
        ctx.store_mut().recount_jailed_key_nodes(&current)?;

        if height > 0 {
            info!(
                "Key node migration begins for epoch {} at height {}",
                epoch.index, height
            );
            ctx.emit(StakingEvent::MigrationBegin {
                new_epoch_index: epoch.index,
            });
            self.hooks.after_migration_begin(ctx, &epoch);
        }
        Ok(epoch)
    }

    /// Record that resharding to `epoch_index` completed
    pub fn set_migration_finished(&self, ctx: &mut Context, epoch_index: u64) -> Result<Epoch> {
        let height = ctx.height();
        let current = self.current_epoch(ctx)?;
        if current.index != epoch_index {
            return Err(StakingError::InvalidData(format!(
                "migration reported for epoch {} but epoch {} is current",
                epoch_index, current.index
            )));
        }
        let epoch = ctx.store_mut().set_migration_finished(height)?;
        ctx.emit(StakingEvent::MigrationFinished {
            epoch_index: epoch.index,
        });
        Ok(epoch)
    }

    /// End-block pass
    ///
    /// Applies validator set changes, then matures unbonding validators and
    /// unbonding delegations. Returns the updates for the consensus engine.
    pub fn end_block(&self, ctx: &mut Context) -> Result<Vec<ValidatorUpdate>> {
        let updates = self.apply_and_return_validator_set_updates(ctx)?;
        self.unbond_all_mature_validators(ctx)?;
        self.complete_mature_unbonding_delegations(ctx)?;
        Ok(updates)
    }
}

impl Default for StakingKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StakingKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StakingKeeper").finish_non_exhaustive()
    }
}
