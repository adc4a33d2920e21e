//! Governance-driven key node committee changes
//!
//! A passed proposal swaps key nodes in and out directly. It obeys the same
//! churn quota as the automatic path and starts the same migration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::context::Context;
use crate::epoch::{Epoch, EpochReader};
use crate::error::{Result, StakingError};
use crate::events::StakingEvent;
use crate::keeper::StakingKeeper;
use crate::registry::RegistryReader;
use crate::types::{max_churn, Address};

/// Proposal changing key node membership
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateKeyNodesProposal {
    /// Validators joining the committee
    pub add: Vec<Address>,
    /// Members leaving the committee
    pub remove: Vec<Address>,
}

impl UpdateKeyNodesProposal {
    /// Stateless checks
    pub fn validate_basic(&self) -> Result<()> {
        if self.add.is_empty() && self.remove.is_empty() {
            return Err(StakingError::EmptyKeyNodeUpdate);
        }
        let mut seen = BTreeSet::new();
        for addr in self.add.iter().chain(self.remove.iter()) {
            if !seen.insert(*addr) {
                return Err(StakingError::DuplicateAddress(*addr));
            }
        }
        Ok(())
    }
}

impl StakingKeeper {
    /// Apply a passed key node update proposal
    ///
    /// Only allowed once the migration of the latest epoch has finished.
    /// Removals are limited to `ceil(|set| / 6)` members; every added
    /// validator must be unjailed, hold `min_key_node_delegation` tokens and
    /// have a heartbeat within `max_candidate_key_node_heartbeat_interval`.
    pub fn update_key_nodes(
        &self,
        ctx: &mut Context,
        proposal: &UpdateKeyNodesProposal,
    ) -> Result<Epoch> {
        proposal.validate_basic()?;
        let params = ctx.params().clone();
        let height = ctx.height();

        let latest = ctx.store().latest_epoch()?;
        if !latest.migration_finished {
            warn!(
                "Key node update rejected: migration to epoch {} in progress",
                latest.index
            );
            return Err(StakingError::MigrationInProgress(latest.index));
        }

        let mut key_nodes = latest.key_nodes();
        let quota = max_churn(key_nodes.len());
        if proposal.remove.len() > quota {
            return Err(StakingError::ChurnQuotaExceeded {
                requested: proposal.remove.len(),
                quota,
            });
        }
        for addr in &proposal.remove {
            if !key_nodes.remove(addr) {
                return Err(StakingError::NotKeyNode(*addr));
            }
        }

        for addr in &proposal.add {
            if key_nodes.contains(addr) {
                return Err(StakingError::AlreadyKeyNode(*addr));
            }
            let validator = ctx
                .store()
                .validator(addr)?
                .ok_or(StakingError::ValidatorNotFound(*addr))?;
            let reason = if validator.jailed {
                Some("validator is jailed".to_string())
            } else if validator.tokens < params.min_key_node_delegation {
                Some(format!(
                    "tokens {} below key node minimum {}",
                    validator.tokens, params.min_key_node_delegation
                ))
            } else if !validator
                .heartbeat_within(height, params.max_candidate_key_node_heartbeat_interval)
            {
                Some(format!(
                    "last heartbeat at height {} is too old",
                    validator.last_key_node_heartbeat_height
                ))
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(StakingError::IneligibleKeyNode {
                    address: *addr,
                    reason,
                });
            }
            key_nodes.insert(*addr);
        }

        if key_nodes.len() > params.max_key_nodes as usize {
            return Err(StakingError::TooManyKeyNodes {
                size: key_nodes.len(),
                max: params.max_key_nodes,
            });
        }

        let epoch = self.start_new_epoch(ctx, key_nodes.into_iter().collect())?;
        info!(
            "Governance moved key nodes to epoch {}: +{} -{}",
            epoch.index,
            proposal.add.len(),
            proposal.remove.len()
        );
        ctx.emit(StakingEvent::UpdateKeyNodes {
            epoch_index: epoch.index,
            added: proposal.add.clone(),
            removed: proposal.remove.clone(),
        });
        Ok(epoch)
    }
}
