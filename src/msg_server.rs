//! Validator lifecycle messages
//!
//! Handlers validate everything before the first write, so a rejected
//! message leaves the block store untouched.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Result, StakingError};
use crate::events::StakingEvent;
use crate::keeper::StakingKeeper;
use crate::registry::{Registry, RegistryReader};
use crate::types::{Address, Coin, Commission, ConsPubKey, Description, Validator};

/// Register a new validator with its initial self delegation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCreateValidator {
    /// Operator address, also the self delegator
    pub operator_address: Address,
    /// Consensus public key
    pub pubkey: ConsPubKey,
    /// Description
    pub description: Description,
    /// Initial commission; `update_time` is set from the block time
    pub commission: Commission,
    /// Minimum self delegation
    pub min_self_delegation: u128,
    /// Initial self delegation
    pub value: Coin,
}

/// Edit a validator; `None` fields stay unchanged
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgEditValidator {
    /// Operator address
    pub operator_address: Address,
    /// New description
    pub description: Option<Description>,
    /// New commission rate in basis points
    pub commission_rate_bps: Option<u32>,
    /// New minimum self delegation
    pub min_self_delegation: Option<u128>,
}

impl StakingKeeper {
    /// Create a validator
    ///
    /// The validator starts unbonded and enters the power index; the next
    /// end-block pass decides whether it is bonded.
    pub fn create_validator(&self, ctx: &mut Context, msg: MsgCreateValidator) -> Result<Validator> {
        let operator = msg.operator_address;
        if ctx.store().validator(&operator)?.is_some() {
            return Err(StakingError::ValidatorExists(operator));
        }
        let cons_addr = msg.pubkey.address();
        if ctx.store().validator_by_cons_addr(&cons_addr)?.is_some() {
            return Err(StakingError::PubKeyExists(cons_addr));
        }
        if msg.value.denom != ctx.params().bond_denom {
            return Err(StakingError::BadDenom {
                got: msg.value.denom,
                expected: ctx.params().bond_denom.clone(),
            });
        }
        msg.description.validate()?;
        msg.commission.validate()?;
        if msg.min_self_delegation == 0 {
            return Err(StakingError::InvalidData(
                "minimum self delegation must be positive".to_string(),
            ));
        }
        if msg.value.amount < msg.min_self_delegation {
            return Err(StakingError::SelfDelegationBelowMinimum {
                amount: msg.value.amount,
                min: msg.min_self_delegation,
            });
        }

        let mut commission = msg.commission;
        commission.update_time = ctx.block_time();
        let validator = Validator::new(
            operator,
            msg.pubkey,
            msg.description,
            commission,
            msg.min_self_delegation,
        );
        let reduction = ctx.params().power_reduction;
        let store = ctx.store_mut();
        store.set_validator(&validator)?;
        store.set_validator_by_cons_addr(&validator);
        store.set_validator_by_power_index(&validator, reduction);

        let amount = msg.value.amount;
        self.delegate(ctx, operator, operator, msg.value)?;

        info!(
            "Created validator {} with self delegation {}",
            operator, amount
        );
        ctx.emit(StakingEvent::CreateValidator {
            validator: operator,
            amount,
        });
        ctx.store()
            .validator(&operator)?
            .ok_or(StakingError::ValidatorNotFound(operator))
    }

    /// Edit a validator's description, commission rate or minimum self
    /// delegation
    pub fn edit_validator(&self, ctx: &mut Context, msg: MsgEditValidator) -> Result<Validator> {
        let operator = msg.operator_address;
        let mut validator = ctx
            .store()
            .validator(&operator)?
            .ok_or(StakingError::ValidatorNotFound(operator))?;

        if let Some(description) = msg.description {
            description.validate()?;
            validator.description = description;
        }

        if let Some(rate) = msg.commission_rate_bps {
            validator.commission.validate_new_rate(rate, ctx.block_time())?;
            validator.commission.rate_bps = rate;
            validator.commission.update_time = ctx.block_time();
        }

        if let Some(min_self_delegation) = msg.min_self_delegation {
            if min_self_delegation <= validator.min_self_delegation {
                return Err(StakingError::InvalidData(format!(
                    "minimum self delegation can only increase (current {}, requested {})",
                    validator.min_self_delegation, min_self_delegation
                )));
            }
            if min_self_delegation > validator.tokens {
                return Err(StakingError::InvalidData(format!(
                    "minimum self delegation {} exceeds validator tokens {}",
                    min_self_delegation, validator.tokens
                )));
            }
            validator.min_self_delegation = min_self_delegation;
        }

        ctx.store_mut().set_validator(&validator)?;
        debug!("Edited validator {}", operator);
        ctx.emit(StakingEvent::EditValidator {
            validator: operator,
            commission_rate_bps: validator.commission.rate_bps,
            min_self_delegation: validator.min_self_delegation,
        });
        Ok(validator)
    }

    /// Record a key node liveness heartbeat for `height`
    ///
    /// The height must be below the current block height and not older than
    /// the last accepted heartbeat.
    pub fn key_node_heartbeat(
        &self,
        ctx: &mut Context,
        operator: &Address,
        height: u64,
    ) -> Result<Validator> {
        let mut validator = ctx
            .store()
            .validator(operator)?
            .ok_or(StakingError::ValidatorNotFound(*operator))?;
        let current = ctx.height();
        if height >= current {
            warn!(
                "Rejected heartbeat from {} for height {} at height {}",
                operator, height, current
            );
            return Err(StakingError::InvalidHeartbeatHeight { height, current });
        }
        if height < validator.last_key_node_heartbeat_height {
            return Err(StakingError::StaleHeartbeat {
                height,
                last: validator.last_key_node_heartbeat_height,
            });
        }

        validator.last_key_node_heartbeat_height = height;
        ctx.store_mut().set_validator(&validator)?;
        debug!("Heartbeat from {} at height {}", operator, height);
        ctx.emit(StakingEvent::KeyNodeHeartbeat {
            validator: *operator,
            height,
        });
        Ok(validator)
    }
}
