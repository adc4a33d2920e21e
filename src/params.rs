//! Staking parameters
//!
//! A `Params` value is a read-only snapshot taken at the start of a block and
//! carried in the block context. Parameters load from JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, StakingError};

/// Default consensus power reduction (tokens per unit of power)
pub const DEFAULT_POWER_REDUCTION: u128 = 1_000_000;

/// Staking parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Maximum number of bonded validators
    pub max_validators: u32,

    /// Maximum size of the key node committee
    pub max_key_nodes: u32,

    /// Maximum unbonding entries per delegator/validator pair
    pub max_entries: u32,

    /// Denomination accepted for bonding
    pub bond_denom: String,

    /// Minimum tokens for a validator to be bonded
    pub min_validator_delegation: u128,

    /// Minimum tokens for a validator to hold a key share
    pub min_key_node_delegation: u128,

    /// Heartbeat freshness (blocks) required from a new key node candidate
    pub max_candidate_key_node_heartbeat_interval: u64,

    /// Heartbeat freshness (blocks) required from a sitting key node
    pub max_key_node_heartbeat_interval: u64,

    /// Unbonding duration in seconds of block time
    pub unbonding_time: u64,

    /// Tokens per unit of consensus power
    pub power_reduction: u128,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_validators: 100,
            max_key_nodes: 21,
            max_entries: 7,
            bond_denom: "sbtc".to_string(),
            min_validator_delegation: 1_000_000,
            min_key_node_delegation: 10_000_000,
            max_candidate_key_node_heartbeat_interval: 100,
            max_key_node_heartbeat_interval: 1_000,
            unbonding_time: 21 * 24 * 60 * 60, // 21 days
            power_reduction: DEFAULT_POWER_REDUCTION,
        }
    }
}

impl Params {
    /// Check parameter consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_validators == 0 {
            return Err(StakingError::InvalidParams(
                "max_validators must be positive".to_string(),
            ));
        }
        if self.max_key_nodes > self.max_validators {
            return Err(StakingError::InvalidParams(format!(
                "max_key_nodes {} exceeds max_validators {}",
                self.max_key_nodes, self.max_validators
            )));
        }
        if self.max_entries == 0 {
            return Err(StakingError::InvalidParams(
                "max_entries must be positive".to_string(),
            ));
        }
        if self.bond_denom.trim().is_empty() {
            return Err(StakingError::InvalidParams(
                "bond_denom cannot be blank".to_string(),
            ));
        }
        if self.power_reduction == 0 {
            return Err(StakingError::InvalidParams(
                "power_reduction must be positive".to_string(),
            ));
        }
        if self.min_key_node_delegation < self.min_validator_delegation {
            return Err(StakingError::InvalidParams(format!(
                "min_key_node_delegation {} is below min_validator_delegation {}",
                self.min_key_node_delegation, self.min_validator_delegation
            )));
        }
        Ok(())
    }

    /// Parse and validate parameters from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Params = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Load and validate parameters from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let params = Self::from_json_str(&json)?;
        info!(
            "Loaded staking params from {} (max validators: {}, max key nodes: {})",
            path.display(),
            params.max_validators,
            params.max_key_nodes
        );
        Ok(params)
    }
}
