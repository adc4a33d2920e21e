//! Genesis import and export
//!
//! A fresh chain lists unbonded validators with their delegations; the
//! update engine then bonds them at height 0 and writes the first epoch. An
//! exported state carries `last_validator_powers` and epochs, and importing it
//! restores the bonded set as it was instead of recomputing it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

use crate::context::{read_params, Context};
use crate::delegation::{Delegation, DelegationReader, DelegationStore, DvPair, UnbondingDelegation};
use crate::engine::insert_validator_queue;
use crate::epoch::{Epoch, EpochReader, EpochStore};
use crate::error::{Result, StakingError};
use crate::jail_queue::{JailQueue, JailedQueueInfo};
use crate::keeper::StakingKeeper;
use crate::keys::jailed_queue_key;
use crate::params::Params;
use crate::pool::PoolLedger;
use crate::registry::{Registry, RegistryReader};
use crate::store::{KvRead, KvStore};
use crate::types::{Address, Validator, ValidatorUpdate};

/// Power of a bonded validator at export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastValidatorPower {
    /// Operator address
    pub address: Address,
    /// Consensus power
    pub power: u64,
}

/// Staking genesis state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisState {
    /// Parameters
    pub params: Params,
    /// Validators
    pub validators: Vec<Validator>,
    /// Delegations; per validator they must sum to its tokens
    pub delegations: Vec<Delegation>,
    /// Pending unbonding delegations
    pub unbonding_delegations: Vec<UnbondingDelegation>,
    /// Bonded powers of an exported chain, empty for a fresh chain
    pub last_validator_powers: Vec<LastValidatorPower>,
    /// Total power of an exported chain
    pub last_total_power: u128,
    /// Epochs of an exported chain
    pub epochs: Vec<Epoch>,
}

impl GenesisState {
    /// Parse genesis from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load genesis from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let genesis = Self::from_json_str(&json)?;
        info!(
            "Loaded staking genesis from {} ({} validators)",
            path.display(),
            genesis.validators.len()
        );
        Ok(genesis)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;

        let mut operators = BTreeSet::new();
        let mut cons_addrs = BTreeSet::new();
        for v in &self.validators {
            if !operators.insert(v.operator_address) {
                return Err(StakingError::ValidatorExists(v.operator_address));
            }
            if !cons_addrs.insert(v.cons_address()) {
                return Err(StakingError::PubKeyExists(v.cons_address()));
            }
            v.commission.validate()?;
        }

        let mut delegated: BTreeMap<Address, u128> = BTreeMap::new();
        for d in &self.delegations {
            if !operators.contains(&d.validator_address) {
                return Err(StakingError::ValidatorNotFound(d.validator_address));
            }
            *delegated.entry(d.validator_address).or_default() += d.amount;
        }
        for v in &self.validators {
            let sum = delegated.get(&v.operator_address).copied().unwrap_or(0);
            if sum != v.tokens {
                return Err(StakingError::InvalidData(format!(
                    "validator {} has {} tokens but {} delegated",
                    v.operator_address, v.tokens, sum
                )));
            }
        }

        let powered: BTreeSet<Address> =
            self.last_validator_powers.iter().map(|p| p.address).collect();
        for v in &self.validators {
            if v.is_bonded() != powered.contains(&v.operator_address) {
                return Err(StakingError::InvalidData(format!(
                    "validator {} is {} but {} a last power",
                    v.operator_address,
                    v.status,
                    if v.is_bonded() { "lacks" } else { "has" }
                )));
            }
        }

        for (i, epoch) in self.epochs.iter().enumerate() {
            if epoch.index != i as u64 + 1 {
                return Err(StakingError::InvalidData(format!(
                    "epoch at position {} has index {}",
                    i, epoch.index
                )));
            }
            // Membership lookups binary search the set
            if epoch.key_node_set.windows(2).any(|w| w[0] >= w[1]) {
                return Err(StakingError::InvalidData(format!(
                    "epoch {} key node set is not sorted or has duplicates",
                    epoch.index
                )));
            }
        }
        if let Some(latest) = self.epochs.last() {
            if let Some(missing) = latest
                .key_node_set
                .iter()
                .find(|addr| !operators.contains(*addr))
            {
                return Err(StakingError::ValidatorNotFound(*missing));
            }
        }
        Ok(())
    }
}

impl StakingKeeper {
    /// Write genesis state and return the initial validator updates
    pub fn init_genesis(&self, ctx: &mut Context, genesis: GenesisState) -> Result<Vec<ValidatorUpdate>> {
        genesis.validate()?;
        ctx.set_params(genesis.params.clone())?;
        let reduction = genesis.params.power_reduction;

        let mut queued: Vec<(u64, Address)> = Vec::new();
        for v in &genesis.validators {
            let store = ctx.store_mut();
            store.set_validator(v)?;
            store.set_validator_by_cons_addr(v);
            store.set_validator_by_power_index(v, reduction);
            store.deposit(v.is_bonded(), v.tokens)?;
            if v.is_unbonding() {
                insert_validator_queue(store, v)?;
            }
            if v.jailed_index != 0 {
                queued.push((v.jailed_index, v.operator_address));
            }
        }

        queued.sort();
        let mut info = JailedQueueInfo::default();
        for (index, addr) in &queued {
            ctx.store_mut()
                .set(jailed_queue_key(*index), addr.as_bytes().to_vec());
            info.index = info.index.max(*index);
        }
        ctx.store_mut().set_jailed_queue_info(&info)?;

        for d in &genesis.delegations {
            ctx.store_mut().set_delegation(d)?;
        }
        for ubd in &genesis.unbonding_delegations {
            let store = ctx.store_mut();
            store.set_unbonding_delegation(ubd)?;
            for entry in &ubd.entries {
                store.insert_unbonding_queue(
                    entry.completion_time,
                    DvPair {
                        delegator: ubd.delegator_address,
                        validator: ubd.validator_address,
                    },
                )?;
                store.deposit(false, entry.balance)?;
            }
        }

        for epoch in &genesis.epochs {
            ctx.store_mut().set_epoch(epoch)?;
        }
        let key_nodes = ctx.store().latest_epoch()?.key_nodes();
        ctx.store_mut().recount_jailed_key_nodes(&key_nodes)?;

        let updates = if genesis.last_validator_powers.is_empty() {
            self.apply_and_return_validator_set_updates(ctx)?
        } else {
            let mut updates = Vec::with_capacity(genesis.last_validator_powers.len());
            for lvp in &genesis.last_validator_powers {
                let validator = ctx.store().must_validator(&lvp.address)?;
                ctx.store_mut().set_last_validator_power(&lvp.address, lvp.power);
                updates.push(validator.update(lvp.power));
            }
            ctx.store_mut().set_last_total_power(genesis.last_total_power);
            updates
        };

        info!(
            "Staking genesis: {} validators, {} delegations, {} initial updates",
            genesis.validators.len(),
            genesis.delegations.len(),
            updates.len()
        );
        Ok(updates)
    }
}

/// Export the full staking state
pub fn export_genesis<S: KvRead + ?Sized>(store: &S) -> Result<GenesisState> {
    let last_validator_powers = store
        .last_validator_powers()?
        .into_iter()
        .map(|(address, power)| LastValidatorPower { address, power })
        .collect();
    Ok(GenesisState {
        params: read_params(store)?,
        validators: store.validators()?,
        delegations: store.delegations()?,
        unbonding_delegations: store.unbonding_delegations()?,
        last_validator_powers,
        last_total_power: store.last_total_power()?,
        epochs: store.epochs()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlockHeader;
    use crate::store::StateDb;
    use crate::types::{Commission, ConsPubKey, Description, ADDRESS_LEN};

    const REDUCTION: u128 = 1_000_000;

    fn addr(id: u8) -> Address {
        Address::new([id; ADDRESS_LEN])
    }

    fn genesis_with(validators: &[(u8, u128)]) -> GenesisState {
        let mut genesis = GenesisState {
            params: Params {
                min_validator_delegation: REDUCTION,
                min_key_node_delegation: REDUCTION,
                ..Params::default()
            },
            ..GenesisState::default()
        };
        for (id, tokens) in validators {
            let mut v = Validator::new(
                addr(*id),
                ConsPubKey::new(vec![*id; 32]).unwrap(),
                Description::default(),
                Commission::default(),
                1,
            );
            v.tokens = *tokens;
            genesis.validators.push(v);
            genesis.delegations.push(Delegation {
                delegator_address: addr(*id),
                validator_address: addr(*id),
                amount: *tokens,
            });
        }
        genesis
    }

    fn genesis_ctx(db: &StateDb) -> Context {
        Context::with_params(BlockHeader::new(0, 0), db.begin(), Params::default())
    }

    #[test]
    fn test_fresh_genesis_bonds_and_creates_epoch() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let mut ctx = genesis_ctx(&db);

        let genesis = genesis_with(&[(1, 3 * REDUCTION), (2, 5 * REDUCTION)]);
        let updates = keeper.init_genesis(&mut ctx, genesis).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].power, 5);

        let epoch = ctx.store().epoch(1).unwrap().unwrap();
        assert_eq!(epoch.key_node_set, vec![addr(1), addr(2)]);
        assert!(epoch.migration_finished);
    }

    #[test]
    fn test_export_import_restores_bonded_set() {
        let keeper = StakingKeeper::new();
        let db = StateDb::new();
        let mut ctx = genesis_ctx(&db);
        keeper
            .init_genesis(&mut ctx, genesis_with(&[(1, 3 * REDUCTION), (2, 5 * REDUCTION)]))
            .unwrap();
        ctx.commit(&db).unwrap();

        let exported = export_genesis(&db.snapshot()).unwrap();
        assert_eq!(exported.last_validator_powers.len(), 2);
        assert_eq!(exported.last_total_power, 8);

        let json = exported.to_json().unwrap();
        let parsed = GenesisState::from_json_str(&json).unwrap();
        assert_eq!(parsed, exported);

        let other = StateDb::new();
        let mut ctx = genesis_ctx(&other);
        let updates = keeper.init_genesis(&mut ctx, parsed).unwrap();
        assert_eq!(updates.len(), 2);
        ctx.commit(&other).unwrap();
        assert_eq!(export_genesis(&other.snapshot()).unwrap(), exported);
    }

    #[test]
    fn test_validate_rejects_token_mismatch() {
        let mut genesis = genesis_with(&[(1, 3 * REDUCTION)]);
        genesis.delegations[0].amount = 1;
        assert!(genesis.validate().is_err());

        let mut genesis = genesis_with(&[(1, 3 * REDUCTION), (1, 3 * REDUCTION)]);
        genesis.delegations.truncate(1);
        assert!(matches!(
            genesis.validate(),
            Err(StakingError::ValidatorExists(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unordered_key_node_set() {
        let mut genesis = genesis_with(&[(1, 3 * REDUCTION), (2, 3 * REDUCTION)]);
        genesis.epochs.push(Epoch {
            key_node_set: vec![addr(2), addr(1)],
            ..Epoch::genesis()
        });
        assert!(matches!(genesis.validate(), Err(StakingError::InvalidData(_))));

        genesis.epochs[0].key_node_set = vec![addr(1), addr(1), addr(2)];
        assert!(matches!(genesis.validate(), Err(StakingError::InvalidData(_))));

        genesis.epochs[0].key_node_set = vec![addr(1), addr(2)];
        genesis.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_key_node() {
        let mut genesis = genesis_with(&[(1, 3 * REDUCTION)]);
        genesis.epochs.push(Epoch {
            key_node_set: vec![addr(1), addr(7)],
            ..Epoch::genesis()
        });
        assert!(matches!(
            genesis.validate(),
            Err(StakingError::ValidatorNotFound(a)) if a == addr(7)
        ));
    }

    #[test]
    fn test_from_json_file() {
        let genesis = genesis_with(&[(1, 3 * REDUCTION)]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genesis.json");
        std::fs::write(&path, genesis.to_json().unwrap()).unwrap();

        let loaded = GenesisState::from_json_file(&path).unwrap();
        assert_eq!(loaded, genesis);
    }
}
