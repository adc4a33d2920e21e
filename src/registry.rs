//! Validator registry and power index
//!
//! The registry is the only mutation path for `Validator` records. It keeps
//! three structures in lockstep with the record itself:
//! - the consensus-address lookup
//! - the power index, ordered by (power, operator address)
//! - the `LastValidatorPower` snapshot written by the update engine
//!
//! Reads are available on any `KvRead` (block stores and query snapshots),
//! writes on any `KvStore`.

use std::collections::BTreeMap;
use tracing::{debug, error};

use crate::codec::{self, decode_u128, decode_u64, encode_u128, encode_u64};
use crate::error::{Result, StakingError};
use crate::keys::{
    address_from_last_power_key, address_from_power_index_key, last_validator_power_key,
    power_index_key, validator_by_cons_key, validator_key, LAST_TOTAL_POWER_KEY,
    LAST_VALIDATOR_POWER_PREFIX, POWER_INDEX_PREFIX, VALIDATOR_PREFIX,
};
use crate::store::{KvRead, KvStore, Order};
use crate::types::{Address, ConsAddress, Validator};

/// Read access to validator records
pub trait RegistryReader: KvRead {
    /// Get a validator by operator address
    fn validator(&self, addr: &Address) -> Result<Option<Validator>> {
        self.get(&validator_key(addr))
            .map(|bytes| codec::decode(&bytes))
            .transpose()
    }

    /// Get a validator that an index says must exist
    ///
    /// # Panics
    ///
    /// Panics if the record is missing: an index entry without a backing
    /// record means the registry is corrupt.
    fn must_validator(&self, addr: &Address) -> Result<Validator> {
        match self.validator(addr)? {
            Some(validator) => Ok(validator),
            None => {
                error!("Index references missing validator {}", addr);
                panic!("validator record not found for indexed address {}", addr);
            }
        }
    }

    /// Get a validator by consensus address
    fn validator_by_cons_addr(&self, cons: &ConsAddress) -> Result<Option<Validator>> {
        match self.get(&validator_by_cons_key(cons)) {
            Some(bytes) => {
                let addr = Address::from_slice(&bytes)?;
                self.validator(&addr)
            }
            None => Ok(None),
        }
    }

    /// All validators in ascending operator address order
    fn validators(&self) -> Result<Vec<Validator>> {
        self.prefix_scan(VALIDATOR_PREFIX, Order::Ascending)
            .into_iter()
            .map(|(_, bytes)| codec::decode(&bytes))
            .collect()
    }

    /// Operator addresses in the power index, in the given order
    ///
    /// `Order::Descending` yields the highest power first; ties are broken
    /// by the higher operator address.
    fn power_index(&self, order: Order) -> Vec<Address> {
        self.prefix_scan(POWER_INDEX_PREFIX, order)
            .into_iter()
            .filter_map(|(key, _)| address_from_power_index_key(&key))
            .collect()
    }

    /// Whether the validator currently has a power index entry
    fn in_power_index(&self, validator: &Validator, power_reduction: u128) -> bool {
        self.has(&power_index_key(
            validator.potential_consensus_power(power_reduction),
            &validator.operator_address,
        ))
    }

    /// Power assigned to a validator in the previous update pass
    fn last_validator_power(&self, addr: &Address) -> Result<Option<u64>> {
        self.get(&last_validator_power_key(addr))
            .map(|bytes| decode_u64(&bytes))
            .transpose()
    }

    /// All powers from the previous update pass, keyed by operator address
    fn last_validator_powers(&self) -> Result<BTreeMap<Address, u64>> {
        let mut powers = BTreeMap::new();
        for (key, value) in self.prefix_scan(LAST_VALIDATOR_POWER_PREFIX, Order::Ascending) {
            let addr = address_from_last_power_key(&key).ok_or_else(|| {
                StakingError::InvalidData("malformed last validator power key".to_string())
            })?;
            powers.insert(addr, decode_u64(&value)?);
        }
        Ok(powers)
    }

    /// Total power of the previous update pass
    fn last_total_power(&self) -> Result<u128> {
        self.get(LAST_TOTAL_POWER_KEY)
            .map(|bytes| decode_u128(&bytes))
            .transpose()
            .map(|power| power.unwrap_or(0))
    }

    /// Bonded validators, highest power first
    fn bonded_validators_by_power(&self, max_validators: u32) -> Result<Vec<Validator>> {
        let mut bonded = Vec::new();
        for addr in self.power_index(Order::Descending) {
            if bonded.len() >= max_validators as usize {
                break;
            }
            let validator = self.must_validator(&addr)?;
            if validator.is_bonded() {
                bonded.push(validator);
            }
        }
        Ok(bonded)
    }
}

impl<S: KvRead + ?Sized> RegistryReader for S {}

/// Write access to validator records
pub trait Registry: KvStore + RegistryReader {
    /// Store a validator record
    fn set_validator(&mut self, validator: &Validator) -> Result<()> {
        self.set(
            validator_key(&validator.operator_address),
            codec::encode(validator)?,
        );
        Ok(())
    }

    /// Store the consensus-address lookup for a validator
    fn set_validator_by_cons_addr(&mut self, validator: &Validator) {
        self.set(
            validator_by_cons_key(&validator.cons_address()),
            validator.operator_address.as_bytes().to_vec(),
        );
    }

    /// Insert the validator's power index entry
    ///
    /// Jailed validators never enter the power index.
    fn set_validator_by_power_index(&mut self, validator: &Validator, power_reduction: u128) {
        if validator.jailed {
            return;
        }
        let power = validator.potential_consensus_power(power_reduction);
        self.set(
            power_index_key(power, &validator.operator_address),
            Vec::new(),
        );
    }

    /// Remove the validator's power index entry for its current tokens
    fn delete_validator_by_power_index(&mut self, validator: &Validator, power_reduction: u128) {
        let power = validator.potential_consensus_power(power_reduction);
        self.delete(&power_index_key(power, &validator.operator_address));
    }

    /// Record the power assigned in this update pass
    fn set_last_validator_power(&mut self, addr: &Address, power: u64) {
        self.set(last_validator_power_key(addr), encode_u64(power));
    }

    /// Drop the recorded power of a validator leaving the bonded set
    fn delete_last_validator_power(&mut self, addr: &Address) {
        self.delete(&last_validator_power_key(addr));
    }

    /// Record the total power of this update pass
    fn set_last_total_power(&mut self, power: u128) {
        self.set(LAST_TOTAL_POWER_KEY.to_vec(), encode_u128(power));
    }

    /// Add tokens to a validator, moving its power index entry
    fn add_validator_tokens(
        &mut self,
        mut validator: Validator,
        amount: u128,
        power_reduction: u128,
    ) -> Result<Validator> {
        self.delete_validator_by_power_index(&validator, power_reduction);
        validator.tokens = validator.tokens.checked_add(amount).ok_or_else(|| {
            StakingError::InvalidData(format!(
                "token overflow for validator {}",
                validator.operator_address
            ))
        })?;
        self.set_validator(&validator)?;
        self.set_validator_by_power_index(&validator, power_reduction);
        debug!(
            "Validator {} tokens +{} -> {}",
            validator.operator_address, amount, validator.tokens
        );
        Ok(validator)
    }

    /// Remove tokens from a validator, moving its power index entry
    ///
    /// # Panics
    ///
    /// Panics if the validator holds fewer tokens than `amount`; callers check
    /// delegation balances first, so this indicates corrupted accounting.
    fn remove_validator_tokens(
        &mut self,
        mut validator: Validator,
        amount: u128,
        power_reduction: u128,
    ) -> Result<Validator> {
        if validator.tokens < amount {
            error!(
                "Validator {} holds {} tokens, cannot remove {}",
                validator.operator_address, validator.tokens, amount
            );
            panic!(
                "token underflow for validator {}",
                validator.operator_address
            );
        }
        self.delete_validator_by_power_index(&validator, power_reduction);
        validator.tokens -= amount;
        self.set_validator(&validator)?;
        self.set_validator_by_power_index(&validator, power_reduction);
        debug!(
            "Validator {} tokens -{} -> {}",
            validator.operator_address, amount, validator.tokens
        );
        Ok(validator)
    }

    /// Delete an unbonded validator without tokens from every index
    ///
    /// # Panics
    ///
    /// Panics if the validator is not unbonded, still holds tokens or is
    /// still referenced by the jail queue.
    fn remove_validator(&mut self, addr: &Address, power_reduction: u128) -> Result<()> {
        let Some(validator) = self.validator(addr)? else {
            return Ok(());
        };
        if !validator.is_unbonded() || validator.tokens != 0 || validator.jailed_index != 0 {
            error!(
                "Refusing to remove validator {} (status {}, tokens {}, jailed index {})",
                addr, validator.status, validator.tokens, validator.jailed_index
            );
            panic!("cannot remove validator {} in its current state", addr);
        }
        self.delete(&validator_key(addr));
        self.delete(&validator_by_cons_key(&validator.cons_address()));
        self.delete_validator_by_power_index(&validator, power_reduction);
        self.delete_last_validator_power(addr);
        debug!("Removed validator {}", addr);
        Ok(())
    }
}

impl<S: KvStore + ?Sized> Registry for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::types::{BondStatus, Commission, ConsPubKey, Description, ADDRESS_LEN};

    const REDUCTION: u128 = 1_000_000;

    fn create_test_validator(id: u8, tokens: u128) -> Validator {
        let mut v = Validator::new(
            Address::new([id; ADDRESS_LEN]),
            ConsPubKey::new(vec![id; 32]).unwrap(),
            Description::default(),
            Commission::default(),
            1,
        );
        v.tokens = tokens;
        v
    }

    fn store_validator(store: &mut MemStore, v: &Validator) {
        store.set_validator(v).unwrap();
        store.set_validator_by_cons_addr(v);
        store.set_validator_by_power_index(v, REDUCTION);
    }

    #[test]
    fn test_set_and_lookup() {
        let mut store = MemStore::new();
        let v = create_test_validator(1, 5 * REDUCTION);
        store_validator(&mut store, &v);

        assert_eq!(store.validator(&v.operator_address).unwrap(), Some(v.clone()));
        assert_eq!(
            store.validator_by_cons_addr(&v.cons_address()).unwrap(),
            Some(v.clone())
        );
        assert!(store.in_power_index(&v, REDUCTION));
    }

    #[test]
    fn test_power_index_descending_with_tiebreak() {
        let mut store = MemStore::new();
        store_validator(&mut store, &create_test_validator(1, 5 * REDUCTION));
        store_validator(&mut store, &create_test_validator(2, 9 * REDUCTION));
        store_validator(&mut store, &create_test_validator(3, 5 * REDUCTION));

        let order = store.power_index(Order::Descending);
        assert_eq!(
            order,
            vec![
                Address::new([2; ADDRESS_LEN]),
                Address::new([3; ADDRESS_LEN]),
                Address::new([1; ADDRESS_LEN]),
            ]
        );
    }

    #[test]
    fn test_token_changes_move_power_index() {
        let mut store = MemStore::new();
        let v = create_test_validator(1, 5 * REDUCTION);
        store_validator(&mut store, &v);

        let v = store.add_validator_tokens(v, 3 * REDUCTION, REDUCTION).unwrap();
        assert_eq!(v.tokens, 8 * REDUCTION);
        assert_eq!(store.power_index(Order::Ascending).len(), 1);
        assert!(store.in_power_index(&v, REDUCTION));

        let v = store.remove_validator_tokens(v, 8 * REDUCTION, REDUCTION).unwrap();
        assert_eq!(v.tokens, 0);
        assert_eq!(store.power_index(Order::Ascending).len(), 1);
    }

    #[test]
    fn test_jailed_validator_not_indexed() {
        let mut store = MemStore::new();
        let mut v = create_test_validator(1, 5 * REDUCTION);
        v.jailed = true;
        store_validator(&mut store, &v);
        assert!(store.power_index(Order::Ascending).is_empty());
    }

    #[test]
    fn test_last_powers() {
        let mut store = MemStore::new();
        let a = Address::new([1; ADDRESS_LEN]);
        let b = Address::new([2; ADDRESS_LEN]);
        store.set_last_validator_power(&b, 7);
        store.set_last_validator_power(&a, 3);
        store.set_last_total_power(10);

        let powers = store.last_validator_powers().unwrap();
        assert_eq!(powers.keys().copied().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(store.last_validator_power(&b).unwrap(), Some(7));
        assert_eq!(store.last_total_power().unwrap(), 10);

        store.delete_last_validator_power(&b);
        assert_eq!(store.last_validator_power(&b).unwrap(), None);
    }

    #[test]
    fn test_remove_validator() {
        let mut store = MemStore::new();
        let v = create_test_validator(1, 0);
        store_validator(&mut store, &v);

        store.remove_validator(&v.operator_address, REDUCTION).unwrap();
        assert!(store.validator(&v.operator_address).unwrap().is_none());
        assert!(store.validator_by_cons_addr(&v.cons_address()).unwrap().is_none());
        assert!(store.power_index(Order::Ascending).is_empty());
    }

    #[test]
    #[should_panic]
    fn test_remove_bonded_validator_panics() {
        let mut store = MemStore::new();
        let mut v = create_test_validator(1, 0);
        v.status = BondStatus::Bonded;
        store_validator(&mut store, &v);
        let _ = store.remove_validator(&v.operator_address, REDUCTION);
    }

    #[test]
    #[should_panic]
    fn test_missing_indexed_validator_panics() {
        let store = MemStore::new();
        let _ = store.must_validator(&Address::new([9; ADDRESS_LEN]));
    }
}
