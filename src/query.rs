//! Read-only queries
//!
//! Queries run against a committed snapshot, so they never observe the
//! writes of a block in progress.

use crate::context::read_params;
use crate::delegation::{Delegation, DelegationReader, UnbondingDelegation};
use crate::epoch::{Epoch, EpochReader};
use crate::error::Result;
use crate::jail_queue::{JailQueueReader, JailedQueueInfo};
use crate::params::Params;
use crate::pool::{Pool, PoolReader};
use crate::registry::RegistryReader;
use crate::store::{KvRead, Snapshot};
use crate::types::{Address, BondStatus, ConsAddress, Validator};

/// Query handler over a store view
pub struct Querier<S: KvRead = Snapshot> {
    store: S,
}

impl<S: KvRead> Querier<S> {
    /// Create a querier over `store`
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Get validator
    pub fn validator(&self, addr: &Address) -> Result<Option<Validator>> {
        self.store.validator(addr)
    }

    /// Get validator by consensus address
    pub fn validator_by_cons_addr(&self, cons: &ConsAddress) -> Result<Option<Validator>> {
        self.store.validator_by_cons_addr(cons)
    }

    /// Validators sorted by operator address, optionally filtered by status
    pub fn validators(&self, status: Option<BondStatus>) -> Result<Vec<Validator>> {
        let mut validators = self.store.validators()?;
        if let Some(status) = status {
            validators.retain(|v| v.status == status);
        }
        Ok(validators)
    }

    /// Bonded validators, highest power first
    pub fn bonded_validators_by_power(&self) -> Result<Vec<Validator>> {
        let params = self.params()?;
        self.store.bonded_validators_by_power(params.max_validators)
    }

    /// Total power of the last update pass
    pub fn last_total_power(&self) -> Result<u128> {
        self.store.last_total_power()
    }

    /// Epoch by index
    pub fn epoch(&self, index: u64) -> Result<Option<Epoch>> {
        self.store.epoch(index)
    }

    /// Epoch in effect at `height`
    pub fn epoch_by_height(&self, height: u64) -> Result<Epoch> {
        self.store.epoch_by_height(height)
    }

    /// Newest epoch, including one that takes effect at the next block
    pub fn latest_epoch(&self) -> Result<Epoch> {
        self.store.latest_epoch()
    }

    /// All epochs in index order
    pub fn epochs(&self) -> Result<Vec<Epoch>> {
        self.store.epochs()
    }

    /// Jail queue bookkeeping
    pub fn jailed_queue_info(&self) -> Result<JailedQueueInfo> {
        self.store.jailed_queue_info()
    }

    /// Queued validators in release order
    pub fn jailed_queue(&self) -> Result<Vec<Address>> {
        Ok(self
            .store
            .jailed_queue()?
            .into_iter()
            .map(|(_, addr)| addr)
            .collect())
    }

    /// Get delegation
    pub fn delegation(&self, delegator: &Address, validator: &Address) -> Result<Option<Delegation>> {
        self.store.delegation(delegator, validator)
    }

    /// Delegations made to `validator`
    pub fn validator_delegations(&self, validator: &Address) -> Result<Vec<Delegation>> {
        self.store.validator_delegations(validator)
    }

    /// Get unbonding delegation
    pub fn unbonding_delegation(
        &self,
        delegator: &Address,
        validator: &Address,
    ) -> Result<Option<UnbondingDelegation>> {
        self.store.unbonding_delegation(delegator, validator)
    }

    /// Pool balances
    pub fn pool(&self) -> Result<Pool> {
        self.store.pool()
    }

    /// Parameters
    pub fn params(&self) -> Result<Params> {
        read_params(&self.store)
    }
}
