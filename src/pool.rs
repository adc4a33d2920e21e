//! Bonded and not-bonded token pools
//!
//! Tokens of bonded validators sit in the bonded pool, everything else staked
//! (unbonding and unbonded validators, maturing unbonding delegations) in the
//! not-bonded pool. Deposits and withdrawals to accounts happen outside this
//! crate; the pools only track balances.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::codec::{decode_u128, encode_u128};
use crate::error::Result;
use crate::keys::{BONDED_POOL_KEY, NOT_BONDED_POOL_KEY};
use crate::store::{KvRead, KvStore};

/// Pool balances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Tokens of bonded validators
    pub bonded_tokens: u128,
    /// Tokens of unbonding and unbonded validators and unbonding delegations
    pub not_bonded_tokens: u128,
}

fn read_balance<S: KvRead + ?Sized>(store: &S, key: &[u8]) -> Result<u128> {
    store
        .get(key)
        .map(|bytes| decode_u128(&bytes))
        .transpose()
        .map(|amount| amount.unwrap_or(0))
}

/// Read access to pool balances
pub trait PoolReader: KvRead {
    /// Both balances
    fn pool(&self) -> Result<Pool> {
        Ok(Pool {
            bonded_tokens: read_balance(self, BONDED_POOL_KEY)?,
            not_bonded_tokens: read_balance(self, NOT_BONDED_POOL_KEY)?,
        })
    }
}

impl<S: KvRead + ?Sized> PoolReader for S {}

/// Write access to pool balances
pub trait PoolLedger: KvStore + PoolReader {
    /// Overwrite both balances
    fn set_pool(&mut self, pool: &Pool) {
        self.set(BONDED_POOL_KEY.to_vec(), encode_u128(pool.bonded_tokens));
        self.set(
            NOT_BONDED_POOL_KEY.to_vec(),
            encode_u128(pool.not_bonded_tokens),
        );
    }

    /// Credit tokens entering staking
    fn deposit(&mut self, bonded: bool, amount: u128) -> Result<()> {
        let mut pool = self.pool()?;
        if bonded {
            pool.bonded_tokens += amount;
        } else {
            pool.not_bonded_tokens += amount;
        }
        self.set_pool(&pool);
        Ok(())
    }

    /// Debit tokens leaving staking
    ///
    /// # Panics
    ///
    /// Panics if the pool balance is smaller than `amount`.
    fn withdraw(&mut self, bonded: bool, amount: u128) -> Result<()> {
        let mut pool = self.pool()?;
        let balance = if bonded {
            &mut pool.bonded_tokens
        } else {
            &mut pool.not_bonded_tokens
        };
        if *balance < amount {
            error!(
                "Pool (bonded: {}) holds {}, cannot withdraw {}",
                bonded, balance, amount
            );
            panic!("pool balance underflow");
        }
        *balance -= amount;
        self.set_pool(&pool);
        Ok(())
    }

    /// Move tokens from the bonded to the not-bonded pool
    fn bonded_to_not_bonded(&mut self, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        self.withdraw(true, amount)?;
        self.deposit(false, amount)?;
        debug!("Moved {} tokens from bonded to not-bonded pool", amount);
        Ok(())
    }

    /// Move tokens from the not-bonded to the bonded pool
    fn not_bonded_to_bonded(&mut self, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        self.withdraw(false, amount)?;
        self.deposit(true, amount)?;
        debug!("Moved {} tokens from not-bonded to bonded pool", amount);
        Ok(())
    }
}

impl<S: KvStore + ?Sized> PoolLedger for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn test_empty_pool() {
        let store = MemStore::new();
        assert_eq!(store.pool().unwrap(), Pool::default());
    }

    #[test]
    fn test_transfers() {
        let mut store = MemStore::new();
        store.deposit(false, 100).unwrap();
        store.not_bonded_to_bonded(60).unwrap();
        store.bonded_to_not_bonded(10).unwrap();

        let pool = store.pool().unwrap();
        assert_eq!(pool.bonded_tokens, 50);
        assert_eq!(pool.not_bonded_tokens, 50);

        store.withdraw(false, 50).unwrap();
        assert_eq!(store.pool().unwrap().not_bonded_tokens, 0);
    }

    #[test]
    #[should_panic]
    fn test_underflow_panics() {
        let mut store = MemStore::new();
        store.deposit(true, 5).unwrap();
        let _ = store.bonded_to_not_bonded(6);
    }
}
