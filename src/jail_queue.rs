//! Jail queue
//!
//! Jailed validators that were bonded or unbonding wait here before their
//! jailing is finalized. Key node entries are released at most
//! `ceil(|set| / 6)` per block height, so a burst of jailings cannot shrink
//! the custody committee faster than one epoch transition allows.
//!
//! Entries are operator addresses keyed by a monotonic queue index; the
//! validator record stays in the registry and carries its `jailed_index`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, error, info};

use crate::codec;
use crate::error::Result;
use crate::keys::{jailed_queue_key, JAILED_QUEUE_INFO_KEY, JAILED_QUEUE_PREFIX};
use crate::registry::{Registry, RegistryReader};
use crate::store::{KvRead, KvStore, Order};
use crate::types::{max_churn, Address, Validator};

/// Jail queue bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailedQueueInfo {
    /// Last assigned queue index; indexes start at 1
    pub index: u64,
    /// Queued validators that are members of the current key node set
    pub key_node_count: u64,
    /// Height of the last release pass
    pub release_height: u64,
    /// Key nodes released at `release_height`
    pub released_key_nodes: u64,
}

/// Read access to the jail queue
pub trait JailQueueReader: KvRead {
    /// Queue bookkeeping
    fn jailed_queue_info(&self) -> Result<JailedQueueInfo> {
        self.get(JAILED_QUEUE_INFO_KEY)
            .map(|bytes| codec::decode(&bytes))
            .transpose()
            .map(Option::unwrap_or_default)
    }

    /// Queue entries in insertion order
    fn jailed_queue(&self) -> Result<Vec<(u64, Address)>> {
        self.prefix_scan(JAILED_QUEUE_PREFIX, Order::Ascending)
            .into_iter()
            .map(|(key, value)| {
                let index = codec::decode_u64(&key[JAILED_QUEUE_PREFIX.len()..])?;
                Ok((index, Address::from_slice(&value)?))
            })
            .collect()
    }

    /// Whether the queued key nodes already fill the release quota of `key_nodes`
    ///
    /// Always false for an empty committee.
    fn jail_queue_reach_limit(&self, key_nodes: &BTreeSet<Address>) -> Result<bool> {
        if key_nodes.is_empty() {
            return Ok(false);
        }
        let info = self.jailed_queue_info()?;
        Ok(info.key_node_count >= max_churn(key_nodes.len()) as u64)
    }
}

impl<S: KvRead + ?Sized> JailQueueReader for S {}

/// Write access to the jail queue
pub trait JailQueue: KvStore + JailQueueReader + Registry {
    /// Store queue bookkeeping
    fn set_jailed_queue_info(&mut self, info: &JailedQueueInfo) -> Result<()> {
        self.set(JAILED_QUEUE_INFO_KEY.to_vec(), codec::encode(info)?);
        Ok(())
    }

    /// Append a validator to the queue and persist its new `jailed_index`
    fn insert_jailed(
        &mut self,
        validator: &mut Validator,
        key_nodes: &BTreeSet<Address>,
    ) -> Result<u64> {
        let mut info = self.jailed_queue_info()?;
        info.index += 1;
        if key_nodes.contains(&validator.operator_address) {
            info.key_node_count += 1;
        }
        self.set(
            jailed_queue_key(info.index),
            validator.operator_address.as_bytes().to_vec(),
        );
        validator.jailed_index = info.index;
        self.set_validator(validator)?;
        self.set_jailed_queue_info(&info)?;
        debug!(
            "Queued jailed validator {} at index {} (key nodes queued: {})",
            validator.operator_address, info.index, info.key_node_count
        );
        Ok(info.index)
    }

    /// Remove a validator from the queue and persist the cleared `jailed_index`
    ///
    /// Returns false if the validator is not queued.
    fn delete_jailed(
        &mut self,
        validator: &mut Validator,
        key_nodes: &BTreeSet<Address>,
    ) -> Result<bool> {
        if validator.jailed_index == 0 {
            return Ok(false);
        }
        let key = jailed_queue_key(validator.jailed_index);
        if !self.has(&key) {
            error!(
                "Validator {} claims jail queue index {} with no entry",
                validator.operator_address, validator.jailed_index
            );
            panic!(
                "jail queue entry {} missing for {}",
                validator.jailed_index, validator.operator_address
            );
        }
        self.delete(&key);

        let mut info = self.jailed_queue_info()?;
        if key_nodes.contains(&validator.operator_address) {
            info.key_node_count = info.key_node_count.saturating_sub(1);
        }
        self.set_jailed_queue_info(&info)?;

        validator.jailed_index = 0;
        self.set_validator(validator)?;
        Ok(true)
    }

    /// Finalize queued jailings
    ///
    /// Non key node entries are always finalized. Key node entries are
    /// finalized until `max` key nodes have been released at `height`; the
    /// count carries over between calls at the same height. Returns the
    /// finalized addresses in queue order.
    ///
    /// # Panics
    ///
    /// Panics if an entry references a validator missing from the registry.
    fn release_now(
        &mut self,
        height: u64,
        max: usize,
        key_nodes: &BTreeSet<Address>,
    ) -> Result<Vec<Address>> {
        let mut info = self.jailed_queue_info()?;
        if info.release_height != height {
            info.release_height = height;
            info.released_key_nodes = 0;
        }

        let mut released = Vec::new();
        for (index, addr) in self.jailed_queue()? {
            let mut validator = self.must_validator(&addr)?;
            if key_nodes.contains(&addr) {
                if info.released_key_nodes >= max as u64 {
                    continue;
                }
                info.released_key_nodes += 1;
                info.key_node_count = info.key_node_count.saturating_sub(1);
            }
            self.delete(&jailed_queue_key(index));
            validator.jailed_index = 0;
            self.set_validator(&validator)?;
            released.push(addr);
        }
        self.set_jailed_queue_info(&info)?;

        if !released.is_empty() {
            info!(
                "Released {} jailed validators at height {} ({} key nodes held)",
                released.len(),
                height,
                info.key_node_count
            );
        }
        Ok(released)
    }

    /// Recount queued key nodes against a new key node set
    fn recount_jailed_key_nodes(&mut self, key_nodes: &BTreeSet<Address>) -> Result<u64> {
        let mut info = self.jailed_queue_info()?;
        let count = self
            .jailed_queue()?
            .iter()
            .filter(|(_, addr)| key_nodes.contains(addr))
            .count() as u64;
        if count != info.key_node_count {
            debug!(
                "Jailed key node count {} -> {} for new key node set",
                info.key_node_count, count
            );
        }
        info.key_node_count = count;
        self.set_jailed_queue_info(&info)?;
        Ok(count)
    }
}

impl<S: KvStore + ?Sized> JailQueue for S {}
