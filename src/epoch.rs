//! Key node epochs
//!
//! An epoch is the block range during which one key node set is
//! authoritative. Epochs are append-only: a committee change closes the
//! current epoch and opens the next one at `height + 1`, and the resharding
//! subsystem flips `migration_finished` once the new committee holds its
//! shares.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::codec::{self, decode_u64, encode_u64};
use crate::error::{Result, StakingError};
use crate::keys::{epoch_by_height_key, epoch_key, prefix_end, EPOCH_BY_HEIGHT_PREFIX, EPOCH_PREFIX};
use crate::registry::RegistryReader;
use crate::store::{KvRead, KvStore, Order};
use crate::types::{Address, Validator};

/// Key node committee era
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    /// Epoch index, starting at 1
    pub index: u64,
    /// First block of the epoch
    pub start_block_num: u64,
    /// Last block of the epoch, 0 while active
    pub end_block_num: u64,
    /// Key node operator addresses in ascending order
    pub key_node_set: Vec<Address>,
    /// Whether resharding to this committee completed
    pub migration_finished: bool,
}

impl Epoch {
    /// Epoch reported before any epoch has been stored
    pub fn genesis() -> Self {
        Self {
            index: 1,
            start_block_num: 0,
            end_block_num: 0,
            key_node_set: Vec::new(),
            migration_finished: true,
        }
    }

    /// Whether the epoch is still open
    pub fn is_active(&self) -> bool {
        self.end_block_num == 0
    }

    /// Whether the epoch was created at `height` and takes effect later
    pub fn is_pending_at(&self, height: u64) -> bool {
        self.start_block_num > height
    }

    /// Whether `addr` is a member
    pub fn contains(&self, addr: &Address) -> bool {
        self.key_node_set.binary_search(addr).is_ok()
    }

    /// Members as a set
    pub fn key_nodes(&self) -> BTreeSet<Address> {
        self.key_node_set.iter().copied().collect()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch {} [{}..{}] ({} key nodes, migration {})",
            self.index,
            self.start_block_num,
            self.end_block_num,
            self.key_node_set.len(),
            if self.migration_finished { "finished" } else { "pending" }
        )
    }
}

/// Read access to epochs
pub trait EpochReader: KvRead {
    /// Epoch by index
    fn epoch(&self, index: u64) -> Result<Option<Epoch>> {
        self.get(&epoch_key(index))
            .map(|bytes| codec::decode(&bytes))
            .transpose()
    }

    /// Latest epoch whose start is at or below `height`
    fn epoch_by_height(&self, height: u64) -> Result<Epoch> {
        let end = match height.checked_add(1) {
            Some(next) => Some(epoch_by_height_key(next)),
            None => prefix_end(EPOCH_BY_HEIGHT_PREFIX),
        };
        let found = self
            .range(EPOCH_BY_HEIGHT_PREFIX, end.as_deref(), Order::Descending)
            .into_iter()
            .next();
        match found {
            Some((_, value)) => {
                let index = decode_u64(&value)?;
                self.epoch(index)?.ok_or_else(|| {
                    StakingError::InvalidData(format!(
                        "height index references missing epoch {}",
                        index
                    ))
                })
            }
            None => Ok(Epoch::genesis()),
        }
    }

    /// Epoch with the highest index, possibly pending
    fn latest_epoch(&self) -> Result<Epoch> {
        match self.prefix_scan(EPOCH_PREFIX, Order::Descending).into_iter().next() {
            Some((_, bytes)) => codec::decode(&bytes),
            None => Ok(Epoch::genesis()),
        }
    }

    /// Whether any epoch has been stored
    fn has_epochs(&self) -> bool {
        !self.prefix_scan(EPOCH_PREFIX, Order::Ascending).is_empty()
    }

    /// All stored epochs in index order
    fn epochs(&self) -> Result<Vec<Epoch>> {
        self.prefix_scan(EPOCH_PREFIX, Order::Ascending)
            .into_iter()
            .map(|(_, bytes)| codec::decode(&bytes))
            .collect()
    }
}

impl<S: KvRead + ?Sized> EpochReader for S {}

/// Write access to epochs
pub trait EpochStore: KvStore + EpochReader {
    /// Store an epoch under its index and start height
    fn set_epoch(&mut self, epoch: &Epoch) -> Result<()> {
        self.set(epoch_key(epoch.index), codec::encode(epoch)?);
        self.set(
            epoch_by_height_key(epoch.start_block_num),
            encode_u64(epoch.index),
        );
        Ok(())
    }

    /// Open a new epoch for `key_nodes`
    ///
    /// At height 0 the genesis epoch is written with its migration finished.
    /// Later, the current epoch is closed at `height` and the next epoch
    /// starts at `height + 1`. An epoch already opened at this height is
    /// replaced rather than followed by another.
    fn start_new_epoch(&mut self, height: u64, mut key_nodes: Vec<Address>) -> Result<Epoch> {
        key_nodes.sort();
        key_nodes.dedup();

        if height == 0 {
            let epoch = Epoch {
                key_node_set: key_nodes,
                ..Epoch::genesis()
            };
            self.set_epoch(&epoch)?;
            info!("Genesis key node epoch with {} members", epoch.key_node_set.len());
            return Ok(epoch);
        }

        let mut prior = self.latest_epoch()?;
        if prior.is_pending_at(height) {
            let epoch = Epoch {
                key_node_set: key_nodes,
                migration_finished: false,
                ..prior
            };
            self.set_epoch(&epoch)?;
            warn!(
                "Replaced pending epoch {} at height {} ({} members)",
                epoch.index,
                height,
                epoch.key_node_set.len()
            );
            return Ok(epoch);
        }

        prior.end_block_num = height;
        self.set_epoch(&prior)?;

        let epoch = Epoch {
            index: prior.index + 1,
            start_block_num: height + 1,
            end_block_num: 0,
            key_node_set: key_nodes,
            migration_finished: false,
        };
        self.set_epoch(&epoch)?;
        info!(
            "Closed epoch {} at height {}, epoch {} starts at {} with {} key nodes",
            prior.index,
            height,
            epoch.index,
            epoch.start_block_num,
            epoch.key_node_set.len()
        );
        Ok(epoch)
    }

    /// Mark resharding of the epoch current at `height` as finished
    fn set_migration_finished(&mut self, height: u64) -> Result<Epoch> {
        let mut epoch = self.epoch_by_height(height)?;
        if epoch.migration_finished {
            return Err(StakingError::MigrationAlreadyFinished(epoch.index));
        }
        epoch.migration_finished = true;
        self.set_epoch(&epoch)?;
        info!("Migration to epoch {} finished at height {}", epoch.index, height);
        Ok(epoch)
    }
}

impl<S: KvStore + ?Sized> EpochStore for S {}

/// Key node ranking: tokens descending, then operator address descending
pub fn key_node_rank(a: &Validator, b: &Validator) -> Ordering {
    b.tokens
        .cmp(&a.tokens)
        .then_with(|| b.operator_address.cmp(&a.operator_address))
}

/// Thresholds applied when choosing incumbents to retain
#[derive(Debug, Clone, Copy)]
pub struct RetainCriteria {
    /// Minimum tokens of a healthy key node
    pub min_delegation: u128,
    /// Current block height
    pub height: u64,
    /// Maximum blocks since the last heartbeat
    pub heartbeat_interval: u64,
    /// Tokens per unit of consensus power
    pub power_reduction: u128,
}

impl RetainCriteria {
    fn qualifies(&self, validator: &Validator) -> bool {
        validator.potential_consensus_power(self.power_reduction) > 0
            && validator.tokens >= self.min_delegation
            && validator.heartbeat_within(self.height, self.heartbeat_interval)
    }
}

/// Incumbent key nodes that stay in the committee
///
/// Ranks the non-jailed members of `current_set` with [`key_node_rank`] and
/// returns up to `retain_count` of them, healthy ones first. Unhealthy
/// incumbents, including those without consensus power, fill the remainder
/// so the committee does not shrink.
///
/// # Panics
///
/// Panics if a member has no registry record.
pub fn get_retain_key_nodes<S: RegistryReader + ?Sized>(
    store: &S,
    current_set: &[Address],
    retain_count: usize,
    criteria: &RetainCriteria,
) -> Result<Vec<Validator>> {
    let mut ranked = Vec::with_capacity(current_set.len());
    for addr in current_set {
        let validator = store.must_validator(addr)?;
        if !validator.jailed {
            ranked.push(validator);
        }
    }
    ranked.sort_by(key_node_rank);

    let (mut retained, unhealthy): (Vec<_>, Vec<_>) =
        ranked.into_iter().partition(|v| criteria.qualifies(v));
    if retained.len() >= retain_count {
        retained.truncate(retain_count);
    } else {
        let missing = retain_count - retained.len();
        debug!(
            "Retaining {} unhealthy key nodes to keep committee size",
            missing.min(unhealthy.len())
        );
        retained.extend(unhealthy.into_iter().take(missing));
    }
    Ok(retained)
}
