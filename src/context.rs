//! Block execution context
//!
//! Bundles the block header, the block's write buffer, the parameter snapshot
//! and the event sink. Every staking operation receives one explicitly.

use tracing::warn;

use crate::codec;
use crate::error::Result;
use crate::events::StakingEvent;
use crate::keys::PARAMS_KEY;
use crate::params::Params;
use crate::store::{BlockStore, KvRead, KvStore, StateDb};

/// Parameters stored in state, or the defaults if none were stored yet
pub fn read_params<S: KvRead + ?Sized>(store: &S) -> Result<Params> {
    match store.get(PARAMS_KEY) {
        Some(bytes) => codec::decode(&bytes),
        None => {
            warn!("No staking params in state, using defaults");
            Ok(Params::default())
        }
    }
}

/// Deterministic block header fields used by staking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Block height
    pub height: u64,
    /// Block time in seconds, from the header (never the local clock)
    pub time: u64,
}

impl BlockHeader {
    /// Create a header
    pub fn new(height: u64, time: u64) -> Self {
        Self { height, time }
    }
}

/// Result of committing a block context
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    /// State version after commit
    pub version: u64,
    /// Events emitted during the block
    pub events: Vec<StakingEvent>,
}

/// Execution context of one block
pub struct Context {
    header: BlockHeader,
    store: BlockStore,
    params: Params,
    events: Vec<StakingEvent>,
}

impl Context {
    /// Open a block on `db`, reading the parameter snapshot from state
    pub fn begin(db: &StateDb, header: BlockHeader) -> Result<Self> {
        let store = db.begin();
        let params = read_params(&store)?;
        Ok(Self::with_params(header, store, params))
    }

    /// Build a context with an explicit parameter snapshot
    pub fn with_params(header: BlockHeader, store: BlockStore, params: Params) -> Self {
        Self {
            header,
            store,
            params,
            events: Vec::new(),
        }
    }

    /// Commit the block's writes and return its events
    pub fn commit(self, db: &StateDb) -> Result<BlockOutcome> {
        let height = self.header.height;
        let version = db.commit(self.store, height)?;
        Ok(BlockOutcome {
            version,
            events: self.events,
        })
    }

    /// Block height
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Block time
    pub fn block_time(&self) -> u64 {
        self.header.time
    }

    /// Block header
    pub fn header(&self) -> BlockHeader {
        self.header
    }

    /// Parameter snapshot
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Replace the parameter snapshot and persist it (genesis and governance)
    pub fn set_params(&mut self, params: Params) -> Result<()> {
        params.validate()?;
        self.store.set(PARAMS_KEY.to_vec(), codec::encode(&params)?);
        self.params = params;
        Ok(())
    }

    /// Block store
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Mutable block store
    pub fn store_mut(&mut self) -> &mut BlockStore {
        &mut self.store
    }

    /// Record an event
    pub fn emit(&mut self, event: StakingEvent) {
        self.events.push(event);
    }

    /// Events recorded so far
    pub fn events(&self) -> &[StakingEvent] {
        &self.events
    }
}
