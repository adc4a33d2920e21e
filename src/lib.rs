//! # SilverBitcoin Staking
//!
//! Proof-of-stake validator set management with a churn-limited key node
//! committee.
//!
//! This crate implements:
//! - Validator registry and power index
//! - End-block validator set updates for the consensus engine
//! - Key node committee selection with a per-change churn quota
//! - Epochs and key resharding migration signals
//! - Jail queue limiting concurrent key node removals
//! - Delegations, unbonding and genesis import/export

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod context;
pub mod delegation;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod events;
pub mod genesis;
pub mod governance;
pub mod jail_queue;
pub mod keeper;
pub mod keys;
pub mod msg_server;
pub mod params;
pub mod pool;
pub mod query;
pub mod registry;
pub mod slashing;
pub mod store;
pub mod types;

pub use context::{BlockHeader, BlockOutcome, Context};
pub use delegation::{Delegation, DelegationReader, DelegationStore, UnbondingDelegation};
pub use epoch::{Epoch, EpochReader, EpochStore};
pub use error::{Result, StakingError};
pub use events::{NoopHooks, StakingEvent, StakingHooks};
pub use genesis::{export_genesis, GenesisState};
pub use governance::UpdateKeyNodesProposal;
pub use jail_queue::{JailQueue, JailQueueReader, JailedQueueInfo};
pub use keeper::StakingKeeper;
pub use msg_server::{MsgCreateValidator, MsgEditValidator};
pub use params::Params;
pub use pool::{Pool, PoolLedger, PoolReader};
pub use query::Querier;
pub use registry::{Registry, RegistryReader};
pub use slashing::JailReason;
pub use store::{BlockStore, KvRead, KvStore, MemStore, Snapshot, StateDb};
pub use types::{Address, BondStatus, Coin, ConsAddress, ConsPubKey, Validator, ValidatorUpdate};
