//! Error types for staking operations
//!
//! Validation failures are returned to the caller and leave state untouched.
//! Broken invariants (wrong-status transitions, dangling index entries) are not
//! represented here: they panic, because continuing would desynchronize
//! consensus-critical state across replicas.

use crate::types::{Address, ConsAddress};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, StakingError>;

/// Staking error types
#[derive(Debug, thiserror::Error)]
pub enum StakingError {
    /// Coin denomination does not match the bond denom
    #[error("invalid coin denomination: got {got}, expected {expected}")]
    BadDenom {
        /// Denomination supplied
        got: String,
        /// Configured bond denomination
        expected: String,
    },

    /// Self delegation is below the declared minimum
    #[error("self delegation {amount} is below minimum self delegation {min}")]
    SelfDelegationBelowMinimum {
        /// Amount delegated
        amount: u128,
        /// Required minimum
        min: u128,
    },

    /// Validator with this operator address already exists
    #[error("validator {0} already exists")]
    ValidatorExists(Address),

    /// Consensus public key is already used by another validator
    #[error("consensus key {0} already in use")]
    PubKeyExists(ConsAddress),

    /// Validator not found
    #[error("validator {0} not found")]
    ValidatorNotFound(Address),

    /// Validator not found by consensus address
    #[error("no validator for consensus address {0}")]
    ConsAddressNotFound(ConsAddress),

    /// Heartbeat height is not strictly below the current block height
    #[error("heartbeat height {height} must be below current height {current}")]
    InvalidHeartbeatHeight {
        /// Height reported by the key node
        height: u64,
        /// Current block height
        current: u64,
    },

    /// Heartbeat height does not advance the recorded one
    #[error("stale heartbeat height {height}, last recorded {last}")]
    StaleHeartbeat {
        /// Height reported by the key node
        height: u64,
        /// Height already recorded
        last: u64,
    },

    /// Committee change requested while the previous migration is running
    #[error("key node migration of epoch {0} has not finished")]
    MigrationInProgress(u64),

    /// Current epoch migration already flagged as finished
    #[error("key node migration of epoch {0} already finished")]
    MigrationAlreadyFinished(u64),

    /// Too many key nodes removed in one proposal
    #[error("removing {requested} key nodes exceeds churn quota {quota}")]
    ChurnQuotaExceeded {
        /// Removals requested
        requested: usize,
        /// Maximum allowed removals
        quota: usize,
    },

    /// Address is not a member of the current key node set
    #[error("{0} is not a key node")]
    NotKeyNode(Address),

    /// Address is already a member of the current key node set
    #[error("{0} is already a key node")]
    AlreadyKeyNode(Address),

    /// Validator does not satisfy the key node eligibility test
    #[error("{address} is not eligible as key node: {reason}")]
    IneligibleKeyNode {
        /// Candidate address
        address: Address,
        /// Why the candidate was rejected
        reason: String,
    },

    /// Resulting key node set would exceed the maximum size
    #[error("key node set of {size} exceeds maximum {max}")]
    TooManyKeyNodes {
        /// Resulting size
        size: usize,
        /// Maximum size
        max: u32,
    },

    /// Address listed more than once in a request
    #[error("duplicate address {0} in request")]
    DuplicateAddress(Address),

    /// Proposal contains no changes
    #[error("empty key node update")]
    EmptyKeyNodeUpdate,

    /// Validator is jailed
    #[error("validator {0} is jailed")]
    ValidatorJailed(Address),

    /// Validator is not jailed
    #[error("validator {0} is not jailed")]
    ValidatorNotJailed(Address),

    /// Delegation not found
    #[error("no delegation from {delegator} to {validator}")]
    DelegationNotFound {
        /// Delegator address
        delegator: Address,
        /// Validator address
        validator: Address,
    },

    /// Not enough delegated tokens to undelegate
    #[error("insufficient delegation: requested {requested}, available {available}")]
    InsufficientDelegation {
        /// Amount requested
        requested: u128,
        /// Amount available
        available: u128,
    },

    /// Too many unbonding entries for one delegator/validator pair
    #[error("too many unbonding delegation entries (max {0})")]
    MaxEntries(u32),

    /// Commission parameters are inconsistent
    #[error("invalid commission: {0}")]
    InvalidCommission(String),

    /// Generic invalid input
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Parameter set failed validation
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Stored record could not be decoded or encoded
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Stored record carries an unknown schema version
    #[error("unsupported schema version {found} for {entity} (expected {expected})")]
    SchemaVersion {
        /// Entity being decoded
        entity: &'static str,
        /// Version found in the record
        found: u8,
        /// Version this build understands
        expected: u8,
    },

    /// JSON config or genesis could not be parsed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config or genesis file could not be read
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Block commit raced another commit
    #[error("block at height {height} built on version {base}, store is at {current}")]
    StaleCommit {
        /// Height of the rejected block
        height: u64,
        /// Version the block was built on
        base: u64,
        /// Version currently committed
        current: u64,
    },
}
