//! Versioned record encoding
//!
//! Every stored entity is written as a one-byte schema version followed by the
//! bincode encoding of its struct. Field order is the declaration order of the
//! struct, so changing a stored struct requires bumping its version.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::delegation::{Delegation, DvPair, UnbondingDelegation};
use crate::epoch::Epoch;
use crate::error::{Result, StakingError};
use crate::jail_queue::JailedQueueInfo;
use crate::params::Params;
use crate::types::{Address, Validator};

/// A record with a fixed, versioned schema
pub trait Record: Serialize + DeserializeOwned {
    /// Entity name used in error messages
    const ENTITY: &'static str;
    /// Schema version written in front of the payload
    const VERSION: u8;
}

impl Record for Validator {
    const ENTITY: &'static str = "Validator";
    const VERSION: u8 = 1;
}

impl Record for Epoch {
    const ENTITY: &'static str = "Epoch";
    const VERSION: u8 = 1;
}

impl Record for JailedQueueInfo {
    const ENTITY: &'static str = "JailedQueueInfo";
    const VERSION: u8 = 1;
}

impl Record for Params {
    const ENTITY: &'static str = "Params";
    const VERSION: u8 = 1;
}

impl Record for Delegation {
    const ENTITY: &'static str = "Delegation";
    const VERSION: u8 = 1;
}

impl Record for UnbondingDelegation {
    const ENTITY: &'static str = "UnbondingDelegation";
    const VERSION: u8 = 1;
}

/// Validator queue slot
impl Record for Vec<Address> {
    const ENTITY: &'static str = "ValidatorQueueSlot";
    const VERSION: u8 = 1;
}

/// Unbonding queue slot
impl Record for Vec<DvPair> {
    const ENTITY: &'static str = "UnbondingQueueSlot";
    const VERSION: u8 = 1;
}

/// Encode a record
pub fn encode<T: Record>(record: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(T::VERSION);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a record, rejecting unknown schema versions
pub fn decode<T: Record>(bytes: &[u8]) -> Result<T> {
    let (&version, payload) = bytes.split_first().ok_or_else(|| {
        StakingError::InvalidData(format!("empty {} record", T::ENTITY))
    })?;
    if version != T::VERSION {
        return Err(StakingError::SchemaVersion {
            entity: T::ENTITY,
            found: version,
            expected: T::VERSION,
        });
    }
    Ok(bincode::deserialize(payload)?)
}

/// Encode a plain amount (pools, total power) as 16 big-endian bytes
pub fn encode_u128(value: u128) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decode a plain amount
pub fn decode_u128(bytes: &[u8]) -> Result<u128> {
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| StakingError::InvalidData(format!("expected 16 bytes, got {}", bytes.len())))?;
    Ok(u128::from_be_bytes(arr))
}

/// Encode a u64 as 8 big-endian bytes
pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decode a big-endian u64
pub fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StakingError::InvalidData(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}
