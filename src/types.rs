//! Core staking types
//!
//! Addresses, consensus keys, validator records and the update instructions
//! handed to the consensus engine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StakingError};

/// Length of operator and consensus addresses in bytes
pub const ADDRESS_LEN: usize = 20;

/// Basis points representing 100%
pub const BPS_DENOMINATOR: u32 = 10_000;

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; ADDRESS_LEN]);

        impl $name {
            /// Create from raw bytes
            pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
                Self(bytes)
            }

            /// Raw address bytes
            pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
                &self.0
            }

            /// Parse from a byte slice of exactly `ADDRESS_LEN` bytes
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                let arr: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| {
                    StakingError::InvalidData(format!(
                        "address must be {} bytes, got {}",
                        ADDRESS_LEN,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = StakingError;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| StakingError::InvalidData(format!("bad hex address {}: {}", s, e)))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&hex::encode(self.0))
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    s.parse().map_err(serde::de::Error::custom)
                } else {
                    <[u8; ADDRESS_LEN]>::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

address_type!(
    /// Operator address, the stable identity of a validator
    Address
);

address_type!(
    /// Consensus address derived from a consensus public key
    ConsAddress
);

/// Consensus public key (ed25519, 32 bytes)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsPubKey(pub Vec<u8>);

impl ConsPubKey {
    /// Expected key length
    pub const LEN: usize = 32;

    /// Create a key, checking its length
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(StakingError::InvalidData(format!(
                "consensus key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Consensus address: first 20 bytes of the blake3 digest of the key
    pub fn address(&self) -> ConsAddress {
        let digest = blake3::hash(&self.0);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest.as_bytes()[..ADDRESS_LEN]);
        ConsAddress(out)
    }
}

impl fmt::Debug for ConsPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConsPubKey({})", hex::encode(&self.0))
    }
}

impl Serialize for ConsPubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(&self.0))
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ConsPubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(&s).map_err(serde::de::Error::custom)?
        } else {
            Vec::<u8>::deserialize(deserializer)?
        };
        ConsPubKey::new(bytes).map_err(serde::de::Error::custom)
    }
}

/// Token amount with denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Denomination
    pub denom: String,
    /// Amount
    pub amount: u128,
}

impl Coin {
    /// Create a coin
    pub fn new(denom: impl Into<String>, amount: u128) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

/// Bonding status of a validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BondStatus {
    /// Not participating, tokens free to withdraw after delegation unbonding
    Unbonded,
    /// Leaving the active set, tokens locked until the unbonding time elapses
    Unbonding,
    /// In the active set
    Bonded,
}

impl fmt::Display for BondStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BondStatus::Unbonded => write!(f, "Unbonded"),
            BondStatus::Unbonding => write!(f, "Unbonding"),
            BondStatus::Bonded => write!(f, "Bonded"),
        }
    }
}

/// Validator description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    /// Display name
    pub moniker: String,
    /// Optional identity signature
    pub identity: String,
    /// Website
    pub website: String,
    /// Security contact
    pub security_contact: String,
    /// Free-form details
    pub details: String,
}

impl Description {
    /// Maximum moniker length
    pub const MAX_MONIKER_LEN: usize = 70;
    /// Maximum details length
    pub const MAX_DETAILS_LEN: usize = 280;

    /// Check field lengths
    pub fn validate(&self) -> Result<()> {
        if self.moniker.is_empty() {
            return Err(StakingError::InvalidData("empty moniker".to_string()));
        }
        if self.moniker.len() > Self::MAX_MONIKER_LEN {
            return Err(StakingError::InvalidData(format!(
                "moniker longer than {} bytes",
                Self::MAX_MONIKER_LEN
            )));
        }
        if self.details.len() > Self::MAX_DETAILS_LEN {
            return Err(StakingError::InvalidData(format!(
                "details longer than {} bytes",
                Self::MAX_DETAILS_LEN
            )));
        }
        Ok(())
    }
}

/// Commission settings in basis points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    /// Current rate
    pub rate_bps: u32,
    /// Upper bound for the rate, fixed at creation
    pub max_rate_bps: u32,
    /// Maximum change of the rate per edit, fixed at creation
    pub max_change_rate_bps: u32,
    /// Block time of the last rate change
    pub update_time: u64,
}

impl Commission {
    /// Minimum block time between two rate changes (24 hours)
    pub const UPDATE_INTERVAL_SECS: u64 = 86_400;

    /// Check the static bounds
    pub fn validate(&self) -> Result<()> {
        if self.max_rate_bps > BPS_DENOMINATOR {
            return Err(StakingError::InvalidCommission(
                "max rate cannot exceed 100%".to_string(),
            ));
        }
        if self.rate_bps > self.max_rate_bps {
            return Err(StakingError::InvalidCommission(format!(
                "rate {} exceeds max rate {}",
                self.rate_bps, self.max_rate_bps
            )));
        }
        if self.max_change_rate_bps > self.max_rate_bps {
            return Err(StakingError::InvalidCommission(format!(
                "max change rate {} exceeds max rate {}",
                self.max_change_rate_bps, self.max_rate_bps
            )));
        }
        Ok(())
    }

    /// Check a rate change requested at `block_time`
    pub fn validate_new_rate(&self, new_rate_bps: u32, block_time: u64) -> Result<()> {
        if block_time.saturating_sub(self.update_time) < Self::UPDATE_INTERVAL_SECS {
            return Err(StakingError::InvalidCommission(
                "commission can be changed at most once per 24h".to_string(),
            ));
        }
        if new_rate_bps > self.max_rate_bps {
            return Err(StakingError::InvalidCommission(format!(
                "rate {} exceeds max rate {}",
                new_rate_bps, self.max_rate_bps
            )));
        }
        if new_rate_bps.abs_diff(self.rate_bps) > self.max_change_rate_bps {
            return Err(StakingError::InvalidCommission(format!(
                "rate change {} -> {} exceeds max change rate {}",
                self.rate_bps, new_rate_bps, self.max_change_rate_bps
            )));
        }
        Ok(())
    }
}

/// Validator record owned by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Operator address
    pub operator_address: Address,
    /// Consensus public key
    pub consensus_pubkey: ConsPubKey,
    /// Bonding status
    pub status: BondStatus,
    /// Jailed flag, orthogonal to status
    pub jailed: bool,
    /// Position in the jail queue, 0 when not queued
    pub jailed_index: u64,
    /// Bonded tokens
    pub tokens: u128,
    /// Minimum self delegation declared by the operator
    pub min_self_delegation: u128,
    /// Commission settings
    pub commission: Commission,
    /// Description
    pub description: Description,
    /// Advisory flag mirroring membership of the latest key node set
    pub is_key_node: bool,
    /// Height of the last accepted key node heartbeat
    pub last_key_node_heartbeat_height: u64,
    /// Height at which unbonding started
    pub unbonding_height: u64,
    /// Block time at which unbonding completes
    pub unbonding_time: u64,
}

impl Validator {
    /// Create a new unbonded validator with no tokens
    pub fn new(
        operator_address: Address,
        consensus_pubkey: ConsPubKey,
        description: Description,
        commission: Commission,
        min_self_delegation: u128,
    ) -> Self {
        Self {
            operator_address,
            consensus_pubkey,
            status: BondStatus::Unbonded,
            jailed: false,
            jailed_index: 0,
            tokens: 0,
            min_self_delegation,
            commission,
            description,
            is_key_node: false,
            last_key_node_heartbeat_height: 0,
            unbonding_height: 0,
            unbonding_time: 0,
        }
    }

    /// Consensus address
    pub fn cons_address(&self) -> ConsAddress {
        self.consensus_pubkey.address()
    }

    /// Is bonded
    pub fn is_bonded(&self) -> bool {
        self.status == BondStatus::Bonded
    }

    /// Is unbonding
    pub fn is_unbonding(&self) -> bool {
        self.status == BondStatus::Unbonding
    }

    /// Is unbonded
    pub fn is_unbonded(&self) -> bool {
        self.status == BondStatus::Unbonded
    }

    /// Power the validator would have if bonded
    pub fn potential_consensus_power(&self, power_reduction: u128) -> u64 {
        token_to_power(self.tokens, power_reduction)
    }

    /// Power in the consensus engine; zero unless bonded
    pub fn consensus_power(&self, power_reduction: u128) -> u64 {
        if self.is_bonded() {
            self.potential_consensus_power(power_reduction)
        } else {
            0
        }
    }

    /// Whether the last heartbeat is within `interval` blocks of `height`
    pub fn heartbeat_within(&self, height: u64, interval: u64) -> bool {
        height.saturating_sub(self.last_key_node_heartbeat_height) <= interval
    }

    /// Update for the consensus engine with the given power
    pub fn update(&self, power: u64) -> ValidatorUpdate {
        ValidatorUpdate {
            pub_key: self.consensus_pubkey.clone(),
            power,
        }
    }

    /// Update removing the validator from the consensus engine
    pub fn update_zero(&self) -> ValidatorUpdate {
        self.update(0)
    }
}

/// Convert tokens into consensus power
pub fn token_to_power(tokens: u128, power_reduction: u128) -> u64 {
    if power_reduction == 0 {
        return 0;
    }
    u64::try_from(tokens / power_reduction).unwrap_or(u64::MAX)
}

/// Validator update for the consensus engine; power 0 removes the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    /// Consensus public key
    pub pub_key: ConsPubKey,
    /// New voting power
    pub power: u64,
}

/// Key node churn quota for a committee of `size` members: `ceil(size / 6)`
pub fn max_churn(size: usize) -> usize {
    size.div_ceil(6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex_roundtrip() {
        let addr = Address::new([0xab; ADDRESS_LEN]);
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);

        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(ADDRESS_LEN)));
    }

    #[test]
    fn test_address_bad_length() {
        assert!("abcd".parse::<Address>().is_err());
        assert!(Address::from_slice(&[1u8; 19]).is_err());
    }

    #[test]
    fn test_consensus_power() {
        let pk = ConsPubKey::new(vec![7u8; 32]).unwrap();
        let mut v = Validator::new(
            Address::new([1; ADDRESS_LEN]),
            pk,
            Description::default(),
            Commission::default(),
            1,
        );
        v.tokens = 5_500_000;
        assert_eq!(v.potential_consensus_power(1_000_000), 5);
        assert_eq!(v.consensus_power(1_000_000), 0);

        v.status = BondStatus::Bonded;
        assert_eq!(v.consensus_power(1_000_000), 5);
    }

    #[test]
    fn test_max_churn() {
        assert_eq!(max_churn(0), 0);
        assert_eq!(max_churn(1), 1);
        assert_eq!(max_churn(6), 1);
        assert_eq!(max_churn(7), 2);
        assert_eq!(max_churn(13), 3);
    }

    #[test]
    fn test_commission_validation() {
        let c = Commission {
            rate_bps: 500,
            max_rate_bps: 2_000,
            max_change_rate_bps: 100,
            update_time: 0,
        };
        assert!(c.validate().is_ok());
        assert!(c.validate_new_rate(600, Commission::UPDATE_INTERVAL_SECS).is_ok());
        assert!(c.validate_new_rate(700, Commission::UPDATE_INTERVAL_SECS).is_err());
        assert!(c.validate_new_rate(600, 10).is_err());

        let bad = Commission {
            rate_bps: 3_000,
            ..c
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_heartbeat_window() {
        let pk = ConsPubKey::new(vec![7u8; 32]).unwrap();
        let mut v = Validator::new(
            Address::new([1; ADDRESS_LEN]),
            pk,
            Description::default(),
            Commission::default(),
            1,
        );
        v.last_key_node_heartbeat_height = 90;
        assert!(v.heartbeat_within(100, 10));
        assert!(!v.heartbeat_within(101, 10));
    }
}
