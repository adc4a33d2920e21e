//! Store key layout
//!
//! All multi-part keys are fixed-width big-endian, so lexicographic key order
//! equals numeric order and range scans are deterministic.

use crate::types::{Address, ConsAddress, ADDRESS_LEN};

/// Validator records by operator address
pub const VALIDATOR_PREFIX: &[u8] = b"Validator/";
/// Operator address by consensus address
pub const VALIDATOR_BY_CONS_PREFIX: &[u8] = b"ValidatorByConsAddr/";
/// Power index: power (u64 BE) followed by operator address
pub const POWER_INDEX_PREFIX: &[u8] = b"ValidatorsByPowerIndex/";
/// Power assigned in the previous update pass
pub const LAST_VALIDATOR_POWER_PREFIX: &[u8] = b"LastValidatorPower/";
/// Total power assigned in the previous update pass
pub const LAST_TOTAL_POWER_KEY: &[u8] = b"LastTotalPower";
/// Jail queue entries by queue index
pub const JAILED_QUEUE_PREFIX: &[u8] = b"JailedQueue/";
/// Jail queue bookkeeping singleton
pub const JAILED_QUEUE_INFO_KEY: &[u8] = b"JailedQueueInfo";
/// Epoch records by index
pub const EPOCH_PREFIX: &[u8] = b"Epoch/";
/// Epoch index by start height
pub const EPOCH_BY_HEIGHT_PREFIX: &[u8] = b"EpochByHeight/";
/// Unbonding validators by completion time and height
pub const VALIDATOR_QUEUE_PREFIX: &[u8] = b"ValidatorQueue/";
/// Delegations by delegator and validator
pub const DELEGATION_PREFIX: &[u8] = b"Delegation/";
/// Unbonding delegations by delegator and validator
pub const UNBONDING_DELEGATION_PREFIX: &[u8] = b"UnbondingDelegation/";
/// Unbonding delegation pairs by completion time
pub const UNBONDING_QUEUE_PREFIX: &[u8] = b"UnbondingQueue/";
/// Bonded pool balance
pub const BONDED_POOL_KEY: &[u8] = b"Pool/Bonded";
/// Not-bonded pool balance
pub const NOT_BONDED_POOL_KEY: &[u8] = b"Pool/NotBonded";
/// Parameter snapshot
pub const PARAMS_KEY: &[u8] = b"Params";

fn join(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = prefix.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    key.extend_from_slice(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

/// `Validator/<operator>`
pub fn validator_key(addr: &Address) -> Vec<u8> {
    join(VALIDATOR_PREFIX, &[addr.as_bytes()])
}

/// `ValidatorByConsAddr/<cons>`
pub fn validator_by_cons_key(addr: &ConsAddress) -> Vec<u8> {
    join(VALIDATOR_BY_CONS_PREFIX, &[addr.as_bytes()])
}

/// `ValidatorsByPowerIndex/<power><operator>`
pub fn power_index_key(power: u64, addr: &Address) -> Vec<u8> {
    join(POWER_INDEX_PREFIX, &[&power.to_be_bytes(), addr.as_bytes()])
}

/// Operator address embedded in a power index key
pub fn address_from_power_index_key(key: &[u8]) -> Option<Address> {
    let start = POWER_INDEX_PREFIX.len() + 8;
    if key.len() != start + ADDRESS_LEN {
        return None;
    }
    Address::from_slice(&key[start..]).ok()
}

/// `LastValidatorPower/<operator>`
pub fn last_validator_power_key(addr: &Address) -> Vec<u8> {
    join(LAST_VALIDATOR_POWER_PREFIX, &[addr.as_bytes()])
}

/// Operator address embedded in a last-power key
pub fn address_from_last_power_key(key: &[u8]) -> Option<Address> {
    Address::from_slice(key.get(LAST_VALIDATOR_POWER_PREFIX.len()..)?).ok()
}

/// `JailedQueue/<index>`
pub fn jailed_queue_key(index: u64) -> Vec<u8> {
    join(JAILED_QUEUE_PREFIX, &[&index.to_be_bytes()])
}

/// `Epoch/<index>`
pub fn epoch_key(index: u64) -> Vec<u8> {
    join(EPOCH_PREFIX, &[&index.to_be_bytes()])
}

/// `EpochByHeight/<height>`
pub fn epoch_by_height_key(height: u64) -> Vec<u8> {
    join(EPOCH_BY_HEIGHT_PREFIX, &[&height.to_be_bytes()])
}

/// `ValidatorQueue/<time><height>`
pub fn validator_queue_key(time: u64, height: u64) -> Vec<u8> {
    join(
        VALIDATOR_QUEUE_PREFIX,
        &[&time.to_be_bytes(), &height.to_be_bytes()],
    )
}

/// Completion time and height embedded in a validator queue key
pub fn parse_validator_queue_key(key: &[u8]) -> Option<(u64, u64)> {
    let rest = key.get(VALIDATOR_QUEUE_PREFIX.len()..)?;
    if rest.len() != 16 {
        return None;
    }
    let time = u64::from_be_bytes(rest[..8].try_into().ok()?);
    let height = u64::from_be_bytes(rest[8..].try_into().ok()?);
    Some((time, height))
}

/// `Delegation/<delegator><validator>`
pub fn delegation_key(delegator: &Address, validator: &Address) -> Vec<u8> {
    join(DELEGATION_PREFIX, &[delegator.as_bytes(), validator.as_bytes()])
}

/// `UnbondingDelegation/<delegator><validator>`
pub fn unbonding_delegation_key(delegator: &Address, validator: &Address) -> Vec<u8> {
    join(
        UNBONDING_DELEGATION_PREFIX,
        &[delegator.as_bytes(), validator.as_bytes()],
    )
}

/// `UnbondingQueue/<time>`
pub fn unbonding_queue_key(time: u64) -> Vec<u8> {
    join(UNBONDING_QUEUE_PREFIX, &[&time.to_be_bytes()])
}

/// Smallest key strictly greater than every key starting with `prefix`
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_index_ordering() {
        let low = Address::new([0xff; ADDRESS_LEN]);
        let high = Address::new([0x00; ADDRESS_LEN]);
        assert!(power_index_key(1, &low) < power_index_key(2, &high));
        assert!(power_index_key(2, &high) < power_index_key(2, &low));
        assert_eq!(address_from_power_index_key(&power_index_key(7, &low)), Some(low));
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_end(&[1, 0xff]), Some(vec![2]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_validator_queue_key() {
        let key = validator_queue_key(1_000, 42);
        assert_eq!(parse_validator_queue_key(&key), Some((1_000, 42)));
        assert!(validator_queue_key(999, 100) < key);
    }
}
