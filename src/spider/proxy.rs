use alloy::primitives::{Address, B256};

use super::contract_map::ContractHandle;
use crate::chain::{collect_addresses, ChainReader};
use crate::error::{Result, SpiderError};
use crate::relations::ProxyStrategy;

/// Interpret a storage word as an address. The high 12 bytes must be zero; a word with
/// anything there is packed state, not an implementation pointer.
pub fn decode_slot_address(address: Address, slot: B256, word: B256) -> Result<Address> {
    if word.as_slice()[..12].iter().any(|b| *b != 0) {
        return Err(SpiderError::InvalidSlotWord {
            address,
            slot: slot.to_string(),
            word: word.to_string(),
        });
    }
    Ok(Address::from_slice(&word.as_slice()[12..]))
}

pub async fn read_slot_address(
    reader: &dyn ChainReader,
    address: Address,
    slot: B256,
) -> Result<Address> {
    let word = reader.read_storage_slot(address, slot).await?;
    decode_slot_address(address, slot, word)
}

/// Resolve the implementation behind `contract`. `None` means a plain contract or a zero
/// implementation; either way the branch ends here.
pub async fn resolve_implementation(
    reader: &dyn ChainReader,
    strategy: Option<&ProxyStrategy>,
    contract: &ContractHandle,
) -> Result<Option<Address>> {
    let Some(strategy) = strategy else {
        return Ok(None);
    };
    let implementation = match strategy {
        ProxyStrategy::Call(function) => {
            let values = contract.call(reader, function, &[]).await?;
            collect_addresses(&values).into_iter().next().ok_or_else(|| {
                SpiderError::Decode(format!(
                    "{}.{}() on {:#x} did not return an address",
                    contract.name, function, contract.address
                ))
            })?
        }
        ProxyStrategy::Slot(slot) => read_slot_address(reader, contract.address, *slot).await?,
        ProxyStrategy::Const(address) => *address,
    };

    if implementation.is_zero() {
        tracing::debug!(
            "[SPIDER] {} ({:#x}) has no implementation via {}",
            contract.name,
            contract.address,
            strategy
        );
        return Ok(None);
    }
    Ok(Some(implementation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_slot_word_low_twenty_bytes_are_the_address() {
        let implementation = Address::from([0xab; 20]);
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(implementation.as_slice());
        let decoded =
            decode_slot_address(Address::ZERO, B256::ZERO, B256::from(word)).expect("decode");
        assert_eq!(decoded, implementation);
    }

    #[test]
    fn test_dirty_high_bytes_are_rejected() {
        let mut word = [0u8; 32];
        word[0] = 1;
        word[31] = 0x42;
        let err = decode_slot_address(Address::ZERO, B256::ZERO, B256::from(word))
            .err()
            .expect("dirty word");
        assert!(matches!(err, SpiderError::InvalidSlotWord { .. }));
    }

    proptest! {
        #[test]
        fn prop_slot_decoding_ignores_leading_zero_padding(raw in proptest::array::uniform20(any::<u8>())) {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(&raw);
            let decoded = decode_slot_address(Address::ZERO, B256::ZERO, B256::from(word));
            prop_assert_eq!(decoded.ok(), Some(Address::from(raw)));
        }

        #[test]
        fn prop_any_nonzero_high_byte_is_rejected(
            raw in proptest::array::uniform20(any::<u8>()),
            idx in 0usize..12,
            dirt in 1u8..=255,
        ) {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(&raw);
            word[idx] = dirt;
            prop_assert!(decode_slot_address(Address::ZERO, B256::ZERO, B256::from(word)).is_err());
        }
    }
}
