use alloy::primitives::{Address, B256};
use std::str::FromStr;

use crate::error::{Result, SpiderError};

/// Clean a hex string by removing "0x" prefix and whitespace
pub fn clean_hex(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

pub fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw.trim())
        .map_err(|err| SpiderError::InvalidConfig(format!("invalid address `{raw}`: {err}")))
}

/// Parse a storage slot. Short values are left-padded to 32 bytes.
pub fn parse_slot(raw: &str) -> Result<B256> {
    let digits = clean_hex(raw);
    if digits.is_empty() || digits.len() > 64 {
        return Err(SpiderError::InvalidConfig(format!(
            "storage slot `{raw}` must be 1..=32 bytes of hex"
        )));
    }
    let padded = format!("{digits:0>64}");
    let bytes = hex::decode(&padded)
        .map_err(|err| SpiderError::InvalidConfig(format!("invalid storage slot `{raw}`: {err}")))?;
    Ok(B256::from_slice(&bytes))
}

/// Lower-case `0x` form used as the persistent key for an address.
pub fn address_key(address: Address) -> String {
    format!("{address:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slot_left_pads_short_values() {
        let slot = parse_slot("0x1").expect("slot");
        assert_eq!(slot.0[31], 1);
        assert!(slot.0[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_parse_slot_rejects_oversized_values() {
        let raw = format!("0x{}", "ab".repeat(33));
        assert!(parse_slot(&raw).is_err());
    }

    #[test]
    fn test_address_key_is_lower_case() {
        let address = parse_address("0xC3d688B66703497DAA19211EEdff47f25384cdc3").expect("address");
        assert_eq!(address_key(address), "0xc3d688b66703497daa19211eedff47f25384cdc3");
    }
}
