use ethers::types::{Address, H256, U256};
use std::str::FromStr;

// Addresses coming from files or scraped tables may be checksummed, lowercase or uppercase.
// Parsing into `Address` makes every later comparison case-insensitive.
pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    let trimmed = s.trim();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if without_prefix.len() != 40 {
        return Err(ConversionError::InvalidAddress(trimmed.to_string()));
    }
    Address::from_str(&without_prefix.to_lowercase())
        .map_err(|e| ConversionError::InvalidAddress(format!("{}: {}", trimmed, e)))
}

/// Indexed `address` arguments occupy the low 20 bytes of a topic.
pub fn topic_to_address(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

/// Reads the `index`-th 32-byte word of ABI-encoded log data.
pub fn data_word(data: &[u8], index: usize) -> Result<U256, ConversionError> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(ConversionError::ShortData {
            expected: end,
            actual: data.len(),
        });
    }
    Ok(U256::from_big_endian(&data[start..end]))
}

pub fn word_to_u64(word: U256) -> Result<u64, ConversionError> {
    if word > U256::from(u64::MAX) {
        return Err(ConversionError::Overflow);
    }
    Ok(word.as_u64())
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Log data too short: expected {expected} bytes, got {actual}")]
    ShortData { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_address_is_case_insensitive() {
        let lower = string_to_address("0xabcdefabcdefabcdefabcdefabcdefabcdefabcd").unwrap();
        let upper = string_to_address("0XABCDEFABCDEFABCDEFABCDEFABCDEFABCDEFABCD").unwrap();
        let mixed = string_to_address(" 0xAbCdEfAbCdEfAbCdEfAbCdEfAbCdEfAbCdEfAbCd ").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, mixed);
        assert!(string_to_address("0x1234").is_err());
        assert!(string_to_address("not an address").is_err());
    }

    #[test]
    fn test_data_word_bounds() {
        let mut data = vec![0u8; 64];
        data[63] = 7;
        assert_eq!(data_word(&data, 1).unwrap(), U256::from(7));
        assert!(data_word(&data, 2).is_err());
    }
}
