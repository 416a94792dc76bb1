use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("hex string has odd length")]
    OddLength,
    #[error("invalid hex digit at index {0}")]
    InvalidDigit(usize),
}

/// Decodes a hex string, case-insensitive, no `0x` prefix.
pub fn decode(value: &str) -> Result<Vec<u8>, HexError> {
    ::hex::decode(value).map_err(|err| match err {
        ::hex::FromHexError::OddLength => HexError::OddLength,
        ::hex::FromHexError::InvalidHexCharacter { index, .. } => HexError::InvalidDigit(index),
        // hex::decode allocates its own output, so this arm is unreachable.
        ::hex::FromHexError::InvalidStringLength => HexError::OddLength,
    })
}

/// Total form of [`decode`]: any violation yields an empty byte vector.
pub fn hex_to_bytes(value: &str) -> Vec<u8> {
    decode(value).unwrap_or_default()
}

pub fn is_valid_hex(value: &str) -> bool {
    !value.is_empty()
        && value.len() % 2 == 0
        && value.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn encode(bytes: &[u8]) -> String {
    ::hex::encode(bytes)
}

pub fn encode_upper(bytes: &[u8]) -> String {
    ::hex::encode_upper(bytes)
}

/// Two digits per byte joined by `separator`, e.g. `"05 00 00"`.
pub fn encode_separated(bytes: &[u8], separator: &str) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(separator)
}
