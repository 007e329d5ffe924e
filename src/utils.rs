//! Utility functions.

use crate::error::{Error, Result};

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Decodes a hex digit stream, ignoring whitespace and case.
pub fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| {
            c.to_digit(16)
                .map(|d| d as u8)
                .ok_or_else(|| Error::MalformedPatch(format!("`{c}` is not a hex digit")))
        })
        .collect::<Result<_>>()?;

    if digits.len() % 2 != 0 {
        return Err(Error::MalformedPatch(format!(
            "odd number of hex digits ({})",
            digits.len()
        )));
    }

    Ok(digits.chunks_exact(2).map(|p| (p[0] << 4) | p[1]).collect())
}

/// Encodes bytes as uppercase hex with no separators.
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Parses a 32-bit address written in hex, with or without a `0x` prefix.
pub fn parse_address(text: &str) -> Result<u32> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16)
        .map_err(|e| Error::MalformedPatch(format!("bad address `{text}`: {e}")))
}

pub fn format_address(address: u32) -> String {
    format!("{address:08X}")
}
