// src/common/utils.rs
use crate::common::PulseError;
use ethers::core::types::Address;
use std::str::FromStr;

/// Lowercase-hex form of an address string, `0x`-prefixed.
/// Every address-keyed map in the crate goes through this helper on both
/// insert and lookup; no other code path builds a map key from an address.
pub fn normalize_address(addr: &str) -> String {
    let trimmed = addr.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_lowercase())
}

/// Lowercase-hex form of a parsed [Address].
pub fn address_to_lower(addr: &Address) -> String {
    format!("0x{}", ethers::utils::hex::encode(addr.as_bytes()))
}

/// Parse a hex address string into an [Address].
pub fn parse_address(addr: &str) -> Result<Address, PulseError> {
    Address::from_str(addr.trim())
        .map_err(|_| PulseError::Validation(format!("invalid address: {}", addr)))
}

/// True when `s` has the shape of a 32-byte tx hash (`0x` + 64 hex chars).
/// Some providers push block headers on the pending-tx channel; anything
/// that fails this check is dropped at the subscription boundary.
pub fn looks_like_tx_hash(s: &str) -> bool {
    s.len() == 66 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

// get timestamp in milliseconds
pub fn get_timestamp_millis() -> u64 {
    chrono::Utc::now()
        .timestamp_millis()
        .try_into()
        .unwrap_or(0)
}

/// Current time as an RFC 3339 string, the timestamp format on every
/// outbound envelope.
pub fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Human display tiers for token amounts: below 0.01 scientific with 4
/// significant digits, below 1000 fixed with 4 decimals, otherwise
/// thousands-grouped with 2 decimals.
pub fn format_token_amount(amount: f64) -> String {
    if amount == 0.0 {
        return "0.0000".to_string();
    }
    let abs = amount.abs();
    if abs < 0.01 {
        format!("{:.3e}", amount)
    } else if abs < 1000.0 {
        format!("{:.4}", amount)
    } else {
        group_thousands(amount)
    }
}

fn group_thousands(amount: f64) -> String {
    let fixed = format!("{:.2}", amount);
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", int_part),
    };
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}.{}", sign, grouped, frac_part)
}
