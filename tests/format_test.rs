//! Display formatting and address normalization.

use amm_pulse_rs::common::{
    format_token_amount, looks_like_tx_hash, normalize_address, parse_address,
};

#[test]
fn tiny_amounts_use_scientific_notation() {
    assert_eq!(format_token_amount(0.001234), "1.234e-3");
    assert_eq!(format_token_amount(0.0000098), "9.800e-6");
    assert_eq!(format_token_amount(0.00999), "9.990e-3");
}

#[test]
fn small_amounts_use_four_decimals() {
    assert_eq!(format_token_amount(0.01), "0.0100");
    assert_eq!(format_token_amount(12.3456789), "12.3457");
    assert_eq!(format_token_amount(999.99994), "999.9999");
}

#[test]
fn large_amounts_group_thousands() {
    assert_eq!(format_token_amount(1000.0), "1,000.00");
    assert_eq!(format_token_amount(1234567.891), "1,234,567.89");
    assert_eq!(format_token_amount(-5000.5), "-5,000.50");
}

#[test]
fn zero_formats_plainly() {
    assert_eq!(format_token_amount(0.0), "0.0000");
}

#[test]
fn normalize_address_lowercases_and_prefixes() {
    assert_eq!(
        normalize_address("0xBB4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c"),
        "0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c"
    );
    assert_eq!(
        normalize_address("BB4CDB9CBD36B01BD1CBAEBF2DE08D9173BC095C"),
        "0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c"
    );
    assert_eq!(
        normalize_address("  0XABCDEF0000000000000000000000000000000001  "),
        "0xabcdef0000000000000000000000000000000001"
    );
}

#[test]
fn normalize_is_idempotent() {
    let once = normalize_address("0xAbCd000000000000000000000000000000000000");
    assert_eq!(normalize_address(&once), once);
}

#[test]
fn parse_address_accepts_checksummed_input() {
    assert!(parse_address("0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c").is_ok());
    assert!(parse_address("not-an-address").is_err());
    assert!(parse_address("0x1234").is_err());
}

#[test]
fn tx_hash_shape_check() {
    let hash = format!("0x{}", "ab".repeat(32));
    assert!(looks_like_tx_hash(&hash));

    // Too short, no prefix, bad characters.
    assert!(!looks_like_tx_hash("0xabcd"));
    assert!(!looks_like_tx_hash(&"ab".repeat(33)));
    assert!(!looks_like_tx_hash(&format!("0x{}", "zz".repeat(32))));
    // Block-header JSON pushed by some providers.
    assert!(!looks_like_tx_hash("{\"parentHash\":\"0x00\"}"));
}
