//! Bitcoin address extraction from output scripts.
//!
//! Only standard addresses are kept; anything the node cannot render as an
//! address (bare multisig, OP_RETURN, non-standard scripts) is skipped.

use crate::rpc::ScriptPubKey;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Base58 (P2PKH / P2SH, main and test networks)
static BASE58_ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[123mn][a-km-zA-HJ-NP-Z1-9]{25,34}$").expect("Invalid regex pattern")
});

/// Bech32 / bech32m segwit addresses (lowercase or uppercase, not mixed)
static BECH32_ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:bc|tb|bcrt)1[ac-hj-np-z02-9]{8,87}|(?:BC|TB|BCRT)1[AC-HJ-NP-Z02-9]{8,87})$")
        .expect("Invalid regex pattern")
});

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("Script has no address")]
    Missing,

    #[error("Script resolves to {0} addresses")]
    Ambiguous(usize),

    #[error("Invalid address format: {0}")]
    InvalidFormat(String),
}

/// Check that a string looks like a standard Bitcoin address
pub fn is_standard_address(address: &str) -> bool {
    BASE58_ADDRESS_PATTERN.is_match(address) || BECH32_ADDRESS_PATTERN.is_match(address)
}

/// Resolve the single standard address paid by an output script.
///
/// Newer nodes report `address`; older ones report an `addresses` array, which
/// is only accepted when it has exactly one entry.
pub fn resolve_address(script: &ScriptPubKey) -> Result<String, AddressError> {
    let candidate = match (&script.address, script.addresses.as_slice()) {
        (Some(address), _) => address.trim(),
        (None, [single]) => single.trim(),
        (None, []) => return Err(AddressError::Missing),
        (None, many) => return Err(AddressError::Ambiguous(many.len())),
    };

    if !is_standard_address(candidate) {
        return Err(AddressError::InvalidFormat(candidate.to_string()));
    }
    Ok(candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(address: Option<&str>, addresses: &[&str]) -> ScriptPubKey {
        ScriptPubKey {
            address: address.map(str::to_string),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            script_type: None,
        }
    }

    #[test]
    fn test_standard_addresses() {
        assert!(is_standard_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
        assert!(is_standard_address("3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"));
        assert!(is_standard_address(
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"
        ));
        assert!(is_standard_address(
            "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080"
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(!is_standard_address(""));
        assert!(!is_standard_address("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"));
        assert!(!is_standard_address("1OIl0000000000000000000000000"));
        assert!(!is_standard_address("bc1qAr0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"));
    }

    #[test]
    fn test_resolve_prefers_address_field() {
        let s = script(
            Some("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
            &["3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"],
        );
        assert_eq!(
            resolve_address(&s).unwrap(),
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"
        );
    }

    #[test]
    fn test_resolve_legacy_addresses_array() {
        let s = script(None, &["3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"]);
        assert_eq!(
            resolve_address(&s).unwrap(),
            "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"
        );

        let multisig = script(
            None,
            &[
                "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
                "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy",
            ],
        );
        assert_eq!(resolve_address(&multisig), Err(AddressError::Ambiguous(2)));
    }

    #[test]
    fn test_resolve_missing() {
        assert_eq!(resolve_address(&script(None, &[])), Err(AddressError::Missing));
    }
}
