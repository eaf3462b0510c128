use std::{fmt, str::FromStr};

use alloy::primitives::{Address, address};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

const ADDRESS_HEX_LEN: usize = 40;

/// The placeholder address used by wallets and aggregators for native ether.
pub const NATIVE_ETHER: TokenAddress =
    TokenAddress(address!("0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid token address: {0}")]
pub struct InvalidAddress(pub String);

/// A token contract address in canonical form.
///
/// Every address entering the system (HTTP paths, database rows, price feed
/// responses) goes through [`TokenAddress::parse`], so equality and hashing
/// never depend on the casing the caller happened to use. The canonical string
/// form is lowercase and `0x` prefixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenAddress(Address);

impl TokenAddress {
    /// Parses 40 hex digits with an optional `0x` prefix, in any casing.
    pub fn parse(raw: &str) -> Result<Self, InvalidAddress> {
        let digits = raw.strip_prefix("0x").unwrap_or(raw);
        if digits.len() != ADDRESS_HEX_LEN || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidAddress(raw.to_string()));
        }

        let addr = Address::from_str(digits).map_err(|_| InvalidAddress(raw.to_string()))?;
        Ok(Self(addr))
    }

    pub fn as_address(&self) -> Address {
        self.0
    }

    pub fn is_native_ether(&self) -> bool {
        *self == NATIVE_ETHER
    }
}

impl FromStr for TokenAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TokenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&alloy::hex::encode_prefixed(self.0))
    }
}

impl Serialize for TokenAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DAI: &str = "0x6B175474E89094C44Da98b954EedeAC495271d0F";

    #[test]
    fn test_parse_normalizes_case() {
        let addr = TokenAddress::parse(DAI).unwrap();
        assert_eq!(addr.to_string(), DAI.to_lowercase());
    }

    #[test]
    fn test_parse_accepts_missing_prefix() {
        let with_prefix = TokenAddress::parse(DAI).unwrap();
        let without_prefix = TokenAddress::parse(&DAI[2..]).unwrap();
        assert_eq!(with_prefix, without_prefix);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "",
            "0x",
            "0xThisIsNotAValidAddress",
            "0x6B175474E89094C44Da98b954EedeAC495271d0",
            "0x6B175474E89094C44Da98b954EedeAC495271d0F0",
            "0X6B175474E89094C44Da98b954EedeAC495271d0F",
            " 0x6B175474E89094C44Da98b954EedeAC495271d0F",
            "0x6B175474E89094C44Da98b954EedeAC495271d0G",
        ] {
            assert_eq!(
                TokenAddress::parse(raw),
                Err(InvalidAddress(raw.to_string())),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_native_ether_placeholder() {
        let addr = TokenAddress::parse("0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE").unwrap();
        assert!(addr.is_native_ether());
        assert_eq!(addr.to_string(), "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");
    }

    #[test]
    fn test_serde_uses_canonical_form() {
        let addr = TokenAddress::parse(DAI).unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", DAI.to_lowercase()));

        let back: TokenAddress = serde_json::from_str(&format!("\"{DAI}\"")).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<TokenAddress>("\"0x1234\"").is_err());
    }

    proptest! {
        #[test]
        fn test_any_casing_parses_to_same_address(
            digits in "[0-9a-fA-F]{40}",
            prefixed in any::<bool>(),
        ) {
            let raw = if prefixed { format!("0x{digits}") } else { digits.clone() };
            let addr = TokenAddress::parse(&raw).unwrap();
            prop_assert_eq!(addr.to_string(), format!("0x{}", digits.to_lowercase()));
            prop_assert_eq!(addr, TokenAddress::parse(&digits.to_uppercase()).unwrap());
        }

        #[test]
        fn test_wrong_length_is_rejected(digits in "[0-9a-f]{0,80}") {
            prop_assume!(digits.len() != 40);
            prop_assert!(TokenAddress::parse(&digits).is_err());
            let prefixed = format!("0x{}", digits);
            prop_assert!(TokenAddress::parse(&prefixed).is_err());
        }
    }
}
