//! Sensitive identifiers and the accounts that pay for hashing them.
use crate::error::{BlindingError, Result};
use std::fmt;

/// Prefix of phone number identifiers.
pub const PHONE_NUMBER_PREFIX: &str = "tel://";

/// Separator between identifier and pepper in the obfuscated identifier.
pub(crate) const PEPPER_SEPARATOR: &str = "__";

const MAX_IDENTIFIER_LEN: usize = 256;
const MAX_E164_DIGITS: usize = 15;

/// A sensitive value to hash. Never transmitted, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Identifier {
    prefix: String,
    value: String,
}

impl Identifier {
    /// Accepts only E.164 numbers: `+`, a non-zero digit, then 1 to 14 digits.
    pub fn phone_number(e164: &str) -> Result<Self> {
        if !is_e164(e164) {
            return Err(BlindingError::InvalidInput(
                "identifier is not an E.164 phone number".to_string(),
            ));
        }
        Ok(Self {
            prefix: PHONE_NUMBER_PREFIX.to_string(),
            value: e164.to_string(),
        })
    }

    /// Identifier of another kind, e.g. an email address under `mailto://`.
    pub fn other(prefix: &str, value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(BlindingError::InvalidInput("identifier is empty".to_string()));
        }
        if value.len() > MAX_IDENTIFIER_LEN {
            return Err(BlindingError::InvalidInput(format!(
                "identifier is longer than {MAX_IDENTIFIER_LEN} bytes"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            value: value.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The bytes that get hashed to the curve.
    pub(crate) fn message(&self) -> &[u8] {
        self.value.as_bytes()
    }

    pub(crate) fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identifier")
            .field("prefix", &self.prefix)
            .field("value", &"omitted")
            .finish()
    }
}

fn is_e164(s: &str) -> bool {
    let digits = match s.strip_prefix('+') {
        Some(d) => d,
        None => return false,
    };
    (2..=MAX_E164_DIGITS).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0')
}

/// The account a request is charged to: a `0x`-prefixed 20-byte address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Account(String);

impl Account {
    pub fn parse(address: &str) -> Result<Self> {
        let hex_part = address.strip_prefix("0x").unwrap_or(address);
        let bytes = hex::decode(hex_part)
            .map_err(|e| BlindingError::InvalidInput(format!("invalid account: {e}")))?;
        if bytes.len() != 20 {
            return Err(BlindingError::InvalidInput(format!(
                "invalid account length: expected 20 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(format!("0x{}", hex::encode(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
