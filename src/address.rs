//! Mail address parsing and validation.
//!
//! Addresses are `local-part@domain`, lowercase-normalized; equality is
//! string equality after normalization. Display names are intentionally not
//! part of an address, they belong to the profile.

use crate::error::{Result, SealmailError};
use std::fmt;

/// A normalized mail address split into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    address: String,
    domain: String,
    local_part: String,
}

impl Address {
    /// Parses and normalizes an address. Fails on anything that does not
    /// look like `local-part@domain`.
    pub fn parse(raw: &str) -> Result<Self> {
        let lowered = raw.trim().to_lowercase();
        if !valid_address(&lowered) {
            return Err(SealmailError::address(format!("malformed address: {raw}")));
        }
        let (local_part, domain) = lowered.split_once('@').expect("validated above");
        Ok(Self {
            address: format!("{local_part}@{domain}"),
            domain: domain.to_string(),
            local_part: local_part.to_string(),
        })
    }

    /// Builds an address from already-normalized parts (server path
    /// captures are lowercased by the router before they reach here).
    pub fn from_parts(domain: &str, local_part: &str) -> Self {
        let domain = domain.trim().to_lowercase();
        let local_part = local_part.trim().to_lowercase();
        Self {
            address: format!("{local_part}@{domain}"),
            domain,
            local_part,
        }
    }

    /// The full normalized address.
    pub fn as_str(&self) -> &str {
        &self.address
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The local part.
    pub fn local_part(&self) -> &str {
        &self.local_part
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Returns true when `value` is an acceptable, already-lowercased address.
///
/// Local part: alphanumeric start, then alphanumerics and `.-_+`.
/// Domain: at least one dot, labels of alphanumerics and hyphens, and an
/// alphabetic top-level label of two or more characters.
pub fn valid_address(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };

    let mut local_chars = local.chars();
    match local_chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    if !local_chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || ".-_+".contains(c)) {
        return false;
    }

    if domain.is_empty()
        || !domain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return false;
    }
    let Some((_, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_lowercase())
}
