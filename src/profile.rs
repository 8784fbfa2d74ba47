//! The public profile format.
//!
//! A profile is labeled-field text served by an account's mail host. It is
//! the out-of-band channel for public keys: envelope signatures verify
//! against the profile's signing key, notifications seal to its encryption
//! key, and the `Last-Signing-Key` field keeps one rotated-out key
//! acceptable as a grace window.

use chrono::{DateTime, Utc};

use crate::crypto::{self, ANONYMOUS_ENCRYPTION_CIPHER, SIGNING_ALGORITHM};
use crate::error::{Result, SealmailError};
use crate::keys::User;
use crate::util;

pub const PROFILE_FIELD_ADDRESS: &str = "Address";
pub const PROFILE_FIELD_NAME: &str = "Name";
pub const PROFILE_FIELD_PUBLIC_ACCESS: &str = "Public-Access";
pub const PROFILE_FIELD_ENCRYPTION_KEY: &str = "Encryption-Key";
pub const PROFILE_FIELD_SIGNING_KEY: &str = "Signing-Key";
pub const PROFILE_FIELD_LAST_SIGNING_KEY: &str = "Last-Signing-Key";
pub const PROFILE_FIELD_AWAY: &str = "Away";
pub const PROFILE_FIELD_AWAY_WARNING: &str = "Away-Warning";
pub const PROFILE_FIELD_UPDATED: &str = "Updated";
pub const PROFILE_FIELD_LAST_SEEN_PUBLIC: &str = "Last-Seen-Public";

const HEADER_YES_VALUE: &str = "Yes";
const HEADER_NO_VALUE: &str = "No";

/// Image MIME types a mail host will serve; everything else is refused at
/// upload and at serve time.
pub const PERMITTED_PROFILE_IMAGE_TYPES: [&str; 3] = ["image/webp", "image/png", "image/jpeg"];

/// A parsed profile. Only the fields the protocol reacts to are broken
/// out; the raw body is retained so a fetched profile can be stored or
/// re-served byte-identical.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub address: String,
    pub name: String,

    pub is_away: bool,
    pub away_message: String,

    pub public_access: bool,
    pub last_seen_public: bool,

    pub encryption_key_b64: String,
    pub encryption_key: Option<[u8; 32]>,
    pub encryption_fingerprint: String,

    pub signing_key_b64: String,
    pub signing_key: Option<[u8; 32]>,
    pub signing_fingerprint: String,

    pub last_signing_key_b64: String,
    pub last_signing_key: Option<[u8; 32]>,
    pub last_signing_fingerprint: String,

    pub updated: Option<DateTime<Utc>>,

    /// The body as received or stored.
    pub raw: Vec<u8>,
}

impl Profile {
    /// Parses a profile body. Unknown fields are ignored; `#` lines are
    /// comments. Accounts are reachable by default: `Public-Access` is
    /// true unless explicitly `No`.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|_| SealmailError::profile("profile is not UTF-8"))?;
        let mut profile = Profile {
            public_access: true,
            raw: body.to_vec(),
            ..Default::default()
        };

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            profile.assign_field(key.trim(), value.trim())?;
        }
        Ok(profile)
    }

    fn assign_field(&mut self, key: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        match key {
            PROFILE_FIELD_ADDRESS => self.address = value.to_lowercase(),

            PROFILE_FIELD_NAME => self.name = value.to_string(),

            PROFILE_FIELD_PUBLIC_ACCESS => {
                self.public_access = !value.eq_ignore_ascii_case(HEADER_NO_VALUE)
            }

            PROFILE_FIELD_AWAY => self.is_away = value.eq_ignore_ascii_case(HEADER_YES_VALUE),

            PROFILE_FIELD_AWAY_WARNING => self.away_message = value.to_string(),

            PROFILE_FIELD_ENCRYPTION_KEY => {
                let (b64, key, fingerprint) = extract_key_data(ANONYMOUS_ENCRYPTION_CIPHER, value)?;
                self.encryption_key_b64 = b64;
                self.encryption_key = Some(key);
                self.encryption_fingerprint = fingerprint;
            }

            PROFILE_FIELD_SIGNING_KEY => {
                let (b64, key, fingerprint) = extract_key_data(SIGNING_ALGORITHM, value)?;
                self.signing_key_b64 = b64;
                self.signing_key = Some(key);
                self.signing_fingerprint = fingerprint;
            }

            PROFILE_FIELD_LAST_SIGNING_KEY => {
                let (b64, key, fingerprint) = extract_key_data(SIGNING_ALGORITHM, value)?;
                self.last_signing_key_b64 = b64;
                self.last_signing_key = Some(key);
                self.last_signing_fingerprint = fingerprint;
            }

            PROFILE_FIELD_UPDATED => self.updated = Some(util::parse_rfc3339(value)?),

            PROFILE_FIELD_LAST_SEEN_PUBLIC => {
                self.last_seen_public = !value.eq_ignore_ascii_case(HEADER_NO_VALUE)
            }

            _ => {}
        }
        Ok(())
    }

    /// A profile is functional once it carries a signing key; nothing else
    /// is required for authentication to work.
    pub fn is_functional(&self) -> bool {
        !self.signing_key_b64.is_empty()
    }

    /// Builds the minimal profile for a local user, the form used for
    /// provisioning and for tests.
    pub fn for_user(user: &User, name: &str) -> Self {
        let mut profile = Profile {
            address: user.address().as_str().to_string(),
            name: name.to_string(),
            public_access: true,
            encryption_key_b64: user.public_encryption_key_b64(),
            encryption_key: Some(*user.public_encryption_key()),
            encryption_fingerprint: user.encryption_fingerprint().to_string(),
            signing_key_b64: user.public_signing_key_b64(),
            signing_key: Some(*user.public_signing_key()),
            signing_fingerprint: user.signing_fingerprint().to_string(),
            updated: Some(util::timestamp_now()),
            ..Default::default()
        };
        profile.raw = profile.to_text().into_bytes();
        profile
    }

    /// Renders the profile as field text.
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        if !self.address.is_empty() {
            lines.push(format!("{PROFILE_FIELD_ADDRESS}: {}", self.address));
        }
        if !self.name.is_empty() {
            lines.push(format!("{PROFILE_FIELD_NAME}: {}", self.name));
        }
        lines.push(format!(
            "{PROFILE_FIELD_PUBLIC_ACCESS}: {}",
            bool_value(self.public_access)
        ));
        if !self.encryption_key_b64.is_empty() {
            lines.push(format!(
                "{PROFILE_FIELD_ENCRYPTION_KEY}: algorithm={ANONYMOUS_ENCRYPTION_CIPHER}; value={}",
                self.encryption_key_b64
            ));
        }
        if !self.signing_key_b64.is_empty() {
            lines.push(format!(
                "{PROFILE_FIELD_SIGNING_KEY}: algorithm={SIGNING_ALGORITHM}; value={}",
                self.signing_key_b64
            ));
        }
        if !self.last_signing_key_b64.is_empty() {
            lines.push(format!(
                "{PROFILE_FIELD_LAST_SIGNING_KEY}: algorithm={SIGNING_ALGORITHM}; value={}",
                self.last_signing_key_b64
            ));
        }
        if self.is_away {
            lines.push(format!("{PROFILE_FIELD_AWAY}: {HEADER_YES_VALUE}"));
        }
        if !self.away_message.is_empty() {
            lines.push(format!("{PROFILE_FIELD_AWAY_WARNING}: {}", self.away_message));
        }
        if let Some(updated) = &self.updated {
            lines.push(format!(
                "{PROFILE_FIELD_UPDATED}: {}",
                util::to_rfc3339(updated)
            ));
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

fn bool_value(value: bool) -> &'static str {
    if value {
        HEADER_YES_VALUE
    } else {
        HEADER_NO_VALUE
    }
}

/// Extracts a key from an `algorithm=…; value=…` profile field, checking
/// the algorithm and deriving the fingerprint from the decoded bytes.
fn extract_key_data(algorithm: &str, field_value: &str) -> Result<(String, [u8; 32], String)> {
    let attributes = crate::message::headers::parse_attributes(field_value);
    let field_algorithm = attributes
        .get("algorithm")
        .ok_or_else(|| SealmailError::profile("'algorithm' attribute not present in key data"))?;
    if !field_algorithm.eq_ignore_ascii_case(algorithm) {
        return Err(SealmailError::profile("algorithm mismatch in key data"));
    }
    let value = attributes
        .get("value")
        .ok_or_else(|| SealmailError::profile("'value' attribute not present in key data"))?;
    let key = crypto::decode_key32(value)?;
    Ok((value.clone(), key, crypto::fingerprint(&key)))
}

/// Sniffs the image type of `data`, returning the MIME type only when it
/// is one of the permitted profile image formats.
pub fn detect_image_type(data: &[u8]) -> Option<&'static str> {
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if data.starts_with(&[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a]) {
        return Some("image/png");
    }
    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some("image/jpeg");
    }
    None
}

/// True when the MIME type is one a mail host will serve.
pub fn image_type_permitted(mime_type: &str) -> bool {
    PERMITTED_PROFILE_IMAGE_TYPES.contains(&mime_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn test_user(address: &str) -> User {
        User::generate(Address::parse(address).unwrap())
    }

    #[test]
    fn test_profile_roundtrip() {
        let user = test_user("a@x.test");
        let profile = Profile::for_user(&user, "Alice");
        let parsed = Profile::parse(profile.to_text().as_bytes()).unwrap();

        assert_eq!(parsed.address, "a@x.test");
        assert_eq!(parsed.name, "Alice");
        assert!(parsed.public_access);
        assert!(parsed.is_functional());
        assert_eq!(parsed.signing_fingerprint, user.signing_fingerprint());
        assert_eq!(parsed.encryption_fingerprint, user.encryption_fingerprint());
        assert_eq!(parsed.signing_key.unwrap(), *user.public_signing_key());
    }

    #[test]
    fn test_public_access_defaults_true() {
        let profile = Profile::parse(b"Name: Bob\n").unwrap();
        assert!(profile.public_access);

        let profile = Profile::parse(b"Public-Access: No\n").unwrap();
        assert!(!profile.public_access);
    }

    #[test]
    fn test_away_fields() {
        let profile =
            Profile::parse(b"Away: Yes\nAway-Warning: back next week\n").unwrap();
        assert!(profile.is_away);
        assert_eq!(profile.away_message, "back next week");
    }

    #[test]
    fn test_key_algorithm_mismatch_rejected() {
        let user = test_user("a@x.test");
        let body = format!(
            "Signing-Key: algorithm=rsa; value={}\n",
            user.public_signing_key_b64()
        );
        assert!(Profile::parse(body.as_bytes()).is_err());
    }

    #[test]
    fn test_last_signing_key_parsed() {
        let user = test_user("a@x.test");
        let old = test_user("a@x.test");
        let body = format!(
            "Signing-Key: algorithm=ed25519; value={}\nLast-Signing-Key: algorithm=ed25519; value={}\n",
            user.public_signing_key_b64(),
            old.public_signing_key_b64(),
        );
        let profile = Profile::parse(body.as_bytes()).unwrap();
        assert_eq!(profile.last_signing_fingerprint, old.signing_fingerprint());
    }

    #[test]
    fn test_non_functional_profile() {
        let profile = Profile::parse(b"Name: Nobody\n").unwrap();
        assert!(!profile.is_functional());
    }

    #[test]
    fn test_detect_image_type() {
        assert_eq!(
            detect_image_type(&[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0, 0]),
            Some("image/png")
        );
        assert_eq!(detect_image_type(&[0xff, 0xd8, 0xff, 0xe0]), Some("image/jpeg"));
        assert_eq!(
            detect_image_type(b"RIFF\x00\x00\x00\x00WEBPVP8 "),
            Some("image/webp")
        );
        assert_eq!(detect_image_type(b"GIF89a"), None);
        assert!(image_type_permitted("image/png"));
        assert!(!image_type_permitted("image/gif"));
    }
}
