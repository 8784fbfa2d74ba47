//! Per-request authentication tokens.
//!
//! Every authenticated request carries a freshly generated nonce token:
//! a random value, its Ed25519 signature, and the signing public key. The
//! token proves possession of the key; the fingerprint of that key is the
//! caller's identity. Replay protection is the server's side of the
//! contract, scoped per account across the current and previous day (see
//! the store's nonce ledger).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::crypto::{self, SIGNING_ALGORITHM};
use crate::error::{Result, SealmailError};
use crate::keys::User;
use crate::util;

/// Authentication scheme name on the wire.
pub const NONCE_SCHEME: &str = "SOTN";
/// Random token length in characters.
pub const NONCE_VALUE_LENGTH: usize = 32;

const ATTRIBUTE_VALUE: &str = "value";
const ATTRIBUTE_ALGORITHM: &str = "algorithm";
const ATTRIBUTE_SIGNATURE: &str = "signature";
const ATTRIBUTE_KEY: &str = "key";

/// A parsed or freshly built nonce token.
#[derive(Debug, Clone)]
pub struct Nonce {
    pub value: String,
    pub signature: String,
    pub signing_key: [u8; 32],
    pub algorithm: String,

    pub signing_key_b64: String,
    pub signing_fingerprint: String,
    /// Local receipt timestamp, RFC 3339; recorded in the nonce ledger.
    pub date: String,
}

impl Nonce {
    /// Builds a fresh single-use token signed by the user's signing key.
    pub fn for_user(user: &User) -> Result<Self> {
        Self::new(user.public_signing_key(), user.private_signing_key())
    }

    /// Builds a fresh token from raw key material.
    pub fn new(public_key: &[u8; 32], private_key: &[u8; 64]) -> Result<Self> {
        let value = crypto::random_token(NONCE_VALUE_LENGTH);
        let signature = crypto::sign(private_key, value.as_bytes())?;
        Ok(Self {
            value,
            signature,
            signing_key: *public_key,
            algorithm: SIGNING_ALGORITHM.to_string(),
            signing_key_b64: BASE64.encode(public_key),
            signing_fingerprint: crypto::fingerprint(public_key),
            date: util::to_rfc3339(&util::timestamp_now()),
        })
    }

    /// Renders the token as an authorization header value.
    pub fn to_header(&self) -> String {
        format!(
            "{NONCE_SCHEME} {ATTRIBUTE_VALUE}={}, {ATTRIBUTE_ALGORITHM}={}, \
             {ATTRIBUTE_SIGNATURE}={}, {ATTRIBUTE_KEY}={}",
            self.value, self.algorithm, self.signature, self.signing_key_b64
        )
    }

    /// Parses an authorization header value.
    ///
    /// Duplicate attributes are as malformed as missing ones; a replayed
    /// header with a second `value=` smuggled in must not parse.
    pub fn from_header(header: &str) -> Result<Self> {
        let rest = header
            .trim()
            .strip_prefix(NONCE_SCHEME)
            .ok_or_else(|| SealmailError::protocol("bad nonce header"))?;
        let rest = rest.replace(['\t', '\n'], " ");

        let mut value = String::new();
        let mut signature = String::new();
        let mut algorithm = String::new();
        let mut signing_key_b64 = String::new();
        let mut signing_key = [0u8; 32];

        for pair in rest.split(',') {
            let Some((key, attr_value)) = pair.trim().split_once('=') else {
                continue;
            };
            let attr_value = attr_value.trim();
            match key.trim().to_lowercase().as_str() {
                ATTRIBUTE_ALGORITHM => algorithm = attr_value.to_string(),

                ATTRIBUTE_VALUE => {
                    if !value.is_empty() {
                        return Err(SealmailError::protocol("bad nonce header"));
                    }
                    value = attr_value.to_string();
                }

                ATTRIBUTE_SIGNATURE => {
                    if !signature.is_empty() {
                        return Err(SealmailError::protocol("bad nonce header"));
                    }
                    signature = attr_value.to_string();
                }

                ATTRIBUTE_KEY => {
                    if !signing_key_b64.is_empty() {
                        return Err(SealmailError::protocol("bad nonce header"));
                    }
                    signing_key = crypto::decode_key32(attr_value)?;
                    signing_key_b64 = attr_value.to_string();
                }

                _ => continue,
            }
        }

        if value.is_empty() || signature.is_empty() || signing_key_b64.is_empty() {
            return Err(SealmailError::protocol("bad nonce header"));
        }

        Ok(Self {
            value,
            signature,
            signing_key,
            algorithm,
            signing_fingerprint: crypto::fingerprint(&signing_key),
            signing_key_b64,
            date: util::to_rfc3339(&util::timestamp_now()),
        })
    }

    /// Verifies the token: the embedded key must hash to the derived
    /// fingerprint and the signature must cover the nonce value.
    pub fn verify(&self) -> Result<()> {
        if crypto::fingerprint(&self.signing_key) != self.signing_fingerprint {
            return Err(SealmailError::unauthorized("bad nonce signing key"));
        }
        if !crypto::verify(&self.signing_key, &self.signature, self.value.as_bytes()) {
            return Err(SealmailError::unauthorized("bad nonce signature"));
        }
        Ok(())
    }
}
