//! The reader-side opening pipeline.
//!
//! Opening verifies before it trusts: the envelope checksum is recomputed
//! over the declared field order and the author signature checked against
//! it, then the access key is unwrapped, the content headers opened, the
//! payload decrypted, and finally the payload checksum compared against the
//! one bound inside the signed content headers. Any mismatch along the way
//! is an authenticity failure, not a partial result.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::fs;
use std::path::Path;

use crate::address::Address;
use crate::crypto;
use crate::error::{Result, SealmailError};
use crate::keys::User;
use crate::link;
use crate::message::headers::{parse_attributes, parse_content_headers, parse_envelope_text};
use crate::message::*;
use crate::util;

impl Message {
    /// Recomputes the envelope checksum over the declared field order and
    /// verifies the author's signature over the raw checksum bytes.
    ///
    /// `last_signing_key` covers the rotation grace window: a signature by
    /// the profile's previous key still verifies.
    pub fn verify_envelope_authenticity(
        &self,
        author_signing_key: &[u8; 32],
        last_signing_key: Option<&[u8; 32]>,
    ) -> bool {
        if self.checksum_order.is_empty()
            || self.checksum_hex.is_empty()
            || self.signature_b64.is_empty()
        {
            return false;
        }

        let mut checksum_input = String::new();
        for field in self.checksum_order.split(':') {
            match field.trim().to_lowercase().as_str() {
                HEADER_MESSAGE_ID => checksum_input.push_str(&self.id),
                HEADER_MESSAGE_STREAM => checksum_input.push_str(&self.stream_id),
                HEADER_MESSAGE_ACCESS => checksum_input.push_str(&self.access_list_raw),
                HEADER_MESSAGE_CONTENT_HEADERS => {
                    checksum_input.push_str(&self.content_headers_raw)
                }
                HEADER_MESSAGE_ENCRYPTION => {
                    if let Some(cipher) = &self.payload_cipher {
                        if cipher.original_header_value.is_empty() {
                            checksum_input.push_str(&cipher.to_header());
                        } else {
                            checksum_input.push_str(&cipher.original_header_value);
                        }
                    }
                }
                HEADER_MESSAGE_CHECKSUM | HEADER_MESSAGE_SIGNATURE => continue,
                other => {
                    tracing::warn!(key = other, "unknown envelope key in checksum order");
                    continue;
                }
            }
        }

        let (checksum_hex, checksum_bytes) = crypto::checksum(checksum_input.as_bytes());
        if self.checksum_hex != checksum_hex {
            return false;
        }

        if crypto::verify(author_signing_key, &self.signature_b64, &checksum_bytes) {
            return true;
        }
        last_signing_key
            .is_some_and(|key| crypto::verify(key, &self.signature_b64, &checksum_bytes))
    }

    /// Finds this reader's access-list entry (matching link and encryption
    /// fingerprint) and unwraps the access key with the reader's private
    /// encryption key.
    fn retrieve_access_key(&self, reader: &User) -> Result<Vec<u8>> {
        let reader_link = link::link(&self.author_address, reader.address().as_str());
        for entry in &self.readers {
            if entry.link == reader_link
                && entry.encryption_fingerprint == reader.encryption_fingerprint()
            {
                return crypto::open_anonymous(reader.private_encryption_key(), &entry.sealed_key);
            }
        }
        Err(SealmailError::unauthorized(
            "non-designated reader or public key mismatch",
        ))
    }
}

/// Loads the content headers of an already-opened message directory.
pub fn open_from_unsealed_headers(message_dir: &Path) -> Result<Message> {
    let headers_path = message_dir.join(HEADERS_FILE_NAME);
    if !headers_path.exists() {
        return Err(SealmailError::not_found("message is not opened"));
    }
    let headers_data = fs::read(&headers_path)?;
    let mut message = Message::default();
    parse_content_headers(&mut message, &headers_data)?;
    Ok(message)
}

/// Opens a sealed message directory in place.
///
/// On success the directory holds the decrypted `headers` file and either
/// `body` or `file`, and the sealed `payload` is removed. On failure no
/// opened artifacts are left behind.
pub fn open(
    message_dir: &Path,
    author_address: &Address,
    author_signing_key: &[u8; 32],
    last_signing_key: Option<&[u8; 32]>,
    reader: &User,
) -> Result<Message> {
    let headers_path = message_dir.join(HEADERS_FILE_NAME);
    if headers_path.exists() {
        return Err(SealmailError::conflict("message is already opened"));
    }

    let envelope_data = fs::read_to_string(message_dir.join(ENVELOPE_FILE_NAME))?;
    let mut message = parse_envelope_text(&envelope_data)?;
    message.author_address = author_address.as_str().to_string();

    if message.content_headers_raw.is_empty() {
        return Err(SealmailError::protocol("envelope has no content headers"));
    }

    // Authenticity first: nothing gets decrypted under an unverified
    // envelope.
    if !message.verify_envelope_authenticity(author_signing_key, last_signing_key) {
        return Err(SealmailError::unauthorized("message authenticity failure"));
    }

    let header_attributes = parse_attributes(&message.content_headers_raw);
    let algorithm = header_attributes
        .get("algorithm")
        .cloned()
        .unwrap_or_default()
        .to_lowercase();
    let encoded_value = header_attributes
        .get("value")
        .cloned()
        .unwrap_or_default();

    if message.is_broadcast {
        if !algorithm.is_empty() && algorithm != "none" {
            return Err(SealmailError::protocol(format!(
                "unexpected broadcast content headers cipher: {algorithm}"
            )));
        }
        message.content_headers_bytes = BASE64
            .decode(encoded_value.as_bytes())
            .map_err(|e| SealmailError::protocol(format!("bad content headers: {e}")))?;
    } else {
        if algorithm != crypto::SYMMETRIC_CIPHER {
            return Err(SealmailError::protocol(format!(
                "unsupported content headers cipher: {algorithm}"
            )));
        }
        let access_key = message.retrieve_access_key(reader)?;
        message.content_headers_bytes = crypto::aead_open_b64(&access_key, &encoded_value)?;
        message.access_key = Some(access_key);
    }

    let content_headers = message.content_headers_bytes.clone();
    parse_content_headers(&mut message, &content_headers)?;

    // The embedded copies must agree with the envelope; substitution of
    // either side breaks here.
    if message.content.id != message.id {
        return Err(SealmailError::unauthorized(
            "content id does not match envelope",
        ));
    }
    if message.content.author != author_address.as_str() {
        return Err(SealmailError::unauthorized(
            "content author does not match envelope source",
        ));
    }

    let payload_path = message_dir.join(PAYLOAD_FILE_NAME);
    let destination = if message.is_file() {
        message_dir.join(FILE_FILE_NAME)
    } else {
        message_dir.join(BODY_FILE_NAME)
    };

    let summary = decrypt_payload(&message, &payload_path, &destination);
    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => {
            let _ = fs::remove_file(&destination);
            return Err(e);
        }
    };

    if message.content.checksum != summary.output_checksum {
        let _ = fs::remove_file(&destination);
        return Err(SealmailError::crypto("content checksum failure: seal broken"));
    }

    if message.is_file() {
        if let Some(modified_at) = message
            .content
            .file
            .as_ref()
            .and_then(|file| file.modified_at)
        {
            util::set_file_modified(&destination, &modified_at)?;
        }
    } else {
        message.content.body = fs::read(&destination)?;
    }

    let mut headers_file = message.content_headers_bytes.clone();
    headers_file.push(b'\n');
    fs::write(&headers_path, headers_file)?;

    fs::remove_file(&payload_path)?;
    Ok(message)
}

fn decrypt_payload(
    message: &Message,
    payload_path: &Path,
    destination: &Path,
) -> Result<crypto::IoSummary> {
    if message.is_broadcast {
        // A copy instead of a rename, so the checksum is computed in the
        // same pass.
        return crypto::copy_hashed(payload_path, destination);
    }

    let access_key = message
        .access_key
        .as_deref()
        .ok_or_else(|| SealmailError::crypto("message has no access key"))?;
    let cipher = message
        .payload_cipher
        .as_ref()
        .ok_or_else(|| SealmailError::protocol("private message without cipher descriptor"))?;

    if message.is_file() && !cipher.stream {
        return Err(SealmailError::protocol(
            "file message requires the streaming cipher",
        ));
    }

    if cipher.stream {
        crypto::secretstream::open_file(payload_path, destination, access_key, cipher.chunk_size)
    } else {
        crypto::aead_open_file(payload_path, destination, access_key)
    }
}
