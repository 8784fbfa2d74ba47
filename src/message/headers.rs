//! Envelope and content header parsing and rendering.
//!
//! Both the envelope and the content block are line-oriented UTF-8 text:
//! `Header-Name: attr=val; attr=val; …` with `#` comment lines. The
//! envelope may equivalently travel as HTTP headers; only the permitted
//! envelope keys cross that boundary, in either direction.

use std::collections::HashMap;

use tracing::warn;

use crate::crypto::{
    CipherDescriptor, ANONYMOUS_ENCRYPTION_CIPHER, CHECKSUM_ALGORITHM, SIGNING_ALGORITHM,
};
use crate::error::{Result, SealmailError};
use crate::link;
use crate::message::*;
use crate::util;

/// Separator between a header key and its value.
pub const HEADER_KEY_VALUE_SEPARATOR: char = ':';
/// Separator between access list entries.
pub const ACCESS_LIST_SEPARATOR: char = ',';
/// Separator between disclosed reader addresses.
pub const READERS_ADDRESS_SEPARATOR: char = ',';

const ACCESS_ATTRIBUTE_LINK: &str = "link";
const ACCESS_ATTRIBUTE_SIGNING_FINGERPRINT: &str = "access-key";
const ACCESS_ATTRIBUTE_SEALED_KEY: &str = "value";
const ACCESS_ATTRIBUTE_ALGORITHM: &str = "algorithm";
const ACCESS_ATTRIBUTE_ENCRYPTION_FINGERPRINT: &str = "key";

/// Parses `attr=val; attr=val` attribute strings. Keys are lowercased and
/// trimmed; attributes without `=` are ignored.
pub fn parse_attributes(value: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    for pair in value.split(';') {
        if let Some((key, val)) = pair.split_once('=') {
            attributes.insert(key.trim().to_lowercase(), val.trim().to_string());
        }
    }
    attributes
}

/// Renders one header line.
pub fn header_line(key: &str, value: &str) -> String {
    format!("{key}{HEADER_KEY_VALUE_SEPARATOR} {value}")
}

/// Renders the envelope checksum header value, declaring the field order
/// the sum was computed over.
pub fn envelope_checksum_header(checksum_hex: &str, headers_order: &str) -> String {
    format!("algorithm={CHECKSUM_ALGORITHM}; order={headers_order}; value={checksum_hex}")
}

/// Renders a content checksum header value.
pub fn content_checksum_header(checksum_hex: &str) -> String {
    format!("algorithm={CHECKSUM_ALGORITHM}; value={checksum_hex}")
}

/// Renders the envelope signature header value.
pub fn signature_header(signature_b64: &str) -> String {
    format!("algorithm={SIGNING_ALGORITHM}; value={signature_b64}")
}

/// Renders the `file` content header value.
pub fn file_header(file: &FileAttachment) -> String {
    let modified = file
        .modified_at
        .as_ref()
        .map(util::to_rfc3339)
        .unwrap_or_default();
    format!(
        "name={}; type={}; modified={}",
        file.name, file.mime_type, modified
    )
}

/// Renders one access-list entry.
///
/// The signing fingerprint (`access-key`) tells the server whom to serve
/// the message to; the encryption fingerprint (`key`) tells the reader
/// which of its encryption pairs opens the sealed value.
pub fn envelope_access_line(reader: &Reader) -> String {
    format!(
        "{}={}; {}={}; {}={}; {}={}; {}={}",
        ACCESS_ATTRIBUTE_LINK,
        reader.link,
        ACCESS_ATTRIBUTE_SIGNING_FINGERPRINT,
        reader.signing_fingerprint,
        ACCESS_ATTRIBUTE_SEALED_KEY,
        reader.sealed_key,
        ACCESS_ATTRIBUTE_ALGORITHM,
        ANONYMOUS_ENCRYPTION_CIPHER,
        ACCESS_ATTRIBUTE_ENCRYPTION_FINGERPRINT,
        reader.encryption_fingerprint,
    )
}

/// Parses one access-list entry. Returns `None` for entries sealed with an
/// algorithm this implementation does not speak.
pub fn parse_envelope_access_line(line: &str) -> Option<Reader> {
    let mut reader = Reader::default();
    for (key, value) in parse_attributes(line) {
        match key.as_str() {
            ACCESS_ATTRIBUTE_LINK => reader.link = value,
            ACCESS_ATTRIBUTE_SIGNING_FINGERPRINT => reader.signing_fingerprint = value,
            ACCESS_ATTRIBUTE_SEALED_KEY => reader.sealed_key = value,
            ACCESS_ATTRIBUTE_ALGORITHM => {
                if value.to_lowercase() != ANONYMOUS_ENCRYPTION_CIPHER {
                    return None;
                }
            }
            ACCESS_ATTRIBUTE_ENCRYPTION_FINGERPRINT => reader.encryption_fingerprint = value,
            _ => continue,
        }
    }
    Some(reader)
}

/// Parses a full `Message-Access` value into reader entries.
pub fn parse_access_list(value: &str) -> Vec<Reader> {
    value
        .split(ACCESS_LIST_SEPARATOR)
        .filter_map(|entry| parse_envelope_access_line(entry.trim()))
        .collect()
}

/// Scans raw envelope text for the access list and reports whether the
/// given `(link, signing fingerprint)` pair appears in it.
///
/// This is the server's second-line defense on individual private fetches,
/// independent of the index.
pub fn access_list_contains(envelope_text: &str, link: &str, signing_fingerprint: &str) -> bool {
    let header_prefix = format!("{HEADER_MESSAGE_ACCESS}{HEADER_KEY_VALUE_SEPARATOR}");
    for line in envelope_text.lines() {
        let line = line.trim();
        if line.len() < header_prefix.len()
            || !line[..header_prefix.len()].eq_ignore_ascii_case(&header_prefix)
        {
            continue;
        }
        return parse_access_list(&line[header_prefix.len()..])
            .iter()
            .any(|reader| {
                reader.link == link && reader.signing_fingerprint == signing_fingerprint
            });
    }
    false
}

/// True when raw envelope text carries an access list, i.e. describes a
/// private message.
pub fn envelope_has_access_list(envelope_text: &str) -> bool {
    let header_prefix = format!("{HEADER_MESSAGE_ACCESS}{HEADER_KEY_VALUE_SEPARATOR}");
    envelope_text.lines().any(|line| {
        let line = line.trim();
        line.len() >= header_prefix.len()
            && line[..header_prefix.len()].eq_ignore_ascii_case(&header_prefix)
    })
}

/// Assigns one envelope header to the message. Returns whether the key is
/// a mail envelope header at all; unknown keys are ignored so the envelope
/// can travel alongside arbitrary HTTP headers.
pub fn assign_envelope_header(key: &str, value: &str, message: &mut Message) -> Result<bool> {
    let value = value.trim();
    match key.trim().to_lowercase().as_str() {
        HEADER_MESSAGE_ID => message.id = value.to_string(),

        HEADER_MESSAGE_STREAM => message.stream_id = value.to_string(),

        HEADER_MESSAGE_ACCESS => {
            message.access_list_raw = value.to_string();
            message.is_broadcast = false;
            message.readers = parse_access_list(value);
        }

        HEADER_MESSAGE_CONTENT_HEADERS => message.content_headers_raw = value.to_string(),

        HEADER_MESSAGE_CHECKSUM => {
            let attributes = parse_attributes(value);
            if attributes.get("algorithm").map(String::as_str) != Some(CHECKSUM_ALGORITHM) {
                return Err(SealmailError::protocol("unsupported checksum algorithm"));
            }
            // `value=` is the canonical attribute name; `sum=` is accepted
            // from older writers.
            message.checksum_hex = attributes
                .get("value")
                .or_else(|| attributes.get("sum"))
                .cloned()
                .unwrap_or_default();
            message.checksum_order = attributes.get("order").cloned().unwrap_or_default();
        }

        HEADER_MESSAGE_SIGNATURE => {
            let attributes = parse_attributes(value);
            if attributes.get("algorithm").map(String::as_str) != Some(SIGNING_ALGORITHM) {
                return Err(SealmailError::protocol("unsupported signing algorithm"));
            }
            message.signature_b64 = attributes
                .get("value")
                .or_else(|| attributes.get("data"))
                .cloned()
                .unwrap_or_default();
        }

        HEADER_MESSAGE_ENCRYPTION => {
            message.payload_cipher = Some(CipherDescriptor::from_header(value)?);
        }

        _ => return Ok(false),
    }
    Ok(true)
}

/// Parses envelope text into a message.
pub fn parse_envelope_text(data: &str) -> Result<Message> {
    let mut message = Message {
        is_broadcast: true,
        ..Default::default()
    };
    let mut envelope_lines = Vec::new();

    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(HEADER_KEY_VALUE_SEPARATOR) else {
            continue;
        };
        if assign_envelope_header(key, value, &mut message)? {
            envelope_lines.push(header_line(&key.trim().to_lowercase(), value.trim()));
        }
    }

    if message.id.is_empty() {
        return Err(SealmailError::protocol("envelope has no message id"));
    }
    message.envelope_lines = envelope_lines;
    Ok(message)
}

/// Builds a message from envelope headers received over HTTP. Only the
/// permitted envelope keys are taken; everything else in the header map is
/// transport noise.
pub fn from_header_pairs<'a, I>(pairs: I) -> Result<Message>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut message = Message {
        is_broadcast: true,
        ..Default::default()
    };
    let mut envelope_lines = Vec::new();

    for (key, value) in pairs {
        if assign_envelope_header(key, value, &mut message)? {
            envelope_lines.push(header_line(&key.trim().to_lowercase(), value.trim()));
        }
    }

    if message.id.is_empty() {
        return Err(SealmailError::protocol("bad message data"));
    }
    message.envelope_lines = envelope_lines;
    Ok(message)
}

/// Parses the decrypted (or decoded) content headers block into the
/// message content, then reconciles disclosed reader addresses against the
/// access-list links.
pub fn parse_content_headers(message: &mut Message, content_headers: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(content_headers)
        .map_err(|_| SealmailError::protocol("content headers are not UTF-8"))?;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(HEADER_KEY_VALUE_SEPARATOR) else {
            continue;
        };
        let value = value.trim();

        match key.trim().to_lowercase().as_str() {
            HEADER_CONTENT_MESSAGE_ID => {
                message.content.id = value.to_string();
                if message.id.is_empty() && valid_message_id(value) {
                    message.id = value.to_string();
                }
            }

            HEADER_CONTENT_AUTHOR => {
                message.content.author = value.to_lowercase();
                if message.author_address.is_empty() {
                    message.author_address = message.content.author.clone();
                }
            }

            HEADER_CONTENT_DATE => message.content.date = Some(util::parse_rfc3339(value)?),

            HEADER_CONTENT_SIZE => {
                message.content.size = value
                    .parse()
                    .map_err(|_| SealmailError::protocol("bad content size"))?;
            }

            HEADER_CONTENT_CHECKSUM => {
                let attributes = parse_attributes(value);
                if attributes.get("algorithm").map(String::as_str) != Some(CHECKSUM_ALGORITHM) {
                    return Err(SealmailError::protocol("unsupported checksum algorithm"));
                }
                message.content.checksum = attributes
                    .get("value")
                    .or_else(|| attributes.get("sum"))
                    .cloned()
                    .unwrap_or_default();
            }

            HEADER_CONTENT_FILE => {
                let attributes = parse_attributes(value);
                let mut file = FileAttachment {
                    name: attributes
                        .get("name")
                        .cloned()
                        .unwrap_or_else(|| "unnamed-file".to_string()),
                    mime_type: attributes.get("type").cloned().unwrap_or_default(),
                    ..Default::default()
                };
                if let Some(modified) = attributes.get("modified") {
                    file.modified_at = Some(util::parse_rfc3339(modified)?);
                }
                message.content.file = Some(file);
            }

            HEADER_CONTENT_SUBJECT => message.content.subject = value.to_string(),
            HEADER_CONTENT_SUBJECT_ID => message.content.subject_id = value.to_string(),
            HEADER_CONTENT_PARENT_MESSAGE_ID => {
                message.content.parent_message_id = value.to_string()
            }
            HEADER_CONTENT_CATEGORY => message.content.category = Category::parse(value)?,
            HEADER_CONTENT_READERS => message.content.readers = value.to_string(),

            other => warn!(key = other, "unknown content header key"),
        }
    }

    reconcile_disclosed_readers(message);
    Ok(())
}

/// Matches disclosed reader addresses to access-list entries by link, so an
/// opener learns which address hides behind each sealed entry.
fn reconcile_disclosed_readers(message: &mut Message) {
    if message.content.readers.is_empty() {
        return;
    }
    let disclosed: Vec<&str> = message
        .content
        .readers
        .split(READERS_ADDRESS_SEPARATOR)
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .collect();

    if !message.is_broadcast && disclosed.len() != message.readers.len() {
        warn!(
            disclosed = disclosed.len(),
            access_entries = message.readers.len(),
            "disclosed readers do not match access list"
        );
    }

    for address in disclosed {
        let address_link = link::link(address, &message.author_address);
        for reader in &mut message.readers {
            if reader.link == address_link {
                reader.address = address.to_lowercase();
                break;
            }
        }
    }
}

/// Renders stored envelope lines back into the file form.
pub fn envelope_text(message: &Message) -> String {
    let mut text = message.envelope_lines.join("\n");
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attributes() {
        let attributes = parse_attributes("Algorithm=sha256; value=abc ; order=a:b");
        assert_eq!(attributes["algorithm"], "sha256");
        assert_eq!(attributes["value"], "abc");
        assert_eq!(attributes["order"], "a:b");
    }

    #[test]
    fn test_access_line_roundtrip() {
        let reader = Reader {
            address: String::new(),
            link: "ab".repeat(32),
            signing_fingerprint: "cd".repeat(32),
            encryption_fingerprint: "ef".repeat(32),
            public_encryption_key: None,
            sealed_key: "c2VhbGVk".to_string(),
        };
        let line = envelope_access_line(&reader);
        let parsed = parse_envelope_access_line(&line).unwrap();
        assert_eq!(parsed.link, reader.link);
        assert_eq!(parsed.signing_fingerprint, reader.signing_fingerprint);
        assert_eq!(parsed.encryption_fingerprint, reader.encryption_fingerprint);
        assert_eq!(parsed.sealed_key, reader.sealed_key);
    }

    #[test]
    fn test_access_line_rejects_foreign_algorithm() {
        let line = "link=aa; access-key=bb; value=cc; algorithm=rsa; key=dd";
        assert!(parse_envelope_access_line(line).is_none());
    }

    #[test]
    fn test_checksum_accepts_sum_and_value() {
        for attribute in ["value", "sum"] {
            let mut message = Message::default();
            let header = format!("algorithm=sha256; order=message-id; {attribute}=deadbeef");
            assign_envelope_header(HEADER_MESSAGE_CHECKSUM, &header, &mut message).unwrap();
            assert_eq!(message.checksum_hex, "deadbeef");
            assert_eq!(message.checksum_order, "message-id");
        }
    }

    #[test]
    fn test_checksum_rejects_unknown_algorithm() {
        let mut message = Message::default();
        assert!(assign_envelope_header(
            HEADER_MESSAGE_CHECKSUM,
            "algorithm=md5; value=deadbeef",
            &mut message
        )
        .is_err());
    }

    #[test]
    fn test_parse_envelope_text_requires_id() {
        assert!(parse_envelope_text("message-stream: news\n").is_err());

        let message =
            parse_envelope_text(&format!("# comment\nmessage-id: {}\n", "a".repeat(64))).unwrap();
        assert_eq!(message.id, "a".repeat(64));
        assert!(message.is_broadcast);
        assert_eq!(message.envelope_lines.len(), 1);
    }

    #[test]
    fn test_from_header_pairs_ignores_transport_headers() {
        let id = "b".repeat(64);
        let message = from_header_pairs([
            ("Content-Type", "text/plain"),
            ("Message-Id", id.as_str()),
            ("User-Agent", "tests"),
        ])
        .unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.envelope_lines.len(), 1);
    }

    #[test]
    fn test_parse_content_headers() {
        let mut message = Message {
            author_address: "a@x.test".to_string(),
            id: "c".repeat(64),
            ..Default::default()
        };
        let block = [
            format!("id: {}", "c".repeat(64)),
            "author: a@x.test".to_string(),
            "date: 2024-06-01T10:00:00Z".to_string(),
            "size: 5".to_string(),
            format!("checksum: algorithm=sha256; value={}", "0".repeat(64)),
            "category: personal".to_string(),
            "subject: Hi".to_string(),
        ]
        .join("\n");

        parse_content_headers(&mut message, block.as_bytes()).unwrap();
        assert_eq!(message.content.size, 5);
        assert_eq!(message.content.subject, "Hi");
        assert_eq!(message.content.category, Category::Personal);
        assert_eq!(message.content.checksum, "0".repeat(64));
    }

    #[test]
    fn test_parse_content_headers_rejects_bad_category() {
        let mut message = Message::default();
        assert!(parse_content_headers(&mut message, b"category: junkmail").is_err());
    }

    #[test]
    fn test_access_list_contains() {
        let link_value = "ab".repeat(32);
        let fingerprint = "cd".repeat(32);
        let envelope = format!(
            "message-id: {}\nmessage-access: link={}; access-key={}; value=eA==; \
             algorithm=curve25519xsalsa20poly1305; key={}\n",
            "a".repeat(64),
            link_value,
            fingerprint,
            "ef".repeat(32),
        );

        assert!(access_list_contains(&envelope, &link_value, &fingerprint));
        assert!(!access_list_contains(&envelope, &link_value, &"9".repeat(64)));
        assert!(!access_list_contains(&envelope, &"9".repeat(64), &fingerprint));
    }

    #[test]
    fn test_envelope_has_access_list() {
        let private = "message-id: x\nMessage-Access: link=aa; value=bb\n";
        let broadcast = "message-id: x\nmessage-headers: algorithm=none; value=eA==\n";
        assert!(envelope_has_access_list(private));
        assert!(!envelope_has_access_list(broadcast));
    }
}
