//! The author-side sealing pipeline.
//!
//! Sealing writes the payload first (computing its checksum and size during
//! the pass), then embeds those into the content headers, seals the content
//! headers for private messages, and finally produces the checksummed and
//! signed envelope. The envelope checksum covers the raw header values
//! concatenated in the declared order; the signature covers the raw
//! checksum bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::fs;
use std::path::Path;

use crate::crypto::{self, SYMMETRIC_CIPHER};
use crate::error::{Result, SealmailError};
use crate::keys::User;
use crate::message::headers::{
    self, envelope_access_line, envelope_checksum_header, file_header, header_line,
    signature_header, ACCESS_LIST_SEPARATOR, READERS_ADDRESS_SEPARATOR,
};
use crate::message::*;
use crate::util;

impl Message {
    /// Seals the access key to every reader and renders the access list,
    /// sorted by link so the envelope checksum is reproducible.
    pub fn sealed_access_list(&mut self) -> Result<String> {
        let access_key = self
            .access_key
            .clone()
            .ok_or_else(|| SealmailError::crypto("message has no access key"))?;

        self.readers.sort_by(|a, b| a.link.cmp(&b.link));

        let mut lines = Vec::with_capacity(self.readers.len());
        for reader in &mut self.readers {
            let public_key = reader.public_encryption_key.as_ref().ok_or_else(|| {
                SealmailError::key(format!(
                    "reader {} has no public encryption key",
                    reader.link
                ))
            })?;
            reader.sealed_key = crypto::seal_anonymous(public_key, &access_key)?;
            lines.push(envelope_access_line(reader));
        }
        Ok(lines.join(&format!("{ACCESS_LIST_SEPARATOR} ")))
    }

    /// Renders the content headers block.
    ///
    /// The id and author fields are duplicated from the envelope on
    /// purpose: in private mode they travel sealed, and the opener compares
    /// them against the envelope to detect substitution.
    pub fn embed_content_headers(&self) -> Vec<u8> {
        let date = self.content.date.unwrap_or_else(util::timestamp_now);

        let mut lines = vec![
            header_line(HEADER_CONTENT_MESSAGE_ID, &self.id),
            header_line(HEADER_CONTENT_AUTHOR, &self.author_address),
            header_line(HEADER_CONTENT_DATE, &util::to_rfc3339(&date)),
            header_line(HEADER_CONTENT_SUBJECT, &self.content.subject),
            header_line(HEADER_CONTENT_SUBJECT_ID, &self.content.subject_id),
            header_line(
                HEADER_CONTENT_PARENT_MESSAGE_ID,
                &self.content.parent_message_id,
            ),
            header_line(HEADER_CONTENT_CATEGORY, self.content.category.as_str()),
            header_line(HEADER_CONTENT_SIZE, &self.content.size.to_string()),
            header_line(
                HEADER_CONTENT_CHECKSUM,
                &headers::content_checksum_header(&self.content.checksum),
            ),
        ];

        if self.is_file() {
            if let Some(file) = &self.content.file {
                lines.push(header_line(HEADER_CONTENT_FILE, &file_header(file)));
            }
        }

        if !self.is_broadcast {
            let disclosed: Vec<&str> = self
                .readers
                .iter()
                .map(|reader| reader.address.as_str())
                .collect();
            lines.push(header_line(
                HEADER_CONTENT_READERS,
                &disclosed.join(&format!("{READERS_ADDRESS_SEPARATOR} ")),
            ));
        }

        lines.join("\n").into_bytes()
    }

    /// Writes the payload to `destination`, sealing it for private
    /// messages, and records the plaintext checksum and size.
    pub fn seal_body(&mut self, destination: &Path) -> Result<()> {
        if self.is_broadcast {
            if self.is_file() {
                let path = self.file_source_path()?;
                let summary = crypto::copy_hashed(&path, destination)?;
                self.content.checksum = summary.output_checksum;
                self.content.size = summary.output_size;
            } else {
                fs::write(destination, &self.content.body)?;
            }
            return Ok(());
        }

        let access_key = self
            .access_key
            .clone()
            .ok_or_else(|| SealmailError::crypto("message has no access key"))?;

        if self.is_file() {
            let chunk_size = self
                .payload_cipher
                .as_ref()
                .filter(|cipher| cipher.stream)
                .map(|cipher| cipher.chunk_size)
                .ok_or_else(|| SealmailError::protocol("file message without stream cipher"))?;
            let path = self.file_source_path()?;
            let summary =
                crypto::secretstream::seal_file(&path, destination, &access_key, chunk_size)?;
            self.content.checksum = summary.input_checksum;
            self.content.size = summary.input_size;
            return Ok(());
        }

        // The whole content is sealed in memory.
        let sealed = crypto::aead_seal(&access_key, &self.content.body)?;
        fs::write(destination, sealed)?;
        Ok(())
    }

    fn file_source_path(&self) -> Result<std::path::PathBuf> {
        let file = self
            .content
            .file
            .as_ref()
            .ok_or_else(|| SealmailError::protocol("file message without attachment"))?;
        if file.path.as_os_str().is_empty() {
            return Err(SealmailError::protocol("attachment has no source path"));
        }
        Ok(file.path.clone())
    }

    /// Produces the signed envelope and writes it to `destination`.
    pub fn seal_envelope(&mut self, author: &User, destination: &Path) -> Result<()> {
        // Sort before anything is embedded: the disclosed reader addresses
        // in the content headers must line up with the link-sorted access
        // list so openers can reconcile link and address by position.
        if !self.is_broadcast {
            self.readers.sort_by(|a, b| a.link.cmp(&b.link));
        }

        let mut header_pairs: Vec<(&str, String)> = vec![(HEADER_MESSAGE_ID, self.id.clone())];

        if !self.stream_id.is_empty() {
            header_pairs.push((HEADER_MESSAGE_STREAM, self.stream_id.clone()));
        }

        let content_headers = self.embed_content_headers();
        if self.is_broadcast {
            // Broadcast content headers are only base64 encoded, never
            // encrypted.
            self.content_headers_raw =
                format!("algorithm=none; value={}", BASE64.encode(&content_headers));
        } else {
            // Private messages define who may read through hybrid
            // encryption: a random access key seals the content, and the
            // access list carries that key sealed to each reader.
            let access_list = self.sealed_access_list()?;
            let cipher_header = self
                .payload_cipher
                .as_ref()
                .map(|cipher| cipher.to_header())
                .unwrap_or_default();
            if cipher_header.is_empty() {
                return Err(SealmailError::protocol(
                    "private message without payload cipher",
                ));
            }
            header_pairs.push((HEADER_MESSAGE_ACCESS, access_list.clone()));
            header_pairs.push((HEADER_MESSAGE_ENCRYPTION, cipher_header));
            self.access_list_raw = access_list;

            let access_key = self
                .access_key
                .as_ref()
                .ok_or_else(|| SealmailError::crypto("message has no access key"))?;
            let sealed_headers = crypto::aead_seal(access_key, &content_headers)?;
            self.content_headers_raw = format!(
                "algorithm={SYMMETRIC_CIPHER}; value={}",
                BASE64.encode(sealed_headers)
            );
        }
        self.content_headers_bytes = content_headers;
        header_pairs.push((HEADER_MESSAGE_CONTENT_HEADERS, self.content_headers_raw.clone()));

        let mut envelope_lines = Vec::with_capacity(header_pairs.len() + 2);
        let mut order = Vec::with_capacity(header_pairs.len());
        let mut checksum_input = String::new();
        for (key, value) in &header_pairs {
            envelope_lines.push(header_line(key, value));
            order.push(*key);
            checksum_input.push_str(value);
        }

        // The checksum and its signature come last and are not part of the
        // sum themselves.
        let (checksum_hex, checksum_bytes) = crypto::checksum(checksum_input.as_bytes());
        let signature = crypto::sign(author.private_signing_key(), &checksum_bytes)?;
        let order = order.join(":");

        envelope_lines.push(header_line(
            HEADER_MESSAGE_CHECKSUM,
            &envelope_checksum_header(&checksum_hex, &order),
        ));
        envelope_lines.push(header_line(
            HEADER_MESSAGE_SIGNATURE,
            &signature_header(&signature),
        ));

        self.checksum_hex = checksum_hex;
        self.checksum_order = order;
        self.signature_b64 = signature;
        self.envelope_lines = envelope_lines;

        fs::write(destination, headers::envelope_text(self))?;
        Ok(())
    }

    /// Seals the message into `message_dir`: payload first, then the
    /// envelope that binds it.
    pub fn seal(&mut self, author: &User, message_dir: &Path) -> Result<()> {
        fs::create_dir_all(message_dir)?;
        self.seal_body(&message_dir.join(PAYLOAD_FILE_NAME))?;
        self.seal_envelope(author, &message_dir.join(ENVELOPE_FILE_NAME))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn test_user(address: &str) -> User {
        User::generate(Address::parse(address).unwrap())
    }

    #[test]
    fn test_access_list_is_sorted_by_link() {
        let author = test_user("a@x.test");
        let b = test_user("b@y.test");
        let c = test_user("c@z.test");

        let mut message = Message::new(&author);
        message.add_reader_user(&b).unwrap();
        message.add_reader_user(&c).unwrap();
        message.set_plain_content(b"hi");

        message.sealed_access_list().unwrap();
        let links: Vec<&str> = message
            .readers
            .iter()
            .map(|reader| reader.link.as_str())
            .collect();
        let mut sorted = links.clone();
        sorted.sort();
        assert_eq!(links, sorted);
    }

    #[test]
    fn test_broadcast_envelope_has_no_access_header() {
        let dir = tempfile::tempdir().unwrap();
        let author = test_user("a@x.test");

        let mut message = Message::new(&author);
        message.set_subject("hello").unwrap();
        message.set_plain_content(b"hello");
        message.seal(&author, dir.path()).unwrap();

        let envelope = fs::read_to_string(dir.path().join(ENVELOPE_FILE_NAME)).unwrap();
        assert!(envelope.contains("message-id:"));
        assert!(envelope.contains("algorithm=none"));
        assert!(!envelope.contains("message-access:"));
        assert!(!envelope.contains("message-encryption:"));

        // Broadcast payloads are plaintext.
        let payload = fs::read(dir.path().join(PAYLOAD_FILE_NAME)).unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_private_envelope_carries_access_and_cipher() {
        let dir = tempfile::tempdir().unwrap();
        let author = test_user("a@x.test");
        let reader = test_user("b@y.test");

        let mut message = Message::new(&author);
        message.add_reader_user(&reader).unwrap();
        message.set_subject("secret").unwrap();
        message.set_plain_content(b"secret body");
        message.seal(&author, dir.path()).unwrap();

        let envelope = fs::read_to_string(dir.path().join(ENVELOPE_FILE_NAME)).unwrap();
        assert!(envelope.contains("message-access:"));
        assert!(envelope.contains("message-encryption: algorithm=xchacha20poly1305"));
        assert!(envelope.contains("order=message-id:message-access:message-encryption:message-headers"));

        let payload = fs::read(dir.path().join(PAYLOAD_FILE_NAME)).unwrap();
        assert_ne!(payload, b"secret body");
    }

    #[test]
    fn test_checksum_covers_declared_order() {
        let dir = tempfile::tempdir().unwrap();
        let author = test_user("a@x.test");

        let mut message = Message::new(&author);
        message.set_subject("s").unwrap();
        message.set_plain_content(b"body");
        message.seal(&author, dir.path()).unwrap();

        let expected_input = format!("{}{}", message.id, message.content_headers_raw);
        assert_eq!(
            message.checksum_hex,
            crypto::checksum(expected_input.as_bytes()).0
        );
        assert!(crypto::verify(
            author.public_signing_key(),
            &message.signature_b64,
            &hex::decode(&message.checksum_hex).unwrap(),
        ));
    }
}
