//! The signed, sealed message envelope format.
//!
//! A message is an envelope (line-oriented header text, equivalently carried
//! as HTTP headers) plus an opaque payload. Broadcast messages carry
//! base64-only content headers and a plaintext payload; private messages
//! carry a sealed access list, sealed content headers and a sealed payload.
//! The envelope checksum covers the header values in a declared order and
//! the author's signature covers the checksum bytes.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::crypto::{self, CipherDescriptor};
use crate::error::{Result, SealmailError};
use crate::keys::User;
use crate::link;

pub mod headers;
pub mod open;
pub mod seal;

/// Access key length in bytes.
pub const ACCESS_KEY_LENGTH: usize = 32;

/// Envelope file name inside a message directory.
pub const ENVELOPE_FILE_NAME: &str = "envelope";
/// Payload file name inside a message directory.
pub const PAYLOAD_FILE_NAME: &str = "payload";
/// Decrypted content headers file written by opening.
pub const HEADERS_FILE_NAME: &str = "headers";
/// Decrypted body file written by opening a non-file message.
pub const BODY_FILE_NAME: &str = "body";
/// Decrypted file written by opening a file message.
pub const FILE_FILE_NAME: &str = "file";

/// Envelope header names, lowercase on the wire (HTTP header names are
/// case-insensitive; the envelope text form uses the same spelling).
pub const HEADER_MESSAGE_ID: &str = "message-id";
pub const HEADER_MESSAGE_STREAM: &str = "message-stream";
pub const HEADER_MESSAGE_ACCESS: &str = "message-access";
pub const HEADER_MESSAGE_CONTENT_HEADERS: &str = "message-headers";
pub const HEADER_MESSAGE_ENCRYPTION: &str = "message-encryption";
pub const HEADER_MESSAGE_CHECKSUM: &str = "message-checksum";
pub const HEADER_MESSAGE_SIGNATURE: &str = "message-signature";

/// The only header names that cross between envelope text and HTTP
/// carriage; anything else is dropped at the boundary.
pub const PERMITTED_ENVELOPE_KEYS: [&str; 7] = [
    HEADER_MESSAGE_ID,
    HEADER_MESSAGE_STREAM,
    HEADER_MESSAGE_ACCESS,
    HEADER_MESSAGE_CONTENT_HEADERS,
    HEADER_MESSAGE_ENCRYPTION,
    HEADER_MESSAGE_CHECKSUM,
    HEADER_MESSAGE_SIGNATURE,
];

/// Content header keys inside the (possibly sealed) content block.
pub const HEADER_CONTENT_MESSAGE_ID: &str = "id";
pub const HEADER_CONTENT_AUTHOR: &str = "author";
pub const HEADER_CONTENT_DATE: &str = "date";
pub const HEADER_CONTENT_SIZE: &str = "size";
pub const HEADER_CONTENT_CHECKSUM: &str = "checksum";
pub const HEADER_CONTENT_FILE: &str = "file";
pub const HEADER_CONTENT_SUBJECT: &str = "subject";
pub const HEADER_CONTENT_SUBJECT_ID: &str = "subject-id";
pub const HEADER_CONTENT_PARENT_MESSAGE_ID: &str = "parent-message-id";
pub const HEADER_CONTENT_CATEGORY: &str = "category";
pub const HEADER_CONTENT_READERS: &str = "readers";

pub const MESSAGE_ID_MINIMUM_LENGTH: usize = 32;
pub const MESSAGE_ID_MAXIMUM_LENGTH: usize = 128;
pub const MESSAGE_STREAM_MAXIMUM_LENGTH: usize = 128;
pub const MESSAGE_SUBJECT_MAXIMUM_LENGTH: usize = 128;

/// Closed set of message categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Category {
    #[default]
    Personal,
    Chat,
    Transitory,
    Notification,
    Transaction,
    Promotion,
    Letter,
    File,
    Informational,
    Pass,
    Funds,
    EncryptionKey,
    SigningKey,
}

impl Category {
    /// Wire name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Personal => "personal",
            Category::Chat => "chat",
            Category::Transitory => "transitory",
            Category::Notification => "notification",
            Category::Transaction => "transaction",
            Category::Promotion => "promotion",
            Category::Letter => "letter",
            Category::File => "file",
            Category::Informational => "informational",
            Category::Pass => "pass",
            Category::Funds => "funds",
            Category::EncryptionKey => "encryption-key",
            Category::SigningKey => "signing-key",
        }
    }

    /// Parses a wire category name.
    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value.trim().to_lowercase().as_str() {
            "personal" => Category::Personal,
            "chat" => Category::Chat,
            "transitory" => Category::Transitory,
            "notification" => Category::Notification,
            "transaction" => Category::Transaction,
            "promotion" => Category::Promotion,
            "letter" => Category::Letter,
            "file" => Category::File,
            "informational" => Category::Informational,
            "pass" => Category::Pass,
            "funds" => Category::Funds,
            "encryption-key" => Category::EncryptionKey,
            "signing-key" => Category::SigningKey,
            other => {
                return Err(SealmailError::protocol(format!(
                    "unknown message category: {other}"
                )))
            }
        })
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a private message's access list: who may read, identified
/// only by link and key fingerprints, plus the access key sealed to that
/// reader's encryption key.
#[derive(Debug, Clone, Default)]
pub struct Reader {
    /// Disclosed address; empty until reconciled from the content headers.
    pub address: String,
    pub link: String,
    pub signing_fingerprint: String,
    pub encryption_fingerprint: String,
    /// Known at sealing time, absent when parsed from an envelope.
    pub public_encryption_key: Option<[u8; 32]>,
    /// Base64 sealed access key; filled by sealing or envelope parsing.
    pub sealed_key: String,
}

impl Reader {
    /// A reader entry for a local user and a given author, carrying the
    /// public key material needed for sealing.
    pub fn for_user(user: &User, author_address: &str) -> Self {
        Self {
            address: user.address().as_str().to_string(),
            link: link::link(author_address, user.address().as_str()),
            signing_fingerprint: user.signing_fingerprint().to_string(),
            encryption_fingerprint: user.encryption_fingerprint().to_string(),
            public_encryption_key: Some(*user.public_encryption_key()),
            sealed_key: String::new(),
        }
    }
}

/// File attachment metadata for `category=file` messages.
#[derive(Debug, Clone, Default)]
pub struct FileAttachment {
    /// Source path at sealing time; empty for parsed messages.
    pub path: PathBuf,
    pub name: String,
    pub mime_type: String,
    pub modified_at: Option<DateTime<Utc>>,
}

/// The content headers block: signed metadata that travels sealed in
/// private mode, base64-only in broadcast mode.
#[derive(Debug, Clone, Default)]
pub struct Content {
    /// Embedded copy of the envelope message id; mismatch on opening is an
    /// authenticity failure.
    pub id: String,
    pub author: String,
    pub date: Option<DateTime<Utc>>,
    pub subject: String,
    pub subject_id: String,
    pub parent_message_id: String,
    pub category: Category,
    pub size: u64,
    /// Hex SHA-256 of the plaintext payload.
    pub checksum: String,
    pub body: Vec<u8>,
    pub file: Option<FileAttachment>,
    /// Disclosed reader addresses, comma separated, in access-list order.
    pub readers: String,
}

/// A message in any of its states: being authored, parsed from an
/// envelope, or opened.
#[derive(Debug, Default)]
pub struct Message {
    pub id: String,
    pub author_address: String,
    pub is_broadcast: bool,
    pub stream_id: String,
    pub readers: Vec<Reader>,
    pub payload_cipher: Option<CipherDescriptor>,
    pub content: Content,

    /// Per-message symmetric secret; generated when the first reader is
    /// added, recovered from the access list when opening.
    pub(crate) access_key: Option<Vec<u8>>,

    // Raw envelope fields retained for checksum verification.
    pub access_list_raw: String,
    pub content_headers_raw: String,
    pub content_headers_bytes: Vec<u8>,
    pub checksum_hex: String,
    pub checksum_order: String,
    pub signature_b64: String,

    /// Envelope lines as received, used to persist or re-emit verbatim.
    pub envelope_lines: Vec<String>,
}

impl Message {
    /// Starts a new broadcast message for the given author. The author is
    /// always its own first reader; adding any other reader turns the
    /// message private.
    pub fn new(author: &User) -> Self {
        let id = new_message_id(author.address().domain(), author.address().local_part());
        Self {
            id,
            author_address: author.address().as_str().to_string(),
            is_broadcast: true,
            readers: vec![Reader::for_user(author, author.address().as_str())],
            ..Default::default()
        }
    }

    /// True for a file message carrying attachment metadata.
    pub fn is_file(&self) -> bool {
        self.content.category == Category::File
            && self
                .content
                .file
                .as_ref()
                .is_some_and(|file| !file.name.is_empty())
    }

    /// Adds a reader, switching the message to private mode.
    ///
    /// The caller supplies the reader's public encryption key and signing
    /// fingerprint, typically taken from a fetched profile.
    pub fn add_reader(
        &mut self,
        reader_address: &str,
        public_encryption_key: [u8; 32],
        signing_fingerprint: &str,
    ) -> Result<()> {
        self.make_private()?;
        self.readers.push(Reader {
            address: reader_address.trim().to_lowercase(),
            link: link::link(&self.author_address, reader_address),
            signing_fingerprint: signing_fingerprint.to_string(),
            encryption_fingerprint: crypto::fingerprint(&public_encryption_key),
            public_encryption_key: Some(public_encryption_key),
            sealed_key: String::new(),
        });
        Ok(())
    }

    /// Adds a local user as a reader; key material comes from the user's
    /// own key set.
    pub fn add_reader_user(&mut self, user: &User) -> Result<()> {
        self.add_reader(
            user.address().as_str(),
            *user.public_encryption_key(),
            user.signing_fingerprint(),
        )
    }

    fn make_private(&mut self) -> Result<()> {
        self.is_broadcast = false;
        if self.payload_cipher.is_none() {
            self.payload_cipher = Some(if self.is_file() {
                CipherDescriptor::streaming(crypto::DEFAULT_CHUNK_SIZE)
            } else {
                CipherDescriptor::single_shot()
            });
        }
        if self.access_key.is_none() {
            self.access_key = Some(crypto::random_bytes(ACCESS_KEY_LENGTH));
        }
        Ok(())
    }

    /// Assigns a stream id after validation.
    pub fn set_stream_id(&mut self, stream_id: &str) -> Result<()> {
        let stream_id = stream_id.trim();
        if !valid_stream_id(stream_id) {
            return Err(SealmailError::protocol(format!(
                "unacceptable stream id: {stream_id}"
            )));
        }
        self.stream_id = stream_id.to_string();
        Ok(())
    }

    pub fn set_subject(&mut self, subject: &str) -> Result<()> {
        let subject = subject.trim();
        if subject.len() >= MESSAGE_SUBJECT_MAXIMUM_LENGTH {
            return Err(SealmailError::protocol("subject too long"));
        }
        if !subject.is_empty() {
            self.content.subject = subject.to_string();
        }
        Ok(())
    }

    pub fn set_subject_id(&mut self, subject_id: &str) {
        let subject_id = subject_id.trim().to_lowercase();
        if !subject_id.is_empty() {
            self.content.subject_id = subject_id;
        }
    }

    pub fn set_parent_message_id(&mut self, message_id: &str) {
        self.content.parent_message_id = message_id.to_string();
    }

    pub fn set_category(&mut self, category: Category) {
        self.content.category = category;
    }

    /// A subject (or a subject id referencing an existing conversation) is
    /// required when starting a new conversation.
    pub fn subject_required(&self) -> bool {
        self.content.subject.trim().is_empty()
            && (self.content.subject_id.trim().is_empty() || self.content.subject_id == self.id)
    }

    /// Sets an in-memory body as the message content.
    pub fn set_plain_content(&mut self, body: &[u8]) {
        self.content.body = body.to_vec();
        self.content.size = body.len() as u64;
        self.content.checksum = crypto::checksum(body).0;
        self.content.date = Some(Utc::now());
        self.content.subject_id = self.id.clone();
        self.content.parent_message_id = self.id.clone();

        if let Some(cipher) = self.payload_cipher.as_mut() {
            *cipher = CipherDescriptor::single_shot();
        }
    }

    /// Sets a file as the message content. Size and checksum are computed
    /// during sealing, where the file is read anyway.
    pub fn set_file_content(&mut self, path: &std::path::Path) -> Result<()> {
        let metadata = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| SealmailError::protocol("file has no usable name"))?
            .to_string();
        let modified_at = metadata
            .modified()
            .ok()
            .map(|time| DateTime::<Utc>::from(time));

        self.content.file = Some(FileAttachment {
            path: path.to_path_buf(),
            name,
            mime_type: "application/octet-stream".to_string(),
            modified_at,
        });
        self.content.size = metadata.len();
        self.content.date = Some(Utc::now());
        self.content.subject_id = self.id.clone();
        self.content.parent_message_id = self.id.clone();
        // A file payload forces the category and the streaming cipher.
        self.content.category = Category::File;

        if let Some(cipher) = self.payload_cipher.as_mut() {
            *cipher = CipherDescriptor::streaming(crypto::DEFAULT_CHUNK_SIZE);
        }
        Ok(())
    }

    /// The per-message access key, present on private messages after
    /// sealing or opening.
    pub fn access_key(&self) -> Option<&[u8]> {
        self.access_key.as_deref()
    }
}

/// Derives a fresh message id: hex SHA-256 of random material mixed with
/// the author's domain and local part. URL-safe by construction.
pub fn new_message_id(domain: &str, local_part: &str) -> String {
    let random = crypto::random_token(24);
    crypto::sha256(format!("{random}{domain}{local_part}").as_bytes()).0
}

/// Message ids are 32 to 128 alphanumeric characters.
pub fn valid_message_id(message_id: &str) -> bool {
    let message_id = message_id.trim();
    message_id.len() >= MESSAGE_ID_MINIMUM_LENGTH
        && message_id.len() <= MESSAGE_ID_MAXIMUM_LENGTH
        && message_id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Stream ids are 1 to 128 alphanumeric characters.
pub fn valid_stream_id(stream_id: &str) -> bool {
    !stream_id.is_empty()
        && stream_id.len() <= MESSAGE_STREAM_MAXIMUM_LENGTH
        && stream_id.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn test_user(address: &str) -> User {
        User::generate(Address::parse(address).unwrap())
    }

    #[test]
    fn test_new_message_id_shape() {
        let id = new_message_id("x.test", "a");
        assert_eq!(id.len(), 64);
        assert!(valid_message_id(&id));
        assert_ne!(id, new_message_id("x.test", "a"));
    }

    #[test]
    fn test_valid_message_id_bounds() {
        assert!(!valid_message_id(""));
        assert!(!valid_message_id(&"a".repeat(31)));
        assert!(valid_message_id(&"a".repeat(32)));
        assert!(valid_message_id(&"a".repeat(128)));
        assert!(!valid_message_id(&"a".repeat(129)));
        assert!(!valid_message_id(&format!("{}!", "a".repeat(40))));
    }

    #[test]
    fn test_valid_stream_id() {
        assert!(valid_stream_id("news"));
        assert!(!valid_stream_id(""));
        assert!(!valid_stream_id("no spaces"));
        assert!(!valid_stream_id(&"s".repeat(129)));
    }

    #[test]
    fn test_category_roundtrip() {
        for name in [
            "personal",
            "chat",
            "transitory",
            "notification",
            "transaction",
            "promotion",
            "letter",
            "file",
            "informational",
            "pass",
            "funds",
            "encryption-key",
            "signing-key",
        ] {
            assert_eq!(Category::parse(name).unwrap().as_str(), name);
        }
        assert!(Category::parse("spam").is_err());
    }

    #[test]
    fn test_new_message_starts_broadcast_with_self_reader() {
        let author = test_user("a@x.test");
        let message = Message::new(&author);
        assert!(message.is_broadcast);
        assert_eq!(message.readers.len(), 1);
        assert_eq!(message.readers[0].link, author.self_link());
    }

    #[test]
    fn test_add_reader_turns_private() {
        let author = test_user("a@x.test");
        let reader = test_user("b@y.test");
        let mut message = Message::new(&author);
        message.add_reader_user(&reader).unwrap();

        assert!(!message.is_broadcast);
        assert_eq!(message.readers.len(), 2);
        assert!(message.access_key().is_some());
        assert_eq!(
            message.readers[1].link,
            crate::link::link("a@x.test", "b@y.test")
        );
    }

    #[test]
    fn test_subject_required_rule() {
        let author = test_user("a@x.test");
        let mut message = Message::new(&author);
        assert!(message.subject_required());

        message.set_subject_id("f".repeat(32).as_str());
        assert!(!message.subject_required());

        let mut message = Message::new(&author);
        message.set_subject("hello").unwrap();
        assert!(!message.subject_required());
    }

    #[test]
    fn test_set_plain_content_fills_checksum() {
        let author = test_user("a@x.test");
        let mut message = Message::new(&author);
        message.set_plain_content(b"hello");

        assert_eq!(message.content.size, 5);
        assert_eq!(message.content.checksum, crypto::sha256(b"hello").0);
        assert_eq!(message.content.subject_id, message.id);
    }
}
