//! Error types for sealmail operations.

use thiserror::Error;

/// Result type alias for sealmail operations.
pub type Result<T> = std::result::Result<T, SealmailError>;

/// Main error type for sealmail operations.
///
/// The HTTP layer maps these onto response status codes; everything not
/// listed in that mapping surfaces as an internal error. Variants carry a
/// message for the server log, never for the client.
#[derive(Error, Debug)]
pub enum SealmailError {
    /// Malformed wire data: bad headers, unparseable envelope, unknown
    /// algorithm, cipher mismatch
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failed authentication or authorization: bad signature, fingerprint
    /// mismatch, caller not in access list, nonce replay
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Operation refused for this caller
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown account, message or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Per-message or per-home storage quota exceeded
    #[error("Too large: {0}")]
    TooLarge(String),

    /// Cryptographic operation failure
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key decoding or key store errors
    #[error("Key error: {0}")]
    Key(String),

    /// Address parsing or validation errors
    #[error("Address error: {0}")]
    Address(String),

    /// Profile parsing or validation errors
    #[error("Profile error: {0}")]
    Profile(String),

    /// Message store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Mail host discovery errors
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SealmailError {
    /// Creates a new protocol error.
    pub fn protocol<T: ToString>(msg: T) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Creates a new unauthorized error.
    pub fn unauthorized<T: ToString>(msg: T) -> Self {
        Self::Unauthorized(msg.to_string())
    }

    /// Creates a new forbidden error.
    pub fn forbidden<T: ToString>(msg: T) -> Self {
        Self::Forbidden(msg.to_string())
    }

    /// Creates a new not-found error.
    pub fn not_found<T: ToString>(msg: T) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Creates a new conflict error.
    pub fn conflict<T: ToString>(msg: T) -> Self {
        Self::Conflict(msg.to_string())
    }

    /// Creates a new too-large error.
    pub fn too_large<T: ToString>(msg: T) -> Self {
        Self::TooLarge(msg.to_string())
    }

    /// Creates a new cryptographic error.
    pub fn crypto<T: ToString>(msg: T) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Creates a new key error.
    pub fn key<T: ToString>(msg: T) -> Self {
        Self::Key(msg.to_string())
    }

    /// Creates a new address error.
    pub fn address<T: ToString>(msg: T) -> Self {
        Self::Address(msg.to_string())
    }

    /// Creates a new profile error.
    pub fn profile<T: ToString>(msg: T) -> Self {
        Self::Profile(msg.to_string())
    }

    /// Creates a new store error.
    pub fn store<T: ToString>(msg: T) -> Self {
        Self::Store(msg.to_string())
    }

    /// Creates a new discovery error.
    pub fn discovery<T: ToString>(msg: T) -> Self {
        Self::Discovery(msg.to_string())
    }
}
