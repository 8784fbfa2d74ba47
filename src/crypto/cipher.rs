//! Payload cipher descriptor carried in the `Message-Encryption` header.

use crate::crypto::{MAX_CHUNK_SIZE, SYMMETRIC_CIPHER, SYMMETRIC_FILE_CIPHER};
use crate::error::{Result, SealmailError};
use crate::message::headers::parse_attributes;

const ALGORITHM_ATTRIBUTE: &str = "algorithm";
const CHUNK_SIZE_ATTRIBUTE: &str = "chunk-size";

/// Describes how a private payload is sealed: which symmetric cipher, and
/// for the streaming cipher, the chunk size both sides must agree on.
///
/// The header value round-trips verbatim: the original text participates in
/// the envelope checksum, so it is retained alongside the parsed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherDescriptor {
    pub algorithm: String,
    pub stream: bool,
    pub chunk_size: u64,

    /// Header value as received, empty when locally constructed.
    pub original_header_value: String,
}

impl CipherDescriptor {
    /// Descriptor for single-shot in-memory payloads.
    pub fn single_shot() -> Self {
        Self {
            algorithm: SYMMETRIC_CIPHER.to_string(),
            stream: false,
            chunk_size: 0,
            original_header_value: String::new(),
        }
    }

    /// Descriptor for chunked streaming file payloads.
    pub fn streaming(chunk_size: u64) -> Self {
        Self {
            algorithm: SYMMETRIC_FILE_CIPHER.to_string(),
            stream: true,
            chunk_size,
            original_header_value: String::new(),
        }
    }

    /// Renders the descriptor as a header attribute string.
    ///
    /// Returns an empty string for an incomplete streaming descriptor; an
    /// envelope must never carry a stream cipher without its chunk size.
    pub fn to_header(&self) -> String {
        if self.stream {
            if self.algorithm.is_empty() || self.chunk_size == 0 {
                return String::new();
            }
            return format!(
                "{}={}; {}={}",
                ALGORITHM_ATTRIBUTE, self.algorithm, CHUNK_SIZE_ATTRIBUTE, self.chunk_size
            );
        }
        format!("{}={}", ALGORITHM_ATTRIBUTE, self.algorithm)
    }

    /// Parses a `Message-Encryption` header value.
    ///
    /// Unknown algorithms and chunk sizes above the protocol ceiling are
    /// protocol errors.
    pub fn from_header(header_value: &str) -> Result<Self> {
        let mut descriptor = CipherDescriptor {
            algorithm: String::new(),
            stream: false,
            chunk_size: 0,
            original_header_value: header_value.to_string(),
        };

        for (key, value) in parse_attributes(header_value) {
            match key.as_str() {
                CHUNK_SIZE_ATTRIBUTE => {
                    let size: u64 = value
                        .parse()
                        .map_err(|_| SealmailError::protocol("bad chunk size"))?;
                    if size > MAX_CHUNK_SIZE {
                        return Err(SealmailError::protocol("unacceptable chunk size"));
                    }
                    descriptor.chunk_size = size;
                }
                ALGORITHM_ATTRIBUTE => {
                    let algorithm = value.to_lowercase();
                    if algorithm != SYMMETRIC_CIPHER && algorithm != SYMMETRIC_FILE_CIPHER {
                        return Err(SealmailError::protocol(format!(
                            "unsupported encryption algorithm: {algorithm}"
                        )));
                    }
                    descriptor.stream = algorithm == SYMMETRIC_FILE_CIPHER;
                    descriptor.algorithm = algorithm;
                }
                _ => continue,
            }
        }
        Ok(descriptor)
    }
}
