//! Chunked streaming encryption for file payloads.
//!
//! Secret-stream XChaCha20-Poly1305: a random 24-byte stream header is
//! written before any ciphertext; every chunk carries a one-byte tag sealed
//! inside the AEAD envelope, and the final chunk is tagged `Final` so a
//! truncated stream cannot pass for a complete one. Per-chunk nonces are the
//! first 16 header bytes followed by a little-endian chunk counter, so
//! reordered or replayed chunks fail authentication.
//!
//! Both directions hash the plaintext during the pass and report it in the
//! returned [`IoSummary`]; the opening pipeline compares that hash against
//! the checksum bound in the signed content headers.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::crypto::IoSummary;
use crate::error::{Result, SealmailError};

/// Stream header length in bytes.
pub const HEADER_BYTES: usize = 24;
/// Per-chunk overhead: one tag byte plus the 16-byte Poly1305 tag.
pub const ADDITIONAL_BYTES: usize = 17;

/// Tag for a non-final chunk.
pub const TAG_MESSAGE: u8 = 0;
/// Tag for the last chunk of a stream.
pub const TAG_FINAL: u8 = 3;

/// Encrypting half of a secret stream.
pub struct Encryptor {
    aead: XChaCha20Poly1305,
    nonce_base: [u8; 16],
    counter: u64,
}

impl Encryptor {
    /// Creates an encryptor bound to a stream header and a 32-byte key.
    pub fn new(header: &[u8; HEADER_BYTES], key: &[u8]) -> Result<Self> {
        let aead = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| SealmailError::crypto("stream key is not 32 bytes"))?;
        let mut nonce_base = [0u8; 16];
        nonce_base.copy_from_slice(&header[..16]);
        Ok(Self {
            aead,
            nonce_base,
            counter: 0,
        })
    }

    /// Seals one chunk under the given tag.
    pub fn push(&mut self, plaintext: &[u8], tag: u8) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let mut tagged = Vec::with_capacity(1 + plaintext.len());
        tagged.push(tag);
        tagged.extend_from_slice(plaintext);
        self.aead
            .encrypt(XNonce::from_slice(&nonce), tagged.as_slice())
            .map_err(|_| SealmailError::crypto("stream chunk seal failed"))
    }

    fn next_nonce(&mut self) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[..16].copy_from_slice(&self.nonce_base);
        nonce[16..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        nonce
    }
}

/// Decrypting half of a secret stream.
pub struct Decryptor {
    aead: XChaCha20Poly1305,
    nonce_base: [u8; 16],
    counter: u64,
}

impl Decryptor {
    /// Creates a decryptor bound to a stream header and a 32-byte key.
    pub fn new(header: &[u8; HEADER_BYTES], key: &[u8]) -> Result<Self> {
        let aead = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| SealmailError::crypto("stream key is not 32 bytes"))?;
        let mut nonce_base = [0u8; 16];
        nonce_base.copy_from_slice(&header[..16]);
        Ok(Self {
            aead,
            nonce_base,
            counter: 0,
        })
    }

    /// Opens one chunk, returning its plaintext and tag.
    pub fn pull(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, u8)> {
        let mut nonce = [0u8; 24];
        nonce[..16].copy_from_slice(&self.nonce_base);
        nonce[16..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;

        let tagged = self
            .aead
            .decrypt(XNonce::from_slice(&nonce), ciphertext)
            .map_err(|_| SealmailError::crypto("stream chunk open failed"))?;
        if tagged.is_empty() {
            return Err(SealmailError::crypto("stream chunk missing tag"));
        }
        Ok((tagged[1..].to_vec(), tagged[0]))
    }
}

/// Reads up to `buf.len()` bytes, retrying short reads until EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Encrypts `src` into `dst` as a secret stream with the given chunk size.
///
/// The input summary side carries the plaintext size and SHA-256, the
/// output side the ciphertext size and SHA-256. The last chunk is tagged
/// `Final`; an empty input produces a single empty `Final` chunk so the
/// stream is still explicitly terminated.
pub fn seal_file(src: &Path, dst: &Path, key: &[u8], chunk_size: u64) -> Result<IoSummary> {
    if chunk_size == 0 || chunk_size > crate::crypto::MAX_CHUNK_SIZE {
        return Err(SealmailError::protocol("unacceptable chunk size"));
    }

    let mut source = fs::File::open(src)?;
    let mut dest = fs::File::create(dst)?;

    let mut header = [0u8; HEADER_BYTES];
    OsRng.fill_bytes(&mut header);
    let mut encryptor = Encryptor::new(&header, key)?;

    dest.write_all(&header)?;

    let mut plain_hash = Sha256::new();
    let mut cipher_hash = Sha256::new();
    cipher_hash.update(header);

    let mut input_size: u64 = 0;
    let mut output_size: u64 = HEADER_BYTES as u64;

    // One chunk of lookahead so the final chunk can be tagged before the
    // reader learns the stream has ended.
    let mut current = vec![0u8; chunk_size as usize];
    let mut next = vec![0u8; chunk_size as usize];
    let mut current_len = read_full(&mut source, &mut current)?;

    loop {
        let next_len = read_full(&mut source, &mut next)?;
        let tag = if next_len == 0 { TAG_FINAL } else { TAG_MESSAGE };

        plain_hash.update(&current[..current_len]);
        let sealed = encryptor.push(&current[..current_len], tag)?;
        dest.write_all(&sealed)?;
        cipher_hash.update(&sealed);
        input_size += current_len as u64;
        output_size += sealed.len() as u64;

        if next_len == 0 {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    Ok(IoSummary {
        input_size,
        input_checksum: hex::encode(plain_hash.finalize()),
        output_size,
        output_checksum: hex::encode(cipher_hash.finalize()),
    })
}

/// Decrypts a secret-stream file produced by [`seal_file`].
///
/// The chunk size must match the one declared in the envelope's cipher
/// descriptor. The input summary side carries the ciphertext size and
/// SHA-256, the output side the plaintext size and SHA-256.
pub fn open_file(src: &Path, dst: &Path, key: &[u8], chunk_size: u64) -> Result<IoSummary> {
    if chunk_size == 0 || chunk_size > crate::crypto::MAX_CHUNK_SIZE {
        return Err(SealmailError::protocol("unacceptable chunk size"));
    }

    let mut source = fs::File::open(src)?;
    let mut dest = fs::File::create(dst)?;

    let mut header = [0u8; HEADER_BYTES];
    source.read_exact(&mut header)?;
    let mut decryptor = Decryptor::new(&header, key)?;

    let mut plain_hash = Sha256::new();
    let mut cipher_hash = Sha256::new();
    cipher_hash.update(header);

    let mut input_size: u64 = HEADER_BYTES as u64;
    let mut output_size: u64 = 0;
    let mut buffer = vec![0u8; chunk_size as usize + ADDITIONAL_BYTES];
    let mut saw_final = false;

    loop {
        let n = read_full(&mut source, &mut buffer)?;
        if n == 0 {
            break;
        }
        cipher_hash.update(&buffer[..n]);
        input_size += n as u64;

        let (plaintext, tag) = decryptor.pull(&buffer[..n])?;
        dest.write_all(&plaintext)?;
        plain_hash.update(&plaintext);
        output_size += plaintext.len() as u64;

        if tag == TAG_FINAL {
            saw_final = true;
            break;
        }
    }

    if !saw_final {
        return Err(SealmailError::crypto("stream truncated before final chunk"));
    }

    Ok(IoSummary {
        input_size,
        input_checksum: hex::encode(cipher_hash.finalize()),
        output_size,
        output_checksum: hex::encode(plain_hash.finalize()),
    })
}
