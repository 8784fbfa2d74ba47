//! Cryptographic primitives for the sealed-envelope mail protocol.
//!
//! This module provides the fixed cipher suite the wire format names:
//!
//! - **SHA-256**: checksums and key fingerprints
//! - **Ed25519**: envelope and nonce signatures
//! - **NaCl sealed box** (curve25519xsalsa20poly1305): anonymous sealing of
//!   per-message access keys to reader encryption keys
//! - **XChaCha20-Poly1305**: symmetric sealing of content headers and
//!   in-memory payloads
//! - **Secret-stream XChaCha20-Poly1305**: chunked file payloads
//!
//! Algorithm identifiers are used verbatim in header attributes, so the
//! constants below are wire-level contract, not presentation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Result, SealmailError};

pub mod cipher;
pub mod secretstream;

pub use cipher::CipherDescriptor;

/// Checksum algorithm identifier, as written in header attributes.
pub const CHECKSUM_ALGORITHM: &str = "sha256";
/// Signing algorithm identifier.
pub const SIGNING_ALGORITHM: &str = "ed25519";
/// Anonymous sealed-box algorithm identifier.
pub const ANONYMOUS_ENCRYPTION_CIPHER: &str = "curve25519xsalsa20poly1305";
/// Symmetric single-shot cipher identifier.
pub const SYMMETRIC_CIPHER: &str = "xchacha20poly1305";
/// Symmetric streaming cipher identifier for file payloads.
pub const SYMMETRIC_FILE_CIPHER: &str = "secretstream_xchacha20poly1305";

/// XChaCha20-Poly1305 nonce length prepended to single-shot ciphertexts.
const AEAD_NONCE_LEN: usize = 24;

/// Default chunk size for streaming file encryption.
pub const DEFAULT_CHUNK_SIZE: u64 = 8192;
/// Protocol ceiling on the streaming chunk size.
pub const MAX_CHUNK_SIZE: u64 = 1_048_576;

/// Byte sizes and checksums observed while sealing or opening a payload.
///
/// The input side always describes what was read, the output side what was
/// written; checksums are hex SHA-256. The opening pipeline compares the
/// plaintext-side checksum against the one bound in the signed content
/// headers.
#[derive(Debug, Clone)]
pub struct IoSummary {
    pub input_size: u64,
    pub input_checksum: String,
    pub output_size: u64,
    pub output_checksum: String,
}

/// Asserts that a cryptographically secure PRNG is available.
///
/// Startup invariant: a host without working OS entropy must not serve.
/// Panics rather than returning an error, mirroring the fail-fast contract.
pub fn assert_prng() {
    let mut buf = [0u8; 1];
    OsRng.fill_bytes(&mut buf);
}

/// Returns `n` securely generated random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Returns a securely generated random alphanumeric token of length `n`.
pub fn random_token(n: usize) -> String {
    const LETTERS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    (0..n)
        .map(|_| LETTERS[OsRng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// SHA-256 of `content` as a hex string plus the raw digest bytes.
pub fn sha256(content: &[u8]) -> (String, [u8; 32]) {
    let digest: [u8; 32] = Sha256::digest(content).into();
    (hex::encode(digest), digest)
}

/// Protocol checksum; an alias for [`sha256`] kept for call-site clarity.
pub fn checksum(content: &[u8]) -> (String, [u8; 32]) {
    sha256(content)
}

/// Hex SHA-256 fingerprint of a raw public key.
pub fn fingerprint(key: &[u8]) -> String {
    sha256(key).0
}

/// Decodes a base64 string into a 32-byte key.
pub fn decode_key32(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| SealmailError::key(format!("bad base64 key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| SealmailError::key("key is not 32 bytes"))
}

/// Decodes a base64 string into a 64-byte key.
pub fn decode_key64(encoded: &str) -> Result<[u8; 64]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| SealmailError::key(format!("bad base64 key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| SealmailError::key("key is not 64 bytes"))
}

/// Generates an X25519 encryption key pair, returned as (private, public).
pub fn generate_encryption_keys() -> ([u8; 32], [u8; 32]) {
    let secret = crypto_box::SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    (secret.to_bytes(), *public.as_bytes())
}

/// Generates an Ed25519 signing key pair, returned as
/// (64-byte private keypair form, 32-byte public).
pub fn generate_signing_keys() -> ([u8; 64], [u8; 32]) {
    let signing = SigningKey::generate(&mut OsRng);
    (signing.to_keypair_bytes(), signing.verifying_key().to_bytes())
}

/// Signs `data` with the 64-byte private signing key; returns the detached
/// Ed25519 signature, base64 encoded.
pub fn sign(private_key: &[u8; 64], data: &[u8]) -> Result<String> {
    let signing = SigningKey::from_keypair_bytes(private_key)
        .map_err(|e| SealmailError::key(format!("bad signing key pair: {e}")))?;
    Ok(BASE64.encode(signing.sign(data).to_bytes()))
}

/// Verifies a base64 Ed25519 signature over `data` against a raw 32-byte
/// public signing key. Any decoding failure counts as verification failure.
pub fn verify(public_key: &[u8; 32], signature_b64: &str, data: &[u8]) -> bool {
    let Ok(sig_bytes) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let Ok(verifying) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    verifying.verify(data, &signature).is_ok()
}

/// Anonymously seals `data` to a raw X25519 public key; returns base64.
///
/// The construction is the NaCl sealed box: an ephemeral key pair is
/// generated per call, so the sender cannot be identified from the
/// ciphertext.
pub fn seal_anonymous(public_key: &[u8; 32], data: &[u8]) -> Result<String> {
    let public = crypto_box::PublicKey::from(*public_key);
    let sealed = public
        .seal(&mut OsRng, data)
        .map_err(|_| SealmailError::crypto("anonymous seal failed"))?;
    Ok(BASE64.encode(sealed))
}

/// Opens a base64 anonymous sealed box with the matching private key.
pub fn open_anonymous(private_key: &[u8; 32], sealed_b64: &str) -> Result<Vec<u8>> {
    let sealed = BASE64
        .decode(sealed_b64.trim())
        .map_err(|e| SealmailError::crypto(format!("bad sealed data: {e}")))?;
    let secret = crypto_box::SecretKey::from(*private_key);
    secret
        .unseal(&sealed)
        .map_err(|_| SealmailError::crypto("anonymous open failed"))
}

/// Seals `plaintext` with XChaCha20-Poly1305 under a 32-byte key.
///
/// The random 24-byte nonce is prepended to the ciphertext.
pub fn aead_seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let aead = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| SealmailError::crypto("symmetric key is not 32 bytes"))?;
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = aead
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealmailError::crypto("symmetric seal failed"))?;
    let mut out = Vec::with_capacity(AEAD_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens an XChaCha20-Poly1305 ciphertext produced by [`aead_seal`].
pub fn aead_open(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < AEAD_NONCE_LEN {
        return Err(SealmailError::crypto("ciphertext too short"));
    }
    let aead = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| SealmailError::crypto("symmetric key is not 32 bytes"))?;
    let (nonce, ciphertext) = data.split_at(AEAD_NONCE_LEN);
    aead.decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealmailError::crypto("symmetric open failed"))
}

/// Decodes base64 and opens the result with [`aead_open`].
pub fn aead_open_b64(key: &[u8], data_b64: &str) -> Result<Vec<u8>> {
    let data = BASE64
        .decode(data_b64.trim())
        .map_err(|e| SealmailError::crypto(format!("bad base64 ciphertext: {e}")))?;
    aead_open(key, &data)
}

/// Decrypts a single-shot sealed payload file to `dst`.
///
/// Returns sizes and checksums of both sides; the output checksum is the
/// plaintext SHA-256 the caller compares against the signed content headers.
pub fn aead_open_file(src: &Path, dst: &Path, key: &[u8]) -> Result<IoSummary> {
    let ciphertext = fs::read(src)?;
    let (cipher_sum, _) = sha256(&ciphertext);
    let plaintext = aead_open(key, &ciphertext)?;
    let (plain_sum, _) = sha256(&plaintext);
    fs::write(dst, &plaintext)?;
    Ok(IoSummary {
        input_size: ciphertext.len() as u64,
        input_checksum: cipher_sum,
        output_size: plaintext.len() as u64,
        output_checksum: plain_sum,
    })
}

/// Copies `src` to `dst` in chunks, hashing the content during the pass.
///
/// Used for plaintext broadcast payloads, where the copy doubles as the
/// checksum computation.
pub fn copy_hashed(src: &Path, dst: &Path) -> Result<IoSummary> {
    let mut source = fs::File::open(src)?;
    let mut dest = fs::File::create(dst)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DEFAULT_CHUNK_SIZE as usize];
    let mut size: u64 = 0;

    loop {
        let n = source.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        dest.write_all(&buffer[..n])?;
        size += n as u64;
    }

    let sum = hex::encode(hasher.finalize());
    Ok(IoSummary {
        input_size: size,
        input_checksum: sum.clone(),
        output_size: size,
        output_checksum: sum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_charset() {
        let token = random_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_token(32), random_token(32));
    }

    #[test]
    fn test_sha256_known_vector() {
        let (hex_sum, raw) = sha256(b"hello");
        assert_eq!(
            hex_sum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(hex::encode(raw), hex_sum);
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let (_, public) = generate_encryption_keys();
        let fp = fingerprint(&public);
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, sha256(&public).0);
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let (private, public) = generate_signing_keys();
        let signature = sign(&private, b"payload").unwrap();
        assert!(verify(&public, &signature, b"payload"));
        assert!(!verify(&public, &signature, b"tampered"));

        let (_, other_public) = generate_signing_keys();
        assert!(!verify(&other_public, &signature, b"payload"));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let (_, public) = generate_signing_keys();
        assert!(!verify(&public, "not base64!", b"payload"));
        assert!(!verify(&public, "QUJD", b"payload"));
    }

    #[test]
    fn test_anonymous_seal_roundtrip() {
        let (private, public) = generate_encryption_keys();
        let sealed = seal_anonymous(&public, b"access key material").unwrap();
        let opened = open_anonymous(&private, &sealed).unwrap();
        assert_eq!(opened, b"access key material");
    }

    #[test]
    fn test_anonymous_open_wrong_key_fails() {
        let (_, public) = generate_encryption_keys();
        let (other_private, _) = generate_encryption_keys();
        let sealed = seal_anonymous(&public, b"secret").unwrap();
        assert!(open_anonymous(&other_private, &sealed).is_err());
    }

    #[test]
    fn test_aead_roundtrip() {
        let key = random_bytes(32);
        let sealed = aead_seal(&key, b"content headers").unwrap();
        assert_eq!(sealed.len(), 24 + b"content headers".len() + 16);
        assert_eq!(aead_open(&key, &sealed).unwrap(), b"content headers");
    }

    #[test]
    fn test_aead_tamper_fails() {
        let key = random_bytes(32);
        let mut sealed = aead_seal(&key, b"content").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(aead_open(&key, &sealed).is_err());
    }

    #[test]
    fn test_aead_short_ciphertext() {
        let key = random_bytes(32);
        assert!(aead_open(&key, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_copy_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"hello").unwrap();

        let summary = copy_hashed(&src, &dst).unwrap();
        assert_eq!(summary.input_size, 5);
        assert_eq!(summary.output_checksum, sha256(b"hello").0);
        assert_eq!(fs::read(&dst).unwrap(), b"hello");
    }
}
