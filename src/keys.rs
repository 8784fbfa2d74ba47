//! Local private key storage.
//!
//! A `KeyStore` owns a directory of per-address key material. Each account
//! keeps four base64 key files named `<address>.<suffix>`:
//!
//! - `encrypt.public` / `encrypt.private` — X25519 pair (32/32 bytes)
//! - `sign.public` / `sign.private` — Ed25519 pair (32-byte public, 64-byte
//!   private keypair form)
//!
//! Rotated-out keys keep the same suffixes with `.previous` appended.
//! Private material never leaves this directory; nothing in the wire
//! protocol transmits it.

use crate::address::Address;
use crate::crypto;
use crate::error::{Result, SealmailError};
use std::fs;
use std::path::{Path, PathBuf};

const PUBLIC_ENCRYPTION_KEY_SUFFIX: &str = "encrypt.public";
const PRIVATE_ENCRYPTION_KEY_SUFFIX: &str = "encrypt.private";
const PUBLIC_SIGNING_KEY_SUFFIX: &str = "sign.public";
const PRIVATE_SIGNING_KEY_SUFFIX: &str = "sign.private";
const PREVIOUS_KEY_SUFFIX: &str = ".previous";

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Directory of local private key material, one set of files per address.
#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    /// Opens a key store rooted at `root`. The directory is created on the
    /// first write, not here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, address: &Address, suffix: &str) -> PathBuf {
        self.root.join(format!("{}.{}", address.as_str(), suffix))
    }

    fn read_key(&self, address: &Address, suffix: &str) -> Result<String> {
        let path = self.key_path(address, suffix);
        let data = fs::read_to_string(&path).map_err(|e| {
            SealmailError::key(format!("no local key {}: {e}", path.display()))
        })?;
        Ok(data.trim().to_string())
    }

    fn write_key(&self, address: &Address, suffix: &str, data: &str, overwrite: bool) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.key_path(address, suffix);
        if !overwrite && path.exists() {
            return Err(SealmailError::conflict(format!(
                "key exists already: {}",
                path.display()
            )));
        }
        fs::write(&path, data)?;
        Ok(())
    }

    /// Generates and stores a fresh encryption and signing key set for
    /// `address`, then returns the loaded user. Refuses to overwrite
    /// existing keys.
    pub fn generate(&self, address: &Address) -> Result<User> {
        let (encryption_private, encryption_public) = crypto::generate_encryption_keys();
        let (signing_private, signing_public) = crypto::generate_signing_keys();

        self.write_key(
            address,
            PRIVATE_ENCRYPTION_KEY_SUFFIX,
            &BASE64.encode(encryption_private),
            false,
        )?;
        self.write_key(
            address,
            PUBLIC_ENCRYPTION_KEY_SUFFIX,
            &BASE64.encode(encryption_public),
            false,
        )?;
        self.write_key(
            address,
            PRIVATE_SIGNING_KEY_SUFFIX,
            &BASE64.encode(signing_private),
            false,
        )?;
        self.write_key(
            address,
            PUBLIC_SIGNING_KEY_SUFFIX,
            &BASE64.encode(signing_public),
            false,
        )?;

        self.load(address)
    }

    /// Loads a user's full key set from the store.
    pub fn load(&self, address: &Address) -> Result<User> {
        let public_encryption =
            crypto::decode_key32(&self.read_key(address, PUBLIC_ENCRYPTION_KEY_SUFFIX)?)?;
        let private_encryption =
            crypto::decode_key32(&self.read_key(address, PRIVATE_ENCRYPTION_KEY_SUFFIX)?)?;
        let public_signing =
            crypto::decode_key32(&self.read_key(address, PUBLIC_SIGNING_KEY_SUFFIX)?)?;
        let private_signing =
            crypto::decode_key64(&self.read_key(address, PRIVATE_SIGNING_KEY_SUFFIX)?)?;

        Ok(User::new(
            address.clone(),
            public_encryption,
            private_encryption,
            public_signing,
            private_signing,
        ))
    }

    /// Rotates the signing key pair: the current pair moves to the
    /// `.previous` files and a fresh pair takes its place.
    pub fn rotate_signing_keys(&self, address: &Address) -> Result<User> {
        let current_public = self.read_key(address, PUBLIC_SIGNING_KEY_SUFFIX)?;
        let current_private = self.read_key(address, PRIVATE_SIGNING_KEY_SUFFIX)?;
        self.write_key(
            address,
            &format!("{PUBLIC_SIGNING_KEY_SUFFIX}{PREVIOUS_KEY_SUFFIX}"),
            &current_public,
            true,
        )?;
        self.write_key(
            address,
            &format!("{PRIVATE_SIGNING_KEY_SUFFIX}{PREVIOUS_KEY_SUFFIX}"),
            &current_private,
            true,
        )?;

        let (signing_private, signing_public) = crypto::generate_signing_keys();
        self.write_key(
            address,
            PRIVATE_SIGNING_KEY_SUFFIX,
            &BASE64.encode(signing_private),
            true,
        )?;
        self.write_key(
            address,
            PUBLIC_SIGNING_KEY_SUFFIX,
            &BASE64.encode(signing_public),
            true,
        )?;

        self.load(address)
    }

    /// Loads the rotated-out public signing key, if any.
    pub fn previous_public_signing_key(&self, address: &Address) -> Result<Option<[u8; 32]>> {
        let suffix = format!("{PUBLIC_SIGNING_KEY_SUFFIX}{PREVIOUS_KEY_SUFFIX}");
        if !self.key_path(address, &suffix).exists() {
            return Ok(None);
        }
        Ok(Some(crypto::decode_key32(&self.read_key(address, &suffix)?)?))
    }
}

/// A local account with its full key material and derived fingerprints.
///
/// Private halves are zeroized on drop and only reachable through
/// accessors, so a `User` can be passed around without leaking them into
/// logs or serialized forms.
#[derive(zeroize::ZeroizeOnDrop)]
pub struct User {
    #[zeroize(skip)]
    address: Address,

    #[zeroize(skip)]
    public_encryption: [u8; 32],
    private_encryption: [u8; 32],
    #[zeroize(skip)]
    public_signing: [u8; 32],
    private_signing: [u8; 64],

    #[zeroize(skip)]
    encryption_fingerprint: String,
    #[zeroize(skip)]
    signing_fingerprint: String,
}

impl User {
    /// Assembles a user from raw key material, deriving fingerprints.
    pub fn new(
        address: Address,
        public_encryption: [u8; 32],
        private_encryption: [u8; 32],
        public_signing: [u8; 32],
        private_signing: [u8; 64],
    ) -> Self {
        let encryption_fingerprint = crypto::fingerprint(&public_encryption);
        let signing_fingerprint = crypto::fingerprint(&public_signing);
        Self {
            address,
            public_encryption,
            private_encryption,
            public_signing,
            private_signing,
            encryption_fingerprint,
            signing_fingerprint,
        }
    }

    /// Generates an ephemeral user with fresh keys, not backed by a store.
    pub fn generate(address: Address) -> Self {
        let (private_encryption, public_encryption) = crypto::generate_encryption_keys();
        let (private_signing, public_signing) = crypto::generate_signing_keys();
        Self::new(
            address,
            public_encryption,
            private_encryption,
            public_signing,
            private_signing,
        )
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_encryption_key(&self) -> &[u8; 32] {
        &self.public_encryption
    }

    pub fn private_encryption_key(&self) -> &[u8; 32] {
        &self.private_encryption
    }

    pub fn public_signing_key(&self) -> &[u8; 32] {
        &self.public_signing
    }

    pub fn private_signing_key(&self) -> &[u8; 64] {
        &self.private_signing
    }

    pub fn encryption_fingerprint(&self) -> &str {
        &self.encryption_fingerprint
    }

    pub fn signing_fingerprint(&self) -> &str {
        &self.signing_fingerprint
    }

    /// Base64 form of the public signing key, as carried in nonce tokens
    /// and profiles.
    pub fn public_signing_key_b64(&self) -> String {
        BASE64.encode(self.public_signing)
    }

    /// Base64 form of the public encryption key, as carried in profiles.
    pub fn public_encryption_key_b64(&self) -> String {
        BASE64.encode(self.public_encryption)
    }

    /// This user's self-link.
    pub fn self_link(&self) -> String {
        crate::link::self_link(self.address.as_str())
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("address", &self.address)
            .field("encryption_fingerprint", &self.encryption_fingerprint)
            .field("signing_fingerprint", &self.signing_fingerprint)
            .finish()
    }
}
