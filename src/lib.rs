//! # sealmail — federated end-to-end encrypted mail
//!
//! A mail system built around a signed, sealed message envelope and a
//! content-addressed server store:
//!
//! - **Envelopes** bind a message to its author: a checksum over the
//!   header values in a declared order, signed with the author's long-term
//!   Ed25519 key. Private messages carry a per-reader sealed access list;
//!   broadcast messages are world-readable.
//! - **Authentication** is a per-request signed nonce token with replay
//!   detection scoped per account across a two-day window.
//! - **Federation** resolves a mail domain to its hosts through a
//!   well-known text file plus a delegation probe.
//! - **The server store** keeps messages under per-account homes with an
//!   append-only index keyed by `(link, signing-fingerprint, stream)`, and
//!   gates every read and write through authentication and access checks.
//!
//! Two parties are only ever correlated on the wire by their *link*, the
//! hash of the sorted address pair; addresses themselves never travel in
//! the clear when private messaging is used.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sealmail::address::Address;
//! use sealmail::keys::User;
//! use sealmail::message::{open, Message};
//!
//! # fn main() -> sealmail::Result<()> {
//! let author = User::generate(Address::parse("a@x.test")?);
//! let reader = User::generate(Address::parse("b@y.test")?);
//!
//! let mut message = Message::new(&author);
//! message.add_reader_user(&reader)?;
//! message.set_subject("hello")?;
//! message.set_plain_content(b"sealed for b only");
//! message.seal(&author, std::path::Path::new("/tmp/out"))?;
//!
//! let opened = open::open(
//!     std::path::Path::new("/tmp/out"),
//!     author.address(),
//!     author.public_signing_key(),
//!     None,
//!     &reader,
//! )?;
//! assert_eq!(opened.content.body, b"sealed for b only");
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod keys;
pub mod link;
pub mod message;
pub mod nonce;
pub mod profile;
pub mod server;
pub mod store;
pub mod util;

pub use error::{Result, SealmailError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default public API path prefix.
pub const PUBLIC_API_PREFIX: &str = "mail";
/// Default private API path prefix.
pub const PRIVATE_API_PREFIX: &str = "home";
/// Default provisioning API path prefix.
pub const PROVISION_API_PREFIX: &str = "account";

/// Header carrying the sealed origin address of a notification. The
/// signed nonce token travels in the standard `Authorization` header.
pub const NOTIFICATION_ORIGIN_HEADER: &str = "notification-origin";
