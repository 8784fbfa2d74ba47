//! Request authentication.
//!
//! Every protected route starts by exchanging its nonce token for a typed
//! caller value. The public flavor identifies the caller only by signing
//! fingerprint (the index filter scopes what it may see); the private
//! flavor additionally requires the fingerprint to match the account
//! profile's current or previous signing key. Both record the nonce and
//! kick off the ledger sweep without blocking the request.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Result, SealmailError};
use crate::nonce::Nonce;
use crate::profile::Profile;
use crate::server::AppState;
use crate::store::Store;

/// An authenticated caller on the public API: a signing fingerprint
/// scoped to one account home and one link.
#[derive(Debug)]
pub struct PublicCaller {
    pub domain: String,
    pub user: String,
    pub link: String,
    pub home: PathBuf,
    pub signing_fingerprint: String,
}

/// The authenticated owner of an account on the private API.
#[derive(Debug)]
pub struct PrivateCaller {
    pub domain: String,
    pub user: String,
    pub home: PathBuf,
    pub profile: Profile,
}

/// Parses and verifies the nonce token from the authorization header.
pub fn parse_token(headers: &HeaderMap) -> Result<Nonce> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| SealmailError::protocol("missing authorization header"))?;
    let token = Nonce::from_header(header)?;
    token.verify()?;
    Ok(token)
}

fn check_and_record_nonce(state: &AppState, home: &Path, token: &Nonce) -> Result<()> {
    Store::nonce_is_unique(home, token)?;
    state.store.record_nonce(home, token)?;
    spawn_nonce_sweep(home.to_path_buf());
    Ok(())
}

fn spawn_nonce_sweep(home: PathBuf) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = Store::sweep_nonces(&home) {
            warn!(error = %e, home = %home.display(), "nonce sweep failed");
        }
    });
}

/// Authenticates a caller on the public API.
///
/// The fingerprint is not matched against anything here: possession of a
/// signing key is identity enough, and the index filter decides what that
/// identity may list or fetch.
pub fn authenticate_public(
    state: &AppState,
    headers: &HeaderMap,
    domain: &str,
    user: &str,
    link: &str,
) -> Result<PublicCaller> {
    let token = parse_token(headers)?;

    let domain = domain.trim().to_lowercase();
    let user = user.trim().to_lowercase();
    let link = link.trim().to_lowercase();
    if domain.is_empty() || user.is_empty() || link.is_empty() {
        return Err(SealmailError::protocol("missing path parameters"));
    }

    if !state.store.home_exists(&domain, &user) {
        return Err(SealmailError::not_found(format!("no such account: {user}@{domain}")));
    }
    let home = state.store.home_path(&domain, &user);

    check_and_record_nonce(state, &home, &token)?;

    Ok(PublicCaller {
        domain,
        user,
        link,
        home,
        signing_fingerprint: token.signing_fingerprint,
    })
}

/// Authenticates the account owner on the private API.
///
/// A missing account answers the same as a wrong key, so the private
/// prefix does not leak which accounts exist. The previous signing key
/// from the profile stays acceptable as a rotation grace window.
pub fn authenticate_private(
    state: &AppState,
    headers: &HeaderMap,
    domain: &str,
    user: &str,
) -> Result<PrivateCaller> {
    let token = parse_token(headers)?;

    let domain = domain.trim().to_lowercase();
    let user = user.trim().to_lowercase();
    if domain.is_empty() || user.is_empty() {
        return Err(SealmailError::protocol("missing path parameters"));
    }

    if !state.store.home_exists(&domain, &user) {
        return Err(SealmailError::unauthorized(format!(
            "no such account: {user}@{domain}"
        )));
    }
    let home = state.store.home_path(&domain, &user);

    check_and_record_nonce(state, &home, &token)?;

    let profile = Store::load_profile(&home)?;

    let current_matches = token.signing_fingerprint == profile.signing_fingerprint;
    let last_matches = !profile.last_signing_fingerprint.is_empty()
        && token.signing_fingerprint == profile.last_signing_fingerprint;
    if !current_matches && !last_matches {
        return Err(SealmailError::unauthorized(
            "token key does not match account signing key",
        ));
    }

    Ok(PrivateCaller {
        domain,
        user,
        home,
        profile,
    })
}
