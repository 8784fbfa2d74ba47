//! Private API handlers: owner-authenticated account management, message
//! storage and the provisioning endpoint.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use crate::error::{Result, SealmailError};
use crate::message::{self, valid_message_id, valid_stream_id, Message};
use crate::profile::{self, Profile};
use crate::server::auth::{authenticate_private, parse_token};
use crate::server::{envelope_from_request_headers, ApiResult, AppState};
use crate::store::Store;

/// `HEAD /{private}/:domain/:user` — probe whether the caller's key grants
/// profile access. The authentication is the whole answer.
pub async fn query_profile_access(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    authenticate_private(&state, &headers, &domain, &user)?;
    Ok(StatusCode::OK)
}

/// `GET /{private}/:domain/:user/notifications` — the account's pending
/// notification records; the sealed origins open client-side.
pub async fn get_notifications(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;
    let lines = Store::list_notifications(&caller.home)?;
    Ok(lines_response(lines))
}

/// `PUT /{private}/:domain/:user/profile` — replace the profile. The body
/// must parse as a profile before it is accepted.
pub async fn set_profile(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;
    if body.len() as u64 > state.config.max_profile_size {
        return Err(SealmailError::too_large("profile exceeds size cap").into());
    }
    Profile::parse(&body)?;
    Store::set_profile(&caller.home, &body)?;
    Ok(StatusCode::OK)
}

/// `PUT /{private}/:domain/:user/image` — replace the profile image;
/// only the permitted image formats are stored.
pub async fn set_profile_image(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;
    if body.len() as u64 > state.config.max_image_size {
        return Err(SealmailError::too_large("image exceeds size cap").into());
    }
    if profile::detect_image_type(&body).is_none() {
        return Err(SealmailError::protocol("unpermitted image type").into());
    }
    Store::set_profile_image(&caller.home, &body)?;
    Ok(StatusCode::OK)
}

/// `GET /{private}/:domain/:user/links` — the account's sealed contacts.
pub async fn list_links(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;
    let lines = Store::list_links(&caller.home)?;
    Ok(lines_response(lines))
}

/// `PUT /{private}/:domain/:user/links/:link` — record a contact; the
/// body is the contact address sealed to the account's own key.
pub async fn store_link(
    State(state): State<AppState>,
    Path((domain, user, link_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;
    Store::store_link(&caller.home, &link_id.to_lowercase(), &body)?;
    Ok(StatusCode::OK)
}

/// `DELETE /{private}/:domain/:user/links/:link`.
pub async fn delete_link(
    State(state): State<AppState>,
    Path((domain, user, link_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;
    Store::delete_link(&caller.home, &link_id.to_lowercase())?;
    Ok(StatusCode::OK)
}

/// `GET /{private}/:domain/:user/messages` — per-message status lines
/// with recorded accesses.
pub async fn get_messages_status(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;
    let lines = state.store.messages_status(&caller.home)?;
    Ok(lines_response(lines))
}

/// `POST /{private}/:domain/:user/messages` — store a message: envelope
/// in the request headers, payload in the body.
///
/// The payload lands first, then the envelope, and only once both are
/// durable do the index entries appear; any failure rolls the message
/// directory back so an index entry can never point at a half-written
/// message.
#[instrument(skip(state, headers, body))]
pub async fn store_message(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<StatusCode> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if let Some(length) = content_length {
        if length > state.config.max_message_size {
            return Err(SealmailError::too_large("message exceeds size cap").into());
        }
    }

    // Maybe the user tries to fill up the server.
    let home_size = Store::home_dir_size(&caller.home)?;
    let expected = content_length.unwrap_or(state.config.max_message_size);
    if home_size + expected > state.config.max_home_dir_size {
        info!(home_size, expected, "home directory quota exceeded");
        return Err(SealmailError::too_large("home directory quota exceeded").into());
    }

    let envelope = envelope_from_request_headers(&headers)?;
    if !valid_message_id(&envelope.id) {
        return Err(SealmailError::protocol("unacceptable message id").into());
    }
    if !envelope.stream_id.is_empty() && !valid_stream_id(&envelope.stream_id) {
        return Err(SealmailError::protocol("unacceptable stream id").into());
    }

    if Store::message_exists(&caller.home, &envelope.id) {
        return Err(SealmailError::conflict("duplicate message id").into());
    }
    let message_path = Store::create_message_dir(&caller.home, &envelope.id)?;

    let byte_limit = content_length.unwrap_or(state.config.max_message_size);
    let result = persist_message(&state, &caller.home, &envelope, body, byte_limit).await;
    if let Err(e) = result {
        // Roll the whole directory back; a partial message must not
        // exist. Stale index entries are impossible here because they are
        // written last.
        if let Err(cleanup) = Store::delete_message_dir(&caller.home, &envelope.id) {
            warn!(error = %cleanup, path = %message_path.display(), "failed to remove message dir");
        }
        return Err(e.into());
    }

    info!(message_id = %envelope.id, path = %message_path.display(), "message stored");
    Ok(StatusCode::OK)
}

async fn persist_message(
    state: &AppState,
    home: &std::path::Path,
    envelope: &Message,
    body: Body,
    byte_limit: u64,
) -> Result<()> {
    // Payload first.
    let payload_path = Store::payload_path(home, &envelope.id);
    let mut payload_file = tokio::fs::File::create(&payload_path).await?;
    let mut written: u64 = 0;
    let mut body = body;
    while let Some(frame) = body.frame().await {
        let frame =
            frame.map_err(|e| SealmailError::store(format!("body read failed: {e}")))?;
        if let Some(data) = frame.data_ref() {
            written += data.len() as u64;
            if written > byte_limit {
                return Err(SealmailError::too_large("payload exceeds declared size"));
            }
            payload_file.write_all(data).await?;
        }
    }
    payload_file.flush().await?;
    drop(payload_file);

    // Then the envelope that binds it.
    tokio::fs::write(
        Store::envelope_path(home, &envelope.id),
        message::headers::envelope_text(envelope),
    )
    .await?;

    // Both durable; now the index entries. Broadcast messages get one
    // entry under empty link and fingerprint columns, private messages one
    // per reader.
    if envelope.is_broadcast {
        state
            .store
            .write_index_entry(home, "", "", &envelope.stream_id, &envelope.id)?;
    } else {
        for reader in &envelope.readers {
            state.store.write_index_entry(
                home,
                &reader.link,
                &reader.signing_fingerprint,
                &envelope.stream_id,
                &envelope.id,
            )?;
            info!(link = %reader.link, message_id = %envelope.id, "added message reader");
        }
    }
    Ok(())
}

/// `DELETE /{private}/:domain/:user/messages/:mid`.
pub async fn delete_message(
    State(state): State<AppState>,
    Path((domain, user, message_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let caller = authenticate_private(&state, &headers, &domain, &user)?;
    let message_id = message_id.to_lowercase();

    if !Store::message_exists(&caller.home, &message_id) {
        return Err(SealmailError::not_found(format!("no such message: {message_id}")).into());
    }
    Store::delete_message_dir(&caller.home, &message_id)?;

    if let Err(e) = state.store.remove_message_from_index(&caller.home, &message_id) {
        // Not fatal: the filter pass skips entries without a directory.
        warn!(error = %e, message_id = %message_id, "failed to remove message from index");
    }
    info!(message_id = %message_id, "message removed");
    Ok(StatusCode::OK)
}

/// `POST /{provision}/:domain/:user` — one-shot provisioning of a new
/// account from a minimal profile.
///
/// Only domains this host is configured to provision are accepted, and
/// the nonce's signing key must equal the profile's signing key, so an
/// account can only ever be claimed by the holder of its key.
#[instrument(skip(state, headers, body))]
pub async fn provision_account(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    // There is no account to scope replay against yet; signature
    // verification is the gate.
    let token = parse_token(&headers)?;

    let (domain, user) = (domain.to_lowercase(), user.to_lowercase());
    if domain.is_empty() || user.is_empty() {
        return Err(SealmailError::protocol("missing path parameters").into());
    }

    if !state.config.provisioning_domains.contains(&domain) {
        return Err(SealmailError::forbidden(format!(
            "provisioning not enabled for {domain}"
        ))
        .into());
    }

    if state.store.home_exists(&domain, &user) {
        return Err(SealmailError::conflict("account exists").into());
    }

    if body.len() as u64 > state.config.max_profile_size {
        return Err(SealmailError::too_large("profile exceeds size cap").into());
    }
    let profile = Profile::parse(&body)?;
    if !profile.is_functional() {
        return Err(SealmailError::protocol("profile has no signing key").into());
    }
    if profile.signing_key_b64 != token.signing_key_b64 {
        return Err(SealmailError::protocol(
            "token key does not match profile signing key",
        )
        .into());
    }

    let home = state.store.home_path(&domain, &user);
    std::fs::create_dir_all(&home).map_err(SealmailError::from)?;
    Store::set_profile(&home, &body)?;
    info!(account = %format!("{user}@{domain}"), "account provisioned");
    Ok(StatusCode::OK)
}

fn lines_response(lines: Vec<String>) -> Response {
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}
