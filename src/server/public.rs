//! Public API handlers: delegation checks, profiles, broadcast fetches,
//! link-scoped private fetches and notifications.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{info, instrument, warn};

use crate::error::SealmailError;
use crate::link;
use crate::message::headers as message_headers;
use crate::profile;
use crate::server::auth::authenticate_public;
use crate::server::{
    envelope_response_headers, http_date, parse_http_date, ApiResult, AppState,
};
use crate::store::Store;
use crate::{crypto, NOTIFICATION_ORIGIN_HEADER};

/// `GET /.well-known/mail.txt` — this host's own delegation entry.
pub async fn well_known(State(state): State<AppState>) -> String {
    format!("{}\n", state.config.mail_hostname)
}

/// `HEAD|GET /{public}/:domain` — 200 when the domain is delegated here.
pub async fn check_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<Response> {
    let domain = domain.to_lowercase();
    if !state.store.domain_exists(&domain) {
        return Err(SealmailError::not_found(format!("unknown domain: {domain}")).into());
    }
    Ok((StatusCode::OK, "OK\n").into_response())
}

/// `HEAD|GET /{public}/:domain/:user` — 200 when the account exists.
pub async fn check_account(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (domain, user) = (domain.to_lowercase(), user.to_lowercase());
    if !state.store.home_exists(&domain, &user) {
        return Err(SealmailError::not_found(format!("unknown account: {user}@{domain}")).into());
    }
    Ok((StatusCode::OK, "OK\n").into_response())
}

/// `GET /{public}/:domain/:user/profile` — profile text with cache
/// headers, honoring `If-Modified-Since`.
pub async fn get_profile(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (domain, user) = (domain.to_lowercase(), user.to_lowercase());
    if !state.store.home_exists(&domain, &user) {
        return Err(SealmailError::not_found(format!("unknown account: {user}@{domain}")).into());
    }
    let home = state.store.home_path(&domain, &user);
    serve_cached_file(
        &state,
        &Store::profile_data_path(&home),
        "text/plain; charset=utf-8",
        &headers,
    )
    .await
}

/// `GET /{public}/:domain/:user/image` — optional profile image,
/// restricted to the permitted formats.
pub async fn get_profile_image(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (domain, user) = (domain.to_lowercase(), user.to_lowercase());
    if !state.store.home_exists(&domain, &user) {
        return Err(SealmailError::not_found(format!("unknown account: {user}@{domain}")).into());
    }
    let home = state.store.home_path(&domain, &user);
    let image_path = Store::profile_image_path(&home);

    let data = tokio::fs::read(&image_path)
        .await
        .map_err(|_| SealmailError::not_found("no profile image"))?;
    let Some(mime_type) = profile::detect_image_type(&data) else {
        warn!(user = %user, domain = %domain, "not serving unpermitted profile image type");
        return Err(SealmailError::not_found("no profile image").into());
    };

    serve_cached_file(&state, &image_path, mime_type, &headers).await
}

async fn serve_cached_file(
    state: &AppState,
    path: &std::path::Path,
    content_type: &str,
    request_headers: &HeaderMap,
) -> ApiResult<Response> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| SealmailError::not_found("no such file"))?;
    let modified = metadata.modified().map_err(SealmailError::from)?;

    if let Some(since) = request_headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
    {
        // HTTP dates have second precision; anything within the same
        // second counts as unmodified.
        if modified <= since + std::time::Duration::from_secs(1) {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let data = tokio::fs::read(path)
        .await
        .map_err(SealmailError::from)?;
    let max_age = state.config.cache_max_age;
    let expires = std::time::SystemTime::now() + std::time::Duration::from_secs(max_age);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        content_type.parse().expect("static content type"),
    );
    headers.insert(
        header::LAST_MODIFIED,
        http_date(modified).parse().expect("formatted date"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        format!("public, max-age={max_age}")
            .parse()
            .expect("formatted cache control"),
    );
    headers.insert(
        header::EXPIRES,
        http_date(expires).parse().expect("formatted date"),
    );
    Ok((StatusCode::OK, headers, data).into_response())
}

/// `GET /{public}/:domain/:user/messages` — broadcast listing, one
/// message id per line, no authentication.
pub async fn list_broadcast_messages(
    State(state): State<AppState>,
    Path((domain, user)): Path<(String, String)>,
) -> ApiResult<Response> {
    broadcast_listing(&state, &domain, &user, "")
}

/// `GET /{public}/:domain/:user/streams/:stream/messages`.
pub async fn list_broadcast_stream_messages(
    State(state): State<AppState>,
    Path((domain, user, stream)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    broadcast_listing(&state, &domain, &user, &stream.to_lowercase())
}

fn broadcast_listing(
    state: &AppState,
    domain: &str,
    user: &str,
    stream: &str,
) -> ApiResult<Response> {
    let (domain, user) = (domain.to_lowercase(), user.to_lowercase());
    let home = state.store.home_path(&domain, &user);
    // Broadcast entries are indexed under empty link and fingerprint
    // columns.
    let message_ids = state.store.filter_index(&home, "", "", stream)?;
    Ok(listing_response(message_ids))
}

fn listing_response(message_ids: Vec<String>) -> Response {
    let mut body = message_ids.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

/// `GET /{public}/:domain/:user/messages/:messageid` — an individual
/// broadcast message: envelope as response headers, payload as body.
///
/// An envelope carrying an access list never leaves through this route,
/// whatever the index claims; the authenticated link route is the only
/// door to private messages.
#[instrument(skip(state))]
pub async fn get_broadcast_message(
    State(state): State<AppState>,
    Path((domain, user, message_id)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let (domain, user) = (domain.to_lowercase(), user.to_lowercase());
    let message_id = message_id.to_lowercase();
    if !state.store.home_exists(&domain, &user) {
        return Err(SealmailError::not_found(format!("unknown account: {user}@{domain}")).into());
    }
    let home = state.store.home_path(&domain, &user);

    if !Store::message_exists(&home, &message_id) {
        return Err(SealmailError::not_found(format!("no such message: {message_id}")).into());
    }
    let envelope_text = tokio::fs::read_to_string(Store::envelope_path(&home, &message_id))
        .await
        .map_err(SealmailError::from)?;

    if message_headers::envelope_has_access_list(&envelope_text) {
        return Err(SealmailError::not_found("no such broadcast message").into());
    }

    serve_message(&home, &message_id, &envelope_text).await
}

/// `GET /{public}/:domain/:user/link/:link/messages` — private listing
/// filtered by the caller's link and signing fingerprint.
pub async fn list_link_messages(
    State(state): State<AppState>,
    Path((domain, user, link_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    link_listing(&state, &headers, &domain, &user, &link_id, "")
}

/// `GET /{public}/:domain/:user/link/:link/streams/:stream/messages`.
pub async fn list_link_stream_messages(
    State(state): State<AppState>,
    Path((domain, user, link_id, stream)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    link_listing(&state, &headers, &domain, &user, &link_id, &stream.to_lowercase())
}

fn link_listing(
    state: &AppState,
    headers: &HeaderMap,
    domain: &str,
    user: &str,
    link_id: &str,
    stream: &str,
) -> ApiResult<Response> {
    let caller = authenticate_public(state, headers, domain, user, link_id)?;
    let message_ids = state.store.filter_index(
        &caller.home,
        &caller.link,
        &caller.signing_fingerprint,
        stream,
    )?;
    Ok(listing_response(message_ids))
}

/// `GET /{public}/:domain/:user/link/:link/messages/:messageid` — an
/// individual private message for an authenticated caller.
///
/// Beyond the index, the envelope's own access list must name the
/// caller's `(link, fingerprint)` pair; the two can disagree after manual
/// filesystem surgery, and the envelope wins.
#[instrument(skip(state, headers))]
pub async fn get_link_message(
    State(state): State<AppState>,
    Path((domain, user, link_id, message_id)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let caller = authenticate_public(&state, &headers, &domain, &user, &link_id)?;
    let message_id = message_id.to_lowercase();

    if !Store::message_exists(&caller.home, &message_id) {
        return Err(SealmailError::not_found(format!("no such message: {message_id}")).into());
    }
    let envelope_text = tokio::fs::read_to_string(Store::envelope_path(&caller.home, &message_id))
        .await
        .map_err(SealmailError::from)?;

    if !message_headers::access_list_contains(
        &envelope_text,
        &caller.link,
        &caller.signing_fingerprint,
    ) {
        return Err(SealmailError::unauthorized("caller not in access list").into());
    }

    // The author reading its own mail leaves no trace; everyone else is
    // recorded once per link.
    let self_link = link::self_link(&format!("{}@{}", caller.user, caller.domain));
    if caller.link != self_link {
        Store::log_access(&caller.home, &message_id, &caller.link)?;
    }

    serve_message(&caller.home, &message_id, &envelope_text).await
}

async fn serve_message(
    home: &std::path::Path,
    message_id: &str,
    envelope_text: &str,
) -> ApiResult<Response> {
    let mut headers = envelope_response_headers(envelope_text)?;
    let payload = tokio::fs::read(Store::payload_path(home, message_id))
        .await
        .map_err(SealmailError::from)?;

    headers.insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().expect("static type"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename={}", crate::message::PAYLOAD_FILE_NAME)
            .parse()
            .expect("static disposition"),
    );
    Ok((StatusCode::OK, headers, payload).into_response())
}

/// `HEAD /{public}/:domain/:user/link/:link/notifications` — record that
/// someone behind the link wants the account's attention.
///
/// The origin header carries the notifier's address sealed to the
/// recipient's current encryption key; the server checks the fingerprint
/// so stale seals are refused, but can never read the address itself.
/// Non-contacts are refused unless the profile declares public access.
/// The response distinguishes 202 for an away recipient from plain 200,
/// so clients learn away-status without another round trip.
#[instrument(skip(state, headers))]
pub async fn write_notification(
    State(state): State<AppState>,
    Path((domain, user, link_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let caller = authenticate_public(&state, &headers, &domain, &user, &link_id)?;

    let origin_header = headers
        .get(NOTIFICATION_ORIGIN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| SealmailError::protocol("missing notification origin"))?;
    let attributes = message_headers::parse_attributes(origin_header);
    let algorithm = attributes
        .get("algorithm")
        .ok_or_else(|| SealmailError::protocol("missing origin algorithm"))?;
    let sealed_origin = attributes
        .get("value")
        .ok_or_else(|| SealmailError::protocol("missing origin value"))?;
    let encryption_fingerprint = attributes
        .get("key")
        .ok_or_else(|| SealmailError::protocol("missing origin key fingerprint"))?;

    let profile = Store::load_profile(&caller.home)?;

    if !profile.public_access && !Store::has_link(&caller.home, &caller.link) {
        return Err(SealmailError::forbidden("caller is not a contact").into());
    }

    // The seal must target the recipient's current encryption key.
    if !algorithm.eq_ignore_ascii_case(crypto::ANONYMOUS_ENCRYPTION_CIPHER) {
        return Err(SealmailError::protocol("unsupported origin seal algorithm").into());
    }
    if profile.encryption_fingerprint != *encryption_fingerprint {
        return Err(SealmailError::protocol("origin sealed to a stale key").into());
    }

    Store::store_notification(
        &caller.home,
        &caller.link,
        sealed_origin,
        &caller.signing_fingerprint,
        &profile.encryption_fingerprint,
    )?;
    info!(link = %caller.link, "notification recorded");

    let home = caller.home.clone();
    let max_age = state.config.notification_max_age;
    tokio::task::spawn_blocking(move || {
        if let Err(e) = Store::sweep_notifications(&home, max_age) {
            warn!(error = %e, "notification sweep failed");
        }
    });

    if profile.is_away {
        // 202 tells the notifier the recipient is away.
        return Ok(StatusCode::ACCEPTED.into_response());
    }
    Ok(StatusCode::OK.into_response())
}
