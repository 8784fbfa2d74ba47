//! The mail host HTTP surface.
//!
//! Two configurable path prefixes split the API: the public prefix serves
//! discovery, profiles and message fetches (authenticated where the route
//! says so), the private prefix serves account management and message
//! storage for the account owner. Handlers translate typed errors onto
//! plain status responses; detail goes to the log, never to the client.

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, head, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::SealmailError;
use crate::message::{self, headers as message_headers};
use crate::store::Store;
use crate::{PRIVATE_API_PREFIX, PROVISION_API_PREFIX, PUBLIC_API_PREFIX};

pub mod auth;
pub mod private;
pub mod public;

/// Mail host configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public API path prefix.
    pub public_prefix: String,
    /// Private API path prefix.
    pub private_prefix: String,
    /// Provisioning API path prefix.
    pub provision_prefix: String,

    /// Hostname served in the well-known delegation file.
    pub mail_hostname: String,
    /// Domains this host will provision new accounts for; empty disables
    /// the provisioning endpoint.
    pub provisioning_domains: Vec<String>,

    /// Per-message payload cap in bytes.
    pub max_message_size: u64,
    /// Per-account home directory cap in bytes.
    pub max_home_dir_size: u64,
    /// Profile text cap in bytes.
    pub max_profile_size: u64,
    /// Profile image cap in bytes.
    pub max_image_size: u64,

    /// Age after which notification records are swept.
    pub notification_max_age: std::time::Duration,
    /// Message retention window; `None` keeps messages forever.
    pub message_retention: Option<std::time::Duration>,

    /// Cache lifetime for profile responses, in seconds.
    pub cache_max_age: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_prefix: PUBLIC_API_PREFIX.to_string(),
            private_prefix: PRIVATE_API_PREFIX.to_string(),
            provision_prefix: PROVISION_API_PREFIX.to_string(),
            mail_hostname: String::new(),
            provisioning_domains: Vec::new(),
            max_message_size: 64 * 1024 * 1024,
            max_home_dir_size: 512 * 1024 * 1024,
            max_profile_size: 64 * 1024,
            max_image_size: 1024 * 1024,
            notification_max_age: std::time::Duration::from_secs(30 * 24 * 3600),
            message_retention: None,
            cache_max_age: 3600,
        }
    }
}

/// Shared handler state: the store and the configuration.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(store: Store, config: ServerConfig) -> Self {
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }
}

/// Error wrapper that renders as a bare status response.
///
/// Client mistakes log at debug, internal failures at error; the response
/// body is only the canonical reason so the surface never leaks whether a
/// failure was "not found" for absence or for lack of authorization beyond
/// the chosen status.
#[derive(Debug)]
pub struct ApiError(pub SealmailError);

impl From<SealmailError> for ApiError {
    fn from(error: SealmailError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SealmailError::Protocol(_)
            | SealmailError::Address(_)
            | SealmailError::Profile(_)
            | SealmailError::Key(_) => StatusCode::BAD_REQUEST,
            SealmailError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SealmailError::Forbidden(_) => StatusCode::FORBIDDEN,
            SealmailError::NotFound(_) => StatusCode::NOT_FOUND,
            SealmailError::Conflict(_) => StatusCode::CONFLICT,
            SealmailError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, status = %status, "request rejected");
        }

        let reason = status.canonical_reason().unwrap_or("Error");
        (status, reason.to_string()).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Builds the full router over the given state.
pub fn router(state: AppState) -> Router {
    let public = state.config.public_prefix.clone();
    let private = state.config.private_prefix.clone();
    let provision = state.config.provision_prefix.clone();
    let provisioning_enabled = !state.config.provisioning_domains.is_empty();

    let mut app = Router::new()
        .route("/.well-known/mail.txt", get(public::well_known))
        // Delegation checks.
        .route(&format!("/{public}/:domain"), get(public::check_domain))
        .route(
            &format!("/{public}/:domain/:user"),
            get(public::check_account),
        )
        // Contact information.
        .route(
            &format!("/{public}/:domain/:user/profile"),
            get(public::get_profile),
        )
        .route(
            &format!("/{public}/:domain/:user/image"),
            get(public::get_profile_image),
        )
        // Broadcast messages.
        .route(
            &format!("/{public}/:domain/:user/messages"),
            get(public::list_broadcast_messages),
        )
        .route(
            &format!("/{public}/:domain/:user/streams/:stream/messages"),
            get(public::list_broadcast_stream_messages),
        )
        .route(
            &format!("/{public}/:domain/:user/messages/:messageid"),
            get(public::get_broadcast_message),
        )
        // Private (link) messages, caller-authenticated.
        .route(
            &format!("/{public}/:domain/:user/link/:link/messages"),
            get(public::list_link_messages),
        )
        .route(
            &format!("/{public}/:domain/:user/link/:link/streams/:stream/messages"),
            get(public::list_link_stream_messages),
        )
        .route(
            &format!("/{public}/:domain/:user/link/:link/messages/:messageid"),
            get(public::get_link_message),
        )
        // Notifications, caller-authenticated.
        .route(
            &format!("/{public}/:domain/:user/link/:link/notifications"),
            head(public::write_notification),
        )
        // Private API, owner-authenticated.
        .route(
            &format!("/{private}/:domain/:user"),
            head(private::query_profile_access),
        )
        .route(
            &format!("/{private}/:domain/:user/notifications"),
            get(private::get_notifications),
        )
        .route(
            &format!("/{private}/:domain/:user/profile"),
            put(private::set_profile),
        )
        .route(
            &format!("/{private}/:domain/:user/image"),
            put(private::set_profile_image),
        )
        .route(
            &format!("/{private}/:domain/:user/links"),
            get(private::list_links),
        )
        .route(
            &format!("/{private}/:domain/:user/links/:link"),
            put(private::store_link).delete(private::delete_link),
        )
        .route(
            &format!("/{private}/:domain/:user/messages"),
            get(private::get_messages_status).post(private::store_message),
        )
        .route(
            &format!("/{private}/:domain/:user/messages/:mid"),
            delete(private::delete_message),
        );

    if provisioning_enabled {
        app = app.route(
            &format!("/{provision}/:domain/:user"),
            post(private::provision_account),
        );
    }

    app.layer(DefaultBodyLimit::max(
        state.config.max_message_size as usize,
    ))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Turns stored envelope text into response headers, passing only the
/// permitted envelope keys.
pub(crate) fn envelope_response_headers(envelope_text: &str) -> ApiResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in envelope_text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        if !message::PERMITTED_ENVELOPE_KEYS.contains(&key.as_str()) {
            continue;
        }
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| SealmailError::store("unencodable envelope header"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| SealmailError::store("unencodable envelope header"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Builds a message from request headers, taking only permitted envelope
/// keys.
pub(crate) fn envelope_from_request_headers(
    headers: &HeaderMap,
) -> crate::error::Result<message::Message> {
    let pairs: Vec<(&str, &str)> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)))
        .collect();
    message_headers::from_header_pairs(pairs)
}

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Renders a timestamp in HTTP date format.
pub(crate) fn http_date(time: std::time::SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

/// Parses an HTTP date header value.
pub(crate) fn parse_http_date(value: &str) -> Option<std::time::SystemTime> {
    let parsed = chrono::NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT).ok()?;
    Some(std::time::SystemTime::from(parsed.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_statuses() {
        let cases = [
            (SealmailError::protocol("x"), StatusCode::BAD_REQUEST),
            (SealmailError::unauthorized("x"), StatusCode::UNAUTHORIZED),
            (SealmailError::forbidden("x"), StatusCode::FORBIDDEN),
            (SealmailError::not_found("x"), StatusCode::NOT_FOUND),
            (SealmailError::conflict("x"), StatusCode::CONFLICT),
            (
                SealmailError::too_large("x"),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                SealmailError::crypto("x"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_envelope_response_headers_filters_keys() {
        let envelope = format!(
            "message-id: {}\nx-internal: nope\nmessage-checksum: algorithm=sha256; value=ab\n",
            "a".repeat(64)
        );
        let headers = envelope_response_headers(&envelope).unwrap();
        assert!(headers.contains_key("message-id"));
        assert!(headers.contains_key("message-checksum"));
        assert!(!headers.contains_key("x-internal"));
    }

    #[test]
    fn test_http_date_roundtrip() {
        let now = std::time::SystemTime::now();
        let rendered = http_date(now);
        let parsed = parse_http_date(&rendered).unwrap();
        let delta = now
            .duration_since(parsed)
            .unwrap_or_else(|e| e.duration());
        assert!(delta.as_secs() <= 1);
    }
}
