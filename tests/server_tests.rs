//! HTTP surface tests: authentication, replay protection, index
//! filtering, access checks, notifications and provisioning, exercised
//! against the real router over a temporary data root.

use axum::body::Body;
use axum::http::{header::AUTHORIZATION, Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::fs;
use std::path::Path;
use tower::ServiceExt;

use sealmail::address::Address;
use sealmail::keys::User;
use sealmail::link;
use sealmail::message::{Message, ENVELOPE_FILE_NAME, PAYLOAD_FILE_NAME};
use sealmail::nonce::Nonce;
use sealmail::profile::Profile;
use sealmail::server::{router, AppState, ServerConfig};
use sealmail::store::Store;

struct TestHost {
    _data_dir: tempfile::TempDir,
    state: AppState,
    app: Router,
}

impl TestHost {
    fn new() -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            mail_hostname: "mail.x.test".to_string(),
            provisioning_domains: vec!["x.test".to_string()],
            ..ServerConfig::default()
        };
        let state = AppState::new(Store::new(data_dir.path()), config);
        let app = router(state.clone());
        Self {
            _data_dir: data_dir,
            state,
            app,
        }
    }

    /// Creates an account home with a profile for the given user.
    fn create_account(&self, user: &User) -> std::path::PathBuf {
        let home = self
            .state
            .store
            .home_path(user.address().domain(), user.address().local_part());
        fs::create_dir_all(&home).unwrap();
        let profile = Profile::for_user(user, "Test User");
        Store::set_profile(&home, profile.to_text().as_bytes()).unwrap();
        home
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Uploads a sealed message directory through the private API.
    async fn store_message(&self, account: &User, message_dir: &Path) -> StatusCode {
        let envelope_text = fs::read_to_string(message_dir.join(ENVELOPE_FILE_NAME)).unwrap();
        let payload = fs::read(message_dir.join(PAYLOAD_FILE_NAME)).unwrap();

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!(
                "/home/{}/{}/messages",
                account.address().domain(),
                account.address().local_part()
            ))
            .header(AUTHORIZATION, Nonce::for_user(account).unwrap().to_header());
        for line in envelope_text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                builder = builder.header(key.trim(), value.trim());
            }
        }
        let request = builder.body(Body::from(payload)).unwrap();
        self.send(request).await.status()
    }
}

fn test_user(address: &str) -> User {
    User::generate(Address::parse(address).unwrap())
}

fn authed_get(uri: &str, caller: &User) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(AUTHORIZATION, Nonce::for_user(caller).unwrap().to_header())
        .body(Body::empty())
        .unwrap()
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sealed_private_message(
    author: &User,
    reader: &User,
    stream: Option<&str>,
    body: &[u8],
) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut message = Message::new(author);
    message.add_reader_user(reader).unwrap();
    message.set_subject("test").unwrap();
    if let Some(stream) = stream {
        message.set_stream_id(stream).unwrap();
    }
    message.set_plain_content(body);
    message.seal(author, dir.path()).unwrap();
    dir
}

fn sealed_broadcast_message(author: &User, body: &[u8]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut message = Message::new(author);
    message.set_subject("news").unwrap();
    message.set_plain_content(body);
    message.seal(author, dir.path()).unwrap();
    dir
}

#[tokio::test]
async fn test_well_known_and_delegation() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    host.create_account(&alice);

    let response = host
        .send(Request::get("/.well-known/mail.txt").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "mail.x.test\n");

    let response = host
        .send(Request::get("/mail/x.test").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = host
        .send(Request::get("/mail/x.test/a").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = host
        .send(Request::get("/mail/y.test").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = host
        .send(Request::get("/mail/x.test/nobody").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Scenario: the same nonce posted twice to the same account is a replay.
#[tokio::test]
async fn test_nonce_replay_rejected() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    host.create_account(&alice);

    let token = Nonce::for_user(&alice).unwrap().to_header();
    let request = |token: &str| {
        Request::builder()
            .method(Method::GET)
            .uri("/home/x.test/a/messages")
            .header(AUTHORIZATION, token)
            .body(Body::empty())
            .unwrap()
    };

    let first = host.send(request(&token)).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = host.send(request(&token)).await;
    assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_token_is_bad_request() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    host.create_account(&alice);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/home/x.test/a/messages")
        .header(AUTHORIZATION, "SOTN value=onlyavalue")
        .body(Body::empty())
        .unwrap();
    assert_eq!(host.send(request).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_foreign_key_rejected_on_private_api() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    host.create_account(&alice);

    let stranger = test_user("a@x.test");
    let request = authed_get("/home/x.test/a/messages", &stranger);
    assert_eq!(host.send(request).await.status(), StatusCode::UNAUTHORIZED);
}

/// Scenario: two stored messages, one with a stream; the unfiltered link
/// listing returns both, the stream listing only the tagged one.
#[tokio::test]
async fn test_index_filter_by_stream() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    let bob = test_user("b@y.test");
    host.create_account(&alice);

    let with_stream = sealed_private_message(&alice, &bob, Some("news"), b"first");
    let without_stream = sealed_private_message(&alice, &bob, None, b"second");
    assert_eq!(
        host.store_message(&alice, with_stream.path()).await,
        StatusCode::OK
    );
    assert_eq!(
        host.store_message(&alice, without_stream.path()).await,
        StatusCode::OK
    );

    let pair_link = link::link("a@x.test", "b@y.test");

    let all = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{pair_link}/messages"),
            &bob,
        ))
        .await;
    assert_eq!(all.status(), StatusCode::OK);
    let all_ids = body_text(all).await;
    assert_eq!(all_ids.lines().count(), 2);

    let filtered = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{pair_link}/streams/news/messages"),
            &bob,
        ))
        .await;
    assert_eq!(filtered.status(), StatusCode::OK);
    let filtered_ids = body_text(filtered).await;
    assert_eq!(filtered_ids.lines().count(), 1);
    assert!(all_ids.contains(filtered_ids.trim()));
}

/// Scenario: a caller outside the access list gets 401 on the individual
/// fetch even if it guesses the message id.
#[tokio::test]
async fn test_access_probe_rejected() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    let bob = test_user("b@y.test");
    let carol = test_user("c@z.test");
    host.create_account(&alice);

    let message_dir = sealed_private_message(&alice, &bob, None, b"for bob");
    assert_eq!(
        host.store_message(&alice, message_dir.path()).await,
        StatusCode::OK
    );

    let bob_link = link::link("a@x.test", "b@y.test");
    let listing = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{bob_link}/messages"),
            &bob,
        ))
        .await;
    let message_id = body_text(listing).await.trim().to_string();
    assert!(!message_id.is_empty());

    // Carol authenticates fine but is not in the access list.
    let carol_link = link::link("a@x.test", "c@z.test");
    let probe = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{carol_link}/messages/{message_id}"),
            &carol,
        ))
        .await;
    assert_eq!(probe.status(), StatusCode::UNAUTHORIZED);

    // So is Carol pretending to sit behind Bob's link.
    let probe = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{bob_link}/messages/{message_id}"),
            &carol,
        ))
        .await;
    assert_eq!(probe.status(), StatusCode::UNAUTHORIZED);
}

/// The legitimate reader fetches the message with the envelope as
/// response headers, and the access gets logged.
#[tokio::test]
async fn test_link_message_fetch_and_access_log() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    let bob = test_user("b@y.test");
    let home = host.create_account(&alice);

    let message_dir = sealed_private_message(&alice, &bob, None, b"hello bob");
    assert_eq!(
        host.store_message(&alice, message_dir.path()).await,
        StatusCode::OK
    );

    let pair_link = link::link("a@x.test", "b@y.test");
    let listing = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{pair_link}/messages"),
            &bob,
        ))
        .await;
    let message_id = body_text(listing).await.trim().to_string();

    let fetch = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{pair_link}/messages/{message_id}"),
            &bob,
        ))
        .await;
    assert_eq!(fetch.status(), StatusCode::OK);
    assert!(fetch.headers().contains_key("message-id"));
    assert!(fetch.headers().contains_key("message-access"));
    assert!(fetch.headers().contains_key("message-signature"));

    let access_log =
        fs::read_to_string(Store::access_log_path(&home, &message_id)).unwrap();
    assert!(access_log.starts_with(&format!("{pair_link},")));
}

/// Broadcast flow: list without authentication, fetch plaintext payload.
#[tokio::test]
async fn test_broadcast_list_and_fetch() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    host.create_account(&alice);

    let message_dir = sealed_broadcast_message(&alice, b"to the world");
    assert_eq!(
        host.store_message(&alice, message_dir.path()).await,
        StatusCode::OK
    );

    let listing = host
        .send(Request::get("/mail/x.test/a/messages").body(Body::empty()).unwrap())
        .await;
    assert_eq!(listing.status(), StatusCode::OK);
    let message_id = body_text(listing).await.trim().to_string();
    assert!(!message_id.is_empty());

    let fetch = host
        .send(
            Request::get(format!("/mail/x.test/a/messages/{message_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(fetch.status(), StatusCode::OK);
    assert!(fetch.headers().contains_key("message-id"));
    assert_eq!(body_text(fetch).await, "to the world");
}

/// An envelope with an access list never leaves through the broadcast
/// route, whatever the index says.
#[tokio::test]
async fn test_broadcast_refuses_private_envelope() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    let bob = test_user("b@y.test");
    let home = host.create_account(&alice);

    let message_dir = sealed_private_message(&alice, &bob, None, b"private");
    assert_eq!(
        host.store_message(&alice, message_dir.path()).await,
        StatusCode::OK
    );

    // Force a broadcast index entry by filesystem means.
    let pair_link = link::link("a@x.test", "b@y.test");
    let listing = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{pair_link}/messages"),
            &bob,
        ))
        .await;
    let message_id = body_text(listing).await.trim().to_string();
    host.state
        .store
        .write_index_entry(&home, "", "", "", &message_id)
        .unwrap();

    let fetch = host
        .send(
            Request::get(format!("/mail/x.test/a/messages/{message_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(fetch.status(), StatusCode::NOT_FOUND);
}

/// Duplicate message ids are a conflict; deletion removes the message and
/// its index entries.
#[tokio::test]
async fn test_store_conflict_and_delete() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    let bob = test_user("b@y.test");
    host.create_account(&alice);

    let message_dir = sealed_private_message(&alice, &bob, None, b"once");
    assert_eq!(
        host.store_message(&alice, message_dir.path()).await,
        StatusCode::OK
    );
    assert_eq!(
        host.store_message(&alice, message_dir.path()).await,
        StatusCode::CONFLICT
    );

    let pair_link = link::link("a@x.test", "b@y.test");
    let listing = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{pair_link}/messages"),
            &bob,
        ))
        .await;
    let message_id = body_text(listing).await.trim().to_string();

    let delete = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/home/x.test/a/messages/{message_id}"))
        .header(AUTHORIZATION, Nonce::for_user(&alice).unwrap().to_header())
        .body(Body::empty())
        .unwrap();
    assert_eq!(host.send(delete).await.status(), StatusCode::OK);

    let listing = host
        .send(authed_get(
            &format!("/mail/x.test/a/link/{pair_link}/messages"),
            &bob,
        ))
        .await;
    assert_eq!(body_text(listing).await.trim(), "");
}

/// Oversize stores are refused before anything lands on disk.
#[tokio::test]
async fn test_store_rejects_oversize_message() {
    let data_dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        mail_hostname: "mail.x.test".to_string(),
        max_message_size: 128,
        ..ServerConfig::default()
    };
    let state = AppState::new(Store::new(data_dir.path()), config);
    let app = router(state.clone());

    let alice = test_user("a@x.test");
    let home = state.store.home_path("x.test", "a");
    fs::create_dir_all(&home).unwrap();
    Store::set_profile(&home, Profile::for_user(&alice, "A").to_text().as_bytes()).unwrap();

    let message_dir = sealed_broadcast_message(&alice, &[0x42; 4096]);
    let envelope_text =
        fs::read_to_string(message_dir.path().join(ENVELOPE_FILE_NAME)).unwrap();
    let payload = fs::read(message_dir.path().join(PAYLOAD_FILE_NAME)).unwrap();

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/home/x.test/a/messages")
        .header(AUTHORIZATION, Nonce::for_user(&alice).unwrap().to_header());
    for line in envelope_text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            builder = builder.header(key.trim(), value.trim());
        }
    }
    let response = app
        .oneshot(builder.body(Body::from(payload)).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let store_dir = Store::messages_path(&home);
    let leftover = fs::read_dir(&store_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

/// Profile serving honors If-Modified-Since; uploads replace the profile.
#[tokio::test]
async fn test_profile_roundtrip_over_http() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    host.create_account(&alice);

    let first = host
        .send(Request::get("/mail/x.test/a/profile").body(Body::empty()).unwrap())
        .await;
    assert_eq!(first.status(), StatusCode::OK);
    let last_modified = first.headers()["last-modified"].to_str().unwrap().to_string();
    assert!(first.headers().contains_key("cache-control"));
    assert!(first.headers().contains_key("expires"));

    let conditional = host
        .send(
            Request::get("/mail/x.test/a/profile")
                .header("if-modified-since", &last_modified)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);

    // Replace the profile through the private API.
    let mut profile = Profile::for_user(&alice, "Alice Renamed");
    profile.is_away = true;
    let put = Request::builder()
        .method(Method::PUT)
        .uri("/home/x.test/a/profile")
        .header(AUTHORIZATION, Nonce::for_user(&alice).unwrap().to_header())
        .body(Body::from(profile.to_text()))
        .unwrap();
    assert_eq!(host.send(put).await.status(), StatusCode::OK);

    let refreshed = host
        .send(Request::get("/mail/x.test/a/profile").body(Body::empty()).unwrap())
        .await;
    let text = body_text(refreshed).await;
    assert!(text.contains("Alice Renamed"));
}

/// Notifications: contacts (or anyone, when the profile is public) leave
/// a sealed knock; 202 signals an away recipient; non-contacts are
/// refused on a closed profile.
#[tokio::test]
async fn test_notifications() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    let bob = test_user("b@y.test");
    let home = host.create_account(&alice);

    let pair_link = link::link("a@x.test", "b@y.test");
    let alice_profile = Profile::for_user(&alice, "Alice");
    let sealed_origin = sealmail::crypto::seal_anonymous(
        alice.public_encryption_key(),
        b"b@y.test",
    )
    .unwrap();
    let origin_header = format!(
        "algorithm=curve25519xsalsa20poly1305; value={sealed_origin}; key={}",
        alice_profile.encryption_fingerprint
    );

    let notify = |token: String, origin: String| {
        Request::builder()
            .method(Method::HEAD)
            .uri(format!("/mail/x.test/a/link/{pair_link}/notifications"))
            .header(AUTHORIZATION, token)
            .header("notification-origin", origin)
            .body(Body::empty())
            .unwrap()
    };

    // Public profile: anyone may knock.
    let response = host
        .send(notify(
            Nonce::for_user(&bob).unwrap().to_header(),
            origin_header.clone(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(Store::notification_exists(&home, &pair_link));

    // Closed profile and no contact entry: refused.
    let mut closed = Profile::for_user(&alice, "Alice");
    closed.public_access = false;
    Store::set_profile(&home, closed.to_text().as_bytes()).unwrap();
    let response = host
        .send(notify(
            Nonce::for_user(&bob).unwrap().to_header(),
            origin_header.clone(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // With the contact link recorded, the knock lands again.
    Store::store_link(&home, &pair_link, b"sealed contact").unwrap();
    let response = host
        .send(notify(
            Nonce::for_user(&bob).unwrap().to_header(),
            origin_header.clone(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Away recipients answer 202.
    let mut away = Profile::for_user(&alice, "Alice");
    away.is_away = true;
    Store::set_profile(&home, away.to_text().as_bytes()).unwrap();
    let response = host
        .send(notify(
            Nonce::for_user(&bob).unwrap().to_header(),
            origin_header.clone(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // The account owner sees the record on the private API.
    let listing = host
        .send(authed_get("/home/x.test/a/notifications", &alice))
        .await;
    let lines = body_text(listing).await;
    assert!(lines.starts_with(&pair_link));
}

/// Contact links CRUD over the private API.
#[tokio::test]
async fn test_links_roundtrip() {
    let host = TestHost::new();
    let alice = test_user("a@x.test");
    host.create_account(&alice);

    let pair_link = link::link("a@x.test", "b@y.test");
    let put = Request::builder()
        .method(Method::PUT)
        .uri(format!("/home/x.test/a/links/{pair_link}"))
        .header(AUTHORIZATION, Nonce::for_user(&alice).unwrap().to_header())
        .body(Body::from("sealed-contact-body"))
        .unwrap();
    assert_eq!(host.send(put).await.status(), StatusCode::OK);

    let listing = host.send(authed_get("/home/x.test/a/links", &alice)).await;
    assert_eq!(body_text(listing).await.trim(), "sealed-contact-body");

    let delete = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/home/x.test/a/links/{pair_link}"))
        .header(AUTHORIZATION, Nonce::for_user(&alice).unwrap().to_header())
        .body(Body::empty())
        .unwrap();
    assert_eq!(host.send(delete).await.status(), StatusCode::OK);

    let listing = host.send(authed_get("/home/x.test/a/links", &alice)).await;
    assert_eq!(body_text(listing).await.trim(), "");
}

/// Provisioning: key-matched profile creates the account once, foreign
/// domains are refused.
#[tokio::test]
async fn test_provisioning() {
    let host = TestHost::new();
    let newcomer = test_user("new@x.test");
    let profile_text = Profile::for_user(&newcomer, "Newcomer").to_text();

    let provision = |user: &User, uri: &str, body: String| {
        Request::builder()
            .method(Method::POST)
            .uri(uri.to_string())
            .header(AUTHORIZATION, Nonce::for_user(user).unwrap().to_header())
            .body(Body::from(body))
            .unwrap()
    };

    let response = host
        .send(provision(&newcomer, "/account/x.test/new", profile_text.clone()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(host.state.store.home_exists("x.test", "new"));

    // Again: the account exists.
    let response = host
        .send(provision(&newcomer, "/account/x.test/new", profile_text.clone()))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // A domain this host does not provision.
    let foreigner = test_user("new@y.test");
    let response = host
        .send(provision(
            &foreigner,
            "/account/y.test/new",
            Profile::for_user(&foreigner, "F").to_text(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A token key that does not match the profile's signing key.
    let impostor = test_user("other@x.test");
    let response = host
        .send(provision(
            &impostor,
            "/account/x.test/other",
            profile_text.clone(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// The previous signing key keeps working on the private API after a
/// rotation that records it in the profile.
#[tokio::test]
async fn test_key_rotation_grace() {
    let host = TestHost::new();
    let old_identity = test_user("a@x.test");
    let new_identity = test_user("a@x.test");
    let home = host
        .state
        .store
        .home_path("x.test", "a");
    fs::create_dir_all(&home).unwrap();

    let mut profile = Profile::for_user(&new_identity, "Alice");
    profile.last_signing_key_b64 = old_identity.public_signing_key_b64();
    profile.last_signing_fingerprint = old_identity.signing_fingerprint().to_string();
    Store::set_profile(&home, profile.to_text().as_bytes()).unwrap();

    let response = host
        .send(authed_get("/home/x.test/a/messages", &old_identity))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = host
        .send(authed_get("/home/x.test/a/messages", &new_identity))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}
