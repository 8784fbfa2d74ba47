//! Federation client operations.
//!
//! `MailClient` speaks the public and private APIs of any mail host:
//! profile fetches, message listing and transfer, contact links,
//! notifications and account provisioning. Hosts are resolved through
//! federation discovery unless a fixed host is forced (tests and
//! single-host deployments). Every authenticated request carries a fresh
//! nonce token; tokens are single-use, so one is built per attempt.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Response, StatusCode};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::address::Address;
use crate::crypto::{self, ANONYMOUS_ENCRYPTION_CIPHER};
use crate::discovery;
use crate::error::{Result, SealmailError};
use crate::keys::User;
use crate::link;
use crate::message::{self, headers as message_headers};
use crate::nonce::Nonce;
use crate::profile::Profile;
use crate::{NOTIFICATION_ORIGIN_HEADER, PRIVATE_API_PREFIX, PROVISION_API_PREFIX, PUBLIC_API_PREFIX};

/// Client for the federated mail APIs.
#[derive(Debug, Clone)]
pub struct MailClient {
    http: reqwest::Client,
    force_host: Option<String>,
}

impl Default for MailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MailClient {
    /// A client that resolves hosts through federation discovery.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            force_host: None,
        }
    }

    /// A client pinned to one host. The host may carry a scheme
    /// (`http://localhost:4000`); without one, https is assumed.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            force_host: Some(host.into()),
        }
    }

    async fn hosts_for(&self, domain: &str) -> Result<Vec<String>> {
        if let Some(host) = &self.force_host {
            return Ok(vec![host.clone()]);
        }
        let hosts = discovery::lookup_mail_hosts(&self.http, domain).await?;
        if hosts.is_empty() {
            return Err(SealmailError::discovery(format!(
                "no mail hosts for {domain}"
            )));
        }
        Ok(hosts)
    }

    fn base_url(host: &str) -> String {
        if host.starts_with("http") {
            host.to_string()
        } else {
            format!("https://{host}")
        }
    }

    /// Sends one request per candidate host until a success status comes
    /// back; the error of the last attempt wins otherwise.
    async fn request(
        &self,
        method: Method,
        domain: &str,
        path: &str,
        token_user: Option<&User>,
        extra_headers: Option<HeaderMap>,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let mut last_error = SealmailError::discovery(format!("no mail hosts for {domain}"));

        for host in self.hosts_for(domain).await? {
            let url = format!("{}{path}", Self::base_url(&host));
            debug!(%url, "trying mail host");

            let mut request = self.http.request(method.clone(), &url);
            if let Some(user) = token_user {
                let token = Nonce::for_user(user)?;
                request = request.header(AUTHORIZATION, token.to_header());
            }
            if let Some(headers) = &extra_headers {
                request = request.headers(headers.clone());
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => last_error = status_error(response.status()),
                Err(e) => last_error = e.into(),
            }
        }
        Err(last_error)
    }

    // Public API -------------------------------------------------------

    /// Fetches and parses a remote profile.
    pub async fn fetch_profile(&self, address: &Address) -> Result<Profile> {
        let path = format!(
            "/{PUBLIC_API_PREFIX}/{}/{}/profile",
            address.domain(),
            address.local_part()
        );
        let response = self
            .request(Method::GET, address.domain(), &path, None, None, None)
            .await?;
        let body = response.bytes().await?;
        let mut profile = Profile::parse(&body)?;
        if profile.address.is_empty() {
            profile.address = address.as_str().to_string();
        }
        Ok(profile)
    }

    /// Fetches a remote profile image, if the account has one.
    pub async fn fetch_profile_image(&self, address: &Address) -> Result<Vec<u8>> {
        let path = format!(
            "/{PUBLIC_API_PREFIX}/{}/{}/image",
            address.domain(),
            address.local_part()
        );
        let response = self
            .request(Method::GET, address.domain(), &path, None, None, None)
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Lists broadcast message ids of a remote author.
    pub async fn list_broadcast_messages(
        &self,
        author: &Address,
        stream: Option<&str>,
    ) -> Result<Vec<String>> {
        let path = match stream {
            Some(stream) => format!(
                "/{PUBLIC_API_PREFIX}/{}/{}/streams/{stream}/messages",
                author.domain(),
                author.local_part()
            ),
            None => format!(
                "/{PUBLIC_API_PREFIX}/{}/{}/messages",
                author.domain(),
                author.local_part()
            ),
        };
        let response = self
            .request(Method::GET, author.domain(), &path, None, None, None)
            .await?;
        Ok(text_lines(&response.text().await?))
    }

    /// Lists private message ids addressed to `caller` by `author`.
    pub async fn list_link_messages(
        &self,
        caller: &User,
        author: &Address,
        stream: Option<&str>,
    ) -> Result<Vec<String>> {
        let caller_link = link::link(caller.address().as_str(), author.as_str());
        let path = match stream {
            Some(stream) => format!(
                "/{PUBLIC_API_PREFIX}/{}/{}/link/{caller_link}/streams/{stream}/messages",
                author.domain(),
                author.local_part()
            ),
            None => format!(
                "/{PUBLIC_API_PREFIX}/{}/{}/link/{caller_link}/messages",
                author.domain(),
                author.local_part()
            ),
        };
        let response = self
            .request(Method::GET, author.domain(), &path, Some(caller), None, None)
            .await?;
        Ok(text_lines(&response.text().await?))
    }

    /// Fetches one private message into `destination_dir/<message-id>/`:
    /// the envelope from the response headers, the payload from the body.
    pub async fn fetch_link_message(
        &self,
        caller: &User,
        author: &Address,
        message_id: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf> {
        if !message::valid_message_id(message_id) {
            return Err(SealmailError::protocol(format!(
                "not a valid message id: {message_id}"
            )));
        }
        let caller_link = link::link(caller.address().as_str(), author.as_str());
        let path = format!(
            "/{PUBLIC_API_PREFIX}/{}/{}/link/{caller_link}/messages/{message_id}",
            author.domain(),
            author.local_part()
        );
        let response = self
            .request(Method::GET, author.domain(), &path, Some(caller), None, None)
            .await?;
        self.save_fetched_message(response, message_id, destination_dir)
            .await
    }

    /// Fetches one broadcast message into `destination_dir/<message-id>/`.
    pub async fn fetch_broadcast_message(
        &self,
        author: &Address,
        message_id: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf> {
        if !message::valid_message_id(message_id) {
            return Err(SealmailError::protocol(format!(
                "not a valid message id: {message_id}"
            )));
        }
        let path = format!(
            "/{PUBLIC_API_PREFIX}/{}/{}/messages/{message_id}",
            author.domain(),
            author.local_part()
        );
        let response = self
            .request(Method::GET, author.domain(), &path, None, None, None)
            .await?;
        self.save_fetched_message(response, message_id, destination_dir)
            .await
    }

    async fn save_fetched_message(
        &self,
        response: Response,
        message_id: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf> {
        let message_dir = destination_dir.join(message_id);
        if message_dir.exists() {
            return Err(SealmailError::conflict(format!(
                "message already fetched: {}",
                message_dir.display()
            )));
        }

        let header_pairs: Vec<(&str, &str)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)))
            .collect();
        let envelope = message_headers::from_header_pairs(header_pairs)?;

        fs::create_dir_all(&message_dir)?;
        fs::write(
            message_dir.join(message::ENVELOPE_FILE_NAME),
            message_headers::envelope_text(&envelope),
        )?;
        let payload = response.bytes().await?;
        fs::write(message_dir.join(message::PAYLOAD_FILE_NAME), &payload)?;
        Ok(message_dir)
    }

    /// Sends a notification to a remote account: the caller's address is
    /// sealed to the recipient's encryption key so only the recipient can
    /// learn who knocked. Returns whether the recipient is away.
    pub async fn notify(
        &self,
        caller: &User,
        recipient: &Address,
        recipient_profile: &Profile,
    ) -> Result<bool> {
        let recipient_key = recipient_profile
            .encryption_key
            .ok_or_else(|| SealmailError::profile("recipient profile has no encryption key"))?;
        let sealed_origin =
            crypto::seal_anonymous(&recipient_key, caller.address().as_str().as_bytes())?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(NOTIFICATION_ORIGIN_HEADER),
            HeaderValue::from_str(&format!(
                "algorithm={ANONYMOUS_ENCRYPTION_CIPHER}; value={sealed_origin}; key={}",
                recipient_profile.encryption_fingerprint
            ))
            .map_err(|_| SealmailError::protocol("unencodable notification header"))?,
        );

        let notification_link = link::link(caller.address().as_str(), recipient.as_str());
        let path = format!(
            "/{PUBLIC_API_PREFIX}/{}/{}/link/{notification_link}/notifications",
            recipient.domain(),
            recipient.local_part()
        );
        let response = self
            .request(
                Method::HEAD,
                recipient.domain(),
                &path,
                Some(caller),
                Some(headers),
                None,
            )
            .await?;
        Ok(response.status() == StatusCode::ACCEPTED)
    }

    // Private API ------------------------------------------------------

    /// Fetches the account's message status lines.
    pub async fn messages_status(&self, account: &User) -> Result<Vec<String>> {
        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/messages",
            account.address().domain(),
            account.address().local_part()
        );
        let response = self
            .request(
                Method::GET,
                account.address().domain(),
                &path,
                Some(account),
                None,
                None,
            )
            .await?;
        Ok(text_lines(&response.text().await?))
    }

    /// Uploads a sealed message directory to the account's own server:
    /// envelope as request headers, payload as body.
    pub async fn store_message(&self, account: &User, message_dir: &Path) -> Result<()> {
        let envelope_text =
            fs::read_to_string(message_dir.join(message::ENVELOPE_FILE_NAME))?;
        let envelope = message_headers::parse_envelope_text(&envelope_text)?;
        let payload = fs::read(message_dir.join(message::PAYLOAD_FILE_NAME))?;

        let mut headers = HeaderMap::new();
        for line in &envelope.envelope_lines {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let name = HeaderName::from_bytes(key.trim().as_bytes())
                .map_err(|_| SealmailError::protocol("unencodable envelope header"))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| SealmailError::protocol("unencodable envelope header"))?;
            headers.insert(name, value);
        }

        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/messages",
            account.address().domain(),
            account.address().local_part()
        );
        self.request(
            Method::POST,
            account.address().domain(),
            &path,
            Some(account),
            Some(headers),
            Some(payload),
        )
        .await?;
        Ok(())
    }

    /// Deletes one of the account's stored messages.
    pub async fn delete_message(&self, account: &User, message_id: &str) -> Result<()> {
        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/messages/{message_id}",
            account.address().domain(),
            account.address().local_part()
        );
        self.request(
            Method::DELETE,
            account.address().domain(),
            &path,
            Some(account),
            None,
            None,
        )
        .await?;
        Ok(())
    }

    /// Replaces the account's profile.
    pub async fn put_profile(&self, account: &User, profile_text: &str) -> Result<()> {
        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/profile",
            account.address().domain(),
            account.address().local_part()
        );
        self.request(
            Method::PUT,
            account.address().domain(),
            &path,
            Some(account),
            None,
            Some(profile_text.as_bytes().to_vec()),
        )
        .await?;
        Ok(())
    }

    /// Replaces the account's profile image.
    pub async fn put_profile_image(&self, account: &User, image: Vec<u8>) -> Result<()> {
        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/image",
            account.address().domain(),
            account.address().local_part()
        );
        self.request(
            Method::PUT,
            account.address().domain(),
            &path,
            Some(account),
            None,
            Some(image),
        )
        .await?;
        Ok(())
    }

    /// Lists the account's sealed contact entries.
    pub async fn list_links(&self, account: &User) -> Result<Vec<String>> {
        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/links",
            account.address().domain(),
            account.address().local_part()
        );
        let response = self
            .request(
                Method::GET,
                account.address().domain(),
                &path,
                Some(account),
                None,
                None,
            )
            .await?;
        Ok(text_lines(&response.text().await?))
    }

    /// Records a contact: the contact's address sealed to the account's
    /// own encryption key, stored under the pair link.
    pub async fn store_link(&self, account: &User, contact: &Address) -> Result<()> {
        let sealed = crypto::seal_anonymous(
            account.public_encryption_key(),
            contact.as_str().as_bytes(),
        )?;
        let contact_link = link::link(account.address().as_str(), contact.as_str());
        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/links/{contact_link}",
            account.address().domain(),
            account.address().local_part()
        );
        self.request(
            Method::PUT,
            account.address().domain(),
            &path,
            Some(account),
            None,
            Some(sealed.into_bytes()),
        )
        .await?;
        Ok(())
    }

    /// Removes a contact by link.
    pub async fn delete_link(&self, account: &User, contact_link: &str) -> Result<()> {
        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/links/{contact_link}",
            account.address().domain(),
            account.address().local_part()
        );
        self.request(
            Method::DELETE,
            account.address().domain(),
            &path,
            Some(account),
            None,
            None,
        )
        .await?;
        Ok(())
    }

    /// Lists the account's notification records; the sealed origins open
    /// with the account's private encryption key.
    pub async fn list_notifications(&self, account: &User) -> Result<Vec<String>> {
        let path = format!(
            "/{PRIVATE_API_PREFIX}/{}/{}/notifications",
            account.address().domain(),
            account.address().local_part()
        );
        let response = self
            .request(
                Method::GET,
                account.address().domain(),
                &path,
                Some(account),
                None,
                None,
            )
            .await?;
        Ok(text_lines(&response.text().await?))
    }

    /// Provisions a new account on a host willing to serve its domain.
    /// The token's signing key must match the profile's signing key.
    pub async fn provision(&self, account: &User, profile_text: &str) -> Result<()> {
        let path = format!(
            "/{PROVISION_API_PREFIX}/{}/{}",
            account.address().domain(),
            account.address().local_part()
        );
        self.request(
            Method::POST,
            account.address().domain(),
            &path,
            Some(account),
            None,
            Some(profile_text.as_bytes().to_vec()),
        )
        .await?;
        Ok(())
    }
}

fn text_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn status_error(status: StatusCode) -> SealmailError {
    let message = format!("server answered {status}");
    match status {
        StatusCode::BAD_REQUEST => SealmailError::protocol(message),
        StatusCode::UNAUTHORIZED => SealmailError::unauthorized(message),
        StatusCode::FORBIDDEN => SealmailError::forbidden(message),
        StatusCode::NOT_FOUND => SealmailError::not_found(message),
        StatusCode::CONFLICT => SealmailError::conflict(message),
        StatusCode::PAYLOAD_TOO_LARGE => SealmailError::too_large(message),
        _ => SealmailError::store(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_scheme_handling() {
        assert_eq!(
            MailClient::base_url("mail.example.com"),
            "https://mail.example.com"
        );
        assert_eq!(
            MailClient::base_url("http://localhost:4000"),
            "http://localhost:4000"
        );
    }

    #[test]
    fn test_text_lines() {
        assert_eq!(
            text_lines("a\n\n b \n"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(text_lines("").is_empty());
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED),
            SealmailError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT),
            SealmailError::Conflict(_)
        ));
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR),
            SealmailError::Store(_)
        ));
    }
}
