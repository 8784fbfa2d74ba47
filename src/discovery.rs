//! Federation discovery.
//!
//! A domain delegates mail service through a well-known text file. For
//! `user@domain`, the candidate list comes from
//! `https://<domain>/.well-known/mail.txt`, falling back to
//! `https://mail.<domain>/.well-known/mail.txt`; each non-empty, non-`#`
//! line is a candidate hostname, with `mail.<domain>` as the default when
//! the file is missing or empty. A candidate only counts once it answers
//! `HEAD https://<host>/<public-prefix>/<domain>` with 200.

use tracing::debug;

use crate::error::Result;
use crate::PUBLIC_API_PREFIX;

/// Path of the well-known delegation file.
pub const WELL_KNOWN_PATH: &str = ".well-known/mail.txt";

/// Resolves the mail hosts serving `domain`.
///
/// Unreachable candidates are skipped, not fatal; an empty result means
/// the domain has no reachable mail host right now.
pub async fn lookup_mail_hosts(http: &reqwest::Client, domain: &str) -> Result<Vec<String>> {
    let domain = domain.trim().to_lowercase();
    let default_host = format!("mail.{domain}");

    let body = match try_well_known(http, &domain).await {
        Some(body) => Some(body),
        None => try_well_known(http, &default_host).await,
    };

    let mut candidates: Vec<String> = Vec::new();
    if let Some(body) = body {
        for line in body.lines() {
            let line = line.trim().to_lowercase();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if valid_hostname(&line) {
                candidates.push(line);
            } else {
                debug!(hostname = %line, "invalid hostname, dropped entry");
            }
        }
        if candidates.is_empty() {
            candidates.push(default_host);
        }
    }

    let mut hosts = Vec::new();
    for candidate in candidates {
        if try_domain_delegation(http, &candidate, &domain).await {
            hosts.push(candidate);
        }
    }
    Ok(hosts)
}

async fn try_well_known(http: &reqwest::Client, hostname: &str) -> Option<String> {
    let uri = format!("https://{hostname}/{WELL_KNOWN_PATH}");
    let response = match http.get(&uri).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(%uri, error = %e, "well-known fetch failed");
            return None;
        }
    };
    if !response.status().is_success() {
        return None;
    }
    response.text().await.ok()
}

async fn try_domain_delegation(http: &reqwest::Client, hostname: &str, domain: &str) -> bool {
    let uri = format!("https://{hostname}/{PUBLIC_API_PREFIX}/{domain}");
    match http.head(&uri).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::OK,
        Err(e) => {
            debug!(%uri, error = %e, "delegation probe failed");
            false
        }
    }
}

/// Syntactic hostname check: dot-separated labels of alphanumerics and
/// hyphens. Reachability is probed separately.
pub fn valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_hostname() {
        assert!(valid_hostname("mail.example.com"));
        assert!(valid_hostname("x"));
        assert!(valid_hostname("a-b.c-d.example"));
        assert!(!valid_hostname(""));
        assert!(!valid_hostname("-bad.example"));
        assert!(!valid_hostname("bad-.example"));
        assert!(!valid_hostname("under_score.example"));
        assert!(!valid_hostname("two..dots.example"));
    }
}
