//! Notification records.
//!
//! A notification tells an account "someone behind this link wants your
//! attention" without telling the server who. The record keeps the origin
//! address sealed to the recipient's encryption key; only the recipient's
//! client can open it. One file per link, last writer wins.

use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto;
use crate::error::Result;
use crate::store::Store;
use crate::util;

/// Notifications directory inside an account home.
pub const NOTIFICATIONS_DIRECTORY: &str = "notifications";

const NOTIFICATION_SEPARATOR: char = ',';
const NOTIFICATION_ID_LENGTH: usize = 32;

impl Store {
    pub fn notifications_path(home: &Path) -> PathBuf {
        home.join(NOTIFICATIONS_DIRECTORY)
    }

    /// Whether a notification is already recorded for this link.
    pub fn notification_exists(home: &Path, link: &str) -> bool {
        Self::notifications_path(home).join(link).is_file()
    }

    /// Stores a notification record for `link`:
    /// `id,sealed-origin,notifier-signing-fingerprint,target-encryption-fingerprint`.
    pub fn store_notification(
        home: &Path,
        link: &str,
        sealed_origin: &str,
        notifier_signing_fingerprint: &str,
        target_encryption_fingerprint: &str,
    ) -> Result<()> {
        fs::create_dir_all(Self::notifications_path(home))?;
        let notification_id = crypto::random_token(NOTIFICATION_ID_LENGTH);
        let record = [
            notification_id.as_str(),
            sealed_origin,
            notifier_signing_fingerprint,
            target_encryption_fingerprint,
        ]
        .join(&NOTIFICATION_SEPARATOR.to_string());
        fs::write(Self::notifications_path(home).join(link), record)?;
        Ok(())
    }

    /// Lists all notification records as `link,record` lines, for the
    /// account's client to open.
    pub fn list_notifications(home: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(Self::notifications_path(home)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.metadata()?.is_file() {
                continue;
            }
            let Ok(record) = fs::read_to_string(entry.path()) else {
                continue;
            };
            lines.push(format!(
                "{}{NOTIFICATION_SEPARATOR}{record}",
                entry.file_name().to_string_lossy()
            ));
        }
        lines.sort();
        Ok(lines)
    }

    /// Drops notification files older than `max_age`.
    pub fn sweep_notifications(home: &Path, max_age: std::time::Duration) -> Result<()> {
        let cutoff = std::time::SystemTime::now() - max_age;
        util::delete_files_older_than(&Self::notifications_path(home), cutoff)
    }
}
