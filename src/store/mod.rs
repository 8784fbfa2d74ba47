//! The server-side message store.
//!
//! Each account owns a home directory `<data-root>/<domain>/<local-part>/`:
//!
//! ```text
//! profile/data          profile text
//! profile/image         optional profile image
//! store/index           append-only message index, 4 CSV columns
//! store/<id>/envelope   envelope text
//! store/<id>/payload    payload bytes
//! store/<id>/access     access log, `link,rfc3339` lines
//! links/<link>          contact entries (body sealed to self)
//! notifications/<link>  single-line notification records
//! .nonces_<date>        daily nonce ledger
//! ```
//!
//! A `Store` value owns the data root and a map of per-path mutexes that
//! serialize writes to the index and nonce ledgers. There is no global
//! state; two stores over disjoint roots are fully independent.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SealmailError};
use crate::profile::Profile;
use crate::util;

pub mod index;
pub mod links;
pub mod nonces;
pub mod notifications;

/// Message store directory inside an account home.
pub const STORE_DIRECTORY: &str = "store";
/// Profile directory inside an account home.
pub const PROFILE_DIRECTORY: &str = "profile";
/// Profile data file name.
pub const PROFILE_DATA_FILE: &str = "data";
/// Profile image file name.
pub const PROFILE_IMAGE_FILE: &str = "image";
/// Access log file name inside a message directory.
pub const ACCESS_LOG_FILE: &str = "access";

use crate::message::{ENVELOPE_FILE_NAME, PAYLOAD_FILE_NAME};

/// Per-account on-disk store rooted at a data directory.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    path_mutexes: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Store {
    /// Opens a store over `root`. Directories appear lazily on first
    /// write; opening never touches the disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path_mutexes: Mutex::new(HashMap::new()),
        }
    }

    /// The data root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `operation` holding the mutex for `path`. All index and nonce
    /// ledger writes for one file serialize through here; the map entry is
    /// dropped again once no other holder remains.
    pub(crate) fn with_path_lock<T>(
        &self,
        path: &Path,
        operation: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let mutex = {
            let mut map = self.path_mutexes.lock();
            map.entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let result = {
            let _guard = mutex.lock();
            operation()
        };

        let mut map = self.path_mutexes.lock();
        if let Some(existing) = map.get(path) {
            // One reference in the map, one in our hand: nobody is waiting.
            if Arc::strong_count(existing) <= 2 {
                map.remove(path);
            }
        }
        result
    }

    // Paths ------------------------------------------------------------

    pub fn domain_path(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    pub fn domain_exists(&self, domain: &str) -> bool {
        self.domain_path(domain).is_dir()
    }

    pub fn home_path(&self, domain: &str, local_part: &str) -> PathBuf {
        self.root.join(domain).join(local_part)
    }

    pub fn home_exists(&self, domain: &str, local_part: &str) -> bool {
        self.home_path(domain, local_part).is_dir()
    }

    pub fn messages_path(home: &Path) -> PathBuf {
        home.join(STORE_DIRECTORY)
    }

    pub fn message_path(home: &Path, message_id: &str) -> PathBuf {
        Self::messages_path(home).join(message_id)
    }

    pub fn envelope_path(home: &Path, message_id: &str) -> PathBuf {
        Self::message_path(home, message_id).join(ENVELOPE_FILE_NAME)
    }

    pub fn payload_path(home: &Path, message_id: &str) -> PathBuf {
        Self::message_path(home, message_id).join(PAYLOAD_FILE_NAME)
    }

    pub fn access_log_path(home: &Path, message_id: &str) -> PathBuf {
        Self::message_path(home, message_id).join(ACCESS_LOG_FILE)
    }

    // Messages ---------------------------------------------------------

    pub fn message_exists(home: &Path, message_id: &str) -> bool {
        Self::message_path(home, message_id).is_dir()
    }

    /// Creates the directory for a new message; a message with the same id
    /// already present is a conflict.
    pub fn create_message_dir(home: &Path, message_id: &str) -> Result<PathBuf> {
        let path = Self::message_path(home, message_id);
        if path.exists() {
            return Err(SealmailError::conflict(format!(
                "message with same id present: {message_id}"
            )));
        }
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Removes a message directory with everything in it.
    pub fn delete_message_dir(home: &Path, message_id: &str) -> Result<()> {
        let path = Self::message_path(home, message_id);
        if !path.exists() {
            return Err(SealmailError::not_found(format!(
                "no such message: {message_id}"
            )));
        }
        fs::remove_dir_all(&path)?;
        Ok(())
    }

    /// Appends to a message's access log, once per link. The first access
    /// by a link wins; later ones are silently ignored.
    pub fn log_access(home: &Path, message_id: &str, link: &str) -> Result<()> {
        let path = Self::access_log_path(home, message_id);
        if util::prefix_exists_in_file(link, &path)? {
            return Ok(());
        }
        let line = format!("{link},{}", util::to_rfc3339(&util::timestamp_now()));
        util::append_line(&line, &path)
    }

    /// One status line per message and access-log entry: `message-id` for
    /// untouched messages, `message-id,link,date` per recorded access.
    pub fn messages_status(&self, home: &Path) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for message_id in self.index_message_ids(home)? {
            let access_path = Self::access_log_path(home, &message_id);
            let accesses = match fs::read_to_string(&access_path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            };

            let mut any = false;
            for access in accesses.lines() {
                let access = access.trim();
                if access.is_empty() || access.starts_with('#') {
                    continue;
                }
                lines.push(format!("{message_id},{access}"));
                any = true;
            }
            if !any {
                lines.push(message_id);
            }
        }
        Ok(lines)
    }

    /// Total size of an account home in bytes, the quota measure for
    /// incoming stores.
    pub fn home_dir_size(home: &Path) -> Result<u64> {
        util::dir_size(home)
    }

    // Profile ----------------------------------------------------------

    pub fn profile_data_path(home: &Path) -> PathBuf {
        home.join(PROFILE_DIRECTORY).join(PROFILE_DATA_FILE)
    }

    pub fn profile_image_path(home: &Path) -> PathBuf {
        home.join(PROFILE_DIRECTORY).join(PROFILE_IMAGE_FILE)
    }

    pub fn set_profile(home: &Path, data: &[u8]) -> Result<()> {
        let path = Self::profile_data_path(home);
        fs::create_dir_all(path.parent().expect("profile path has a parent"))?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn set_profile_image(home: &Path, data: &[u8]) -> Result<()> {
        let path = Self::profile_image_path(home);
        fs::create_dir_all(path.parent().expect("profile path has a parent"))?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Loads and parses an account's profile.
    pub fn load_profile(home: &Path) -> Result<Profile> {
        let data = fs::read(Self::profile_data_path(home))
            .map_err(|e| SealmailError::not_found(format!("no profile: {e}")))?;
        Profile::parse(&data)
    }

    // Retention --------------------------------------------------------

    /// Deletes messages in `home` whose directory is older than `max_age`,
    /// together with their index entries. The index rewrite happens under
    /// the per-path mutex like any other index mutation.
    pub fn sweep_expired(&self, home: &Path, max_age: std::time::Duration) -> Result<usize> {
        let cutoff = std::time::SystemTime::now() - max_age;
        let mut removed = 0;

        for message_id in self.index_message_ids(home)? {
            let path = Self::message_path(home, &message_id);
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            if metadata.modified()? >= cutoff {
                continue;
            }
            Self::delete_message_dir(home, &message_id)?;
            self.remove_message_from_index(home, &message_id)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Runs the retention sweep across every account under the data root.
    pub fn sweep_all_expired(&self, max_age: std::time::Duration) -> Result<usize> {
        let mut removed = 0;
        let domains = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for domain in domains {
            let domain = domain?;
            if !domain.metadata()?.is_dir() {
                continue;
            }
            for account in fs::read_dir(domain.path())? {
                let account = account?;
                if account.metadata()?.is_dir() {
                    removed += self.sweep_expired(&account.path(), max_age)?;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_paths() {
        let store = Store::new("/data");
        assert_eq!(
            store.home_path("x.test", "a"),
            PathBuf::from("/data/x.test/a")
        );
        assert!(!store.home_exists("x.test", "a"));
    }

    #[test]
    fn test_create_message_dir_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path();
        let id = "m".repeat(64);

        Store::create_message_dir(home, &id).unwrap();
        assert!(Store::message_exists(home, &id));
        assert!(Store::create_message_dir(home, &id).is_err());

        Store::delete_message_dir(home, &id).unwrap();
        assert!(!Store::message_exists(home, &id));
        assert!(Store::delete_message_dir(home, &id).is_err());
    }

    #[test]
    fn test_access_log_dedupes_by_link() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path();
        let id = "m".repeat(64);
        Store::create_message_dir(home, &id).unwrap();

        let link = "ab".repeat(32);
        Store::log_access(home, &id, &link).unwrap();
        Store::log_access(home, &id, &link).unwrap();

        let log = fs::read_to_string(Store::access_log_path(home, &id)).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.starts_with(&format!("{link},")));
    }

    #[test]
    fn test_profile_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path();
        let user = crate::keys::User::generate(crate::address::Address::parse("a@x.test").unwrap());
        let profile = Profile::for_user(&user, "Alice");

        Store::set_profile(home, profile.to_text().as_bytes()).unwrap();
        let loaded = Store::load_profile(home).unwrap();
        assert_eq!(loaded.signing_fingerprint, user.signing_fingerprint());
    }

    #[test]
    fn test_sweep_expired_removes_message_and_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let home = dir.path().join("x.test").join("a");
        fs::create_dir_all(&home).unwrap();
        let id = "m".repeat(64);

        Store::create_message_dir(&home, &id).unwrap();
        fs::write(Store::payload_path(&home, &id), b"x").unwrap();
        store
            .write_index_entry(&home, "", "", "", &id)
            .unwrap();

        // Nothing is old enough yet.
        assert_eq!(
            store
                .sweep_expired(&home, std::time::Duration::from_secs(3600))
                .unwrap(),
            0
        );

        // With a zero window everything has expired.
        assert_eq!(
            store
                .sweep_expired(&home, std::time::Duration::from_secs(0))
                .unwrap(),
            1
        );
        assert!(!Store::message_exists(&home, &id));
        assert!(store.filter_index(&home, "", "", "").unwrap().is_empty());
    }
}
