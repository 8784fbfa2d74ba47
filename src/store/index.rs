//! The append-only message index.
//!
//! One line per `(link, signing-fingerprint, stream, message-id)` tuple,
//! four comma-separated columns with the message id last. Private messages
//! get one line per reader; broadcast messages one line with empty link and
//! fingerprint columns. Writes are idempotent: an existing line is never
//! appended twice. All mutations of one index file serialize on its
//! per-path mutex.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::store::Store;
use crate::util;

/// Index file name inside the message store directory.
pub const INDEX_FILE_NAME: &str = "index";

const INDEX_SEPARATOR: char = ',';
const INDEX_COLUMNS: usize = 4;

fn index_line(link: &str, fingerprint: &str, stream: &str, message_id: &str) -> String {
    // The message id stays last so removal can match on the line suffix.
    [link, fingerprint, stream, message_id].join(&INDEX_SEPARATOR.to_string())
}

impl Store {
    /// Path of an account's index file.
    pub fn index_path(home: &Path) -> PathBuf {
        Self::messages_path(home).join(INDEX_FILE_NAME)
    }

    /// Appends one index entry unless an identical line already exists.
    pub fn write_index_entry(
        &self,
        home: &Path,
        link: &str,
        fingerprint: &str,
        stream: &str,
        message_id: &str,
    ) -> Result<()> {
        let path = Self::index_path(home);
        self.with_path_lock(&path, || {
            let line = index_line(link, fingerprint, stream, message_id);
            if util::prefix_exists_in_file(&line, &path)? {
                return Ok(());
            }
            fs::create_dir_all(Self::messages_path(home))?;
            util::append_line(&line, &path)
        })
    }

    /// Removes every entry of `message_id` by rewriting the index to a
    /// temporary file and renaming it into place.
    pub fn remove_message_from_index(&self, home: &Path, message_id: &str) -> Result<()> {
        let path = Self::index_path(home);
        self.with_path_lock(&path, || {
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let suffix = format!("{INDEX_SEPARATOR}{message_id}");
            let mut kept = String::new();
            for line in content.lines() {
                if !line.ends_with(&suffix) {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }

            let temp_path = path.with_extension("rewrite");
            fs::write(&temp_path, kept)?;
            fs::rename(&temp_path, &path)?;
            Ok(())
        })
    }

    /// Returns the message ids matching a filter.
    ///
    /// Link and fingerprint must match the columns exactly (the broadcast
    /// listing passes empty strings to match the broadcast entries). An
    /// empty stream filter matches any stream. Entries whose message
    /// directory has gone missing are skipped, never served.
    pub fn filter_index(
        &self,
        home: &Path,
        link: &str,
        fingerprint: &str,
        stream: &str,
    ) -> Result<Vec<String>> {
        let content = match fs::read_to_string(Self::index_path(home)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut message_ids = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns: Vec<&str> = line.splitn(INDEX_COLUMNS, INDEX_SEPARATOR).collect();
            if columns.len() < INDEX_COLUMNS {
                continue;
            }
            let (entry_link, entry_fingerprint, entry_stream, message_id) =
                (columns[0], columns[1], columns[2], columns[3]);

            if entry_link != link || entry_fingerprint != fingerprint {
                continue;
            }
            if !stream.is_empty() && entry_stream != stream {
                continue;
            }
            if !Self::message_exists(home, message_id) {
                continue;
            }
            message_ids.push(message_id.to_string());
        }
        Ok(message_ids)
    }

    /// All message ids present in the index, deduplicated, in append
    /// order.
    pub(crate) fn index_message_ids(&self, home: &Path) -> Result<Vec<String>> {
        let content = match fs::read_to_string(Self::index_path(home)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut seen = std::collections::HashSet::new();
        let mut message_ids = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns: Vec<&str> = line.splitn(INDEX_COLUMNS, INDEX_SEPARATOR).collect();
            if columns.len() < INDEX_COLUMNS {
                continue;
            }
            let message_id = columns[INDEX_COLUMNS - 1];
            if seen.insert(message_id.to_string()) {
                message_ids.push(message_id.to_string());
            }
        }
        Ok(message_ids)
    }
}
