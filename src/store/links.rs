//! Contact links.
//!
//! Each file under `links/` is named by a link and holds the contact's
//! address sealed to the account's own encryption key; the server stores
//! and lists the bodies without ever reading an address. The presence of a
//! link file doubles as the authorization set for notifications.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SealmailError};
use crate::link::LINK_LENGTH;
use crate::store::Store;

/// Links directory inside an account home.
pub const LINKS_DIRECTORY: &str = "links";

impl Store {
    pub fn links_path(home: &Path) -> PathBuf {
        home.join(LINKS_DIRECTORY)
    }

    pub fn link_path(home: &Path, link: &str) -> PathBuf {
        Self::links_path(home).join(link)
    }

    /// Whether the account has recorded this link as a contact.
    pub fn has_link(home: &Path, link: &str) -> bool {
        Self::link_path(home, link).is_file()
    }

    /// Stores a contact entry; the body is opaque to the server.
    pub fn store_link(home: &Path, link: &str, sealed_contact: &[u8]) -> Result<()> {
        fs::create_dir_all(Self::links_path(home))?;
        fs::write(Self::link_path(home, link), sealed_contact)?;
        Ok(())
    }

    /// Deletes a contact entry.
    pub fn delete_link(home: &Path, link: &str) -> Result<()> {
        fs::remove_file(Self::link_path(home, link)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SealmailError::not_found(format!("no such link: {link}"))
            } else {
                e.into()
            }
        })
    }

    /// Lists all sealed contact bodies. Only well-formed link filenames
    /// count; anything else in the directory is ignored.
    pub fn list_links(home: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(Self::links_path(home)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut bodies = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.metadata()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if name.to_string_lossy().len() != LINK_LENGTH {
                continue;
            }
            bodies.push(fs::read_to_string(entry.path())?);
        }
        bodies.sort();
        Ok(bodies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path();
        let link = "ab".repeat(32);

        assert!(!Store::has_link(home, &link));
        Store::store_link(home, &link, b"sealed contact").unwrap();
        assert!(Store::has_link(home, &link));

        let listed = Store::list_links(home).unwrap();
        assert_eq!(listed, vec!["sealed contact".to_string()]);

        Store::delete_link(home, &link).unwrap();
        assert!(!Store::has_link(home, &link));
        assert!(Store::delete_link(home, &link).is_err());
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path();
        Store::store_link(home, &"cd".repeat(32), b"good").unwrap();
        fs::write(Store::links_path(home).join("notes.txt"), b"junk").unwrap();

        assert_eq!(Store::list_links(home).unwrap(), vec!["good".to_string()]);
    }

    #[test]
    fn test_list_empty_when_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Store::list_links(dir.path()).unwrap().is_empty());
    }
}
