//! The per-account nonce ledger.
//!
//! One file per day, `.nonces_YYYY-MM-DD`, each line `value,rfc3339`.
//! A nonce is unique if its value is not a line prefix in today's or
//! yesterday's file; recording appends to today's file under the per-path
//! mutex. Files outside the two-day window are swept opportunistically
//! after each record, so a replay after the window counts as a new nonce.

use chrono::{Duration, Utc};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SealmailError};
use crate::nonce::Nonce;
use crate::store::Store;
use crate::util;

/// Nonce ledger filename prefix inside an account home.
pub const NONCES_FILENAME_PREFIX: &str = ".nonces_";

const NONCES_DATE_FORMAT: &str = "%Y-%m-%d";

fn ledger_name(days_back: i64) -> String {
    let day = Utc::now() - Duration::days(days_back);
    format!("{NONCES_FILENAME_PREFIX}{}", day.format(NONCES_DATE_FORMAT))
}

impl Store {
    fn nonce_ledger_path(home: &Path, days_back: i64) -> PathBuf {
        home.join(ledger_name(days_back))
    }

    /// Rejects a nonce whose value already appears in the current
    /// two-day window.
    pub fn nonce_is_unique(home: &Path, nonce: &Nonce) -> Result<()> {
        for days_back in 0..=1 {
            if util::prefix_exists_in_file(&nonce.value, &Self::nonce_ledger_path(home, days_back))?
            {
                return Err(SealmailError::unauthorized("nonce replay"));
            }
        }
        Ok(())
    }

    /// Records an accepted nonce in today's ledger. The caller is expected
    /// to follow up with [`Store::sweep_nonces`] off the request path.
    pub fn record_nonce(&self, home: &Path, nonce: &Nonce) -> Result<()> {
        let path = Self::nonce_ledger_path(home, 0);
        self.with_path_lock(&path, || {
            util::append_line(&format!("{},{}", nonce.value, nonce.date), &path)
        })
    }

    /// Deletes nonce ledgers other than today's and yesterday's.
    pub fn sweep_nonces(home: &Path) -> Result<()> {
        let keep = [ledger_name(0), ledger_name(1)];
        let entries = match fs::read_dir(home) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(NONCES_FILENAME_PREFIX) && !keep.contains(&name) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}
