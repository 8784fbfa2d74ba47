//! Small filesystem and time helpers shared across modules.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::{Result, SealmailError};

/// Current time in UTC.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now()
}

/// Renders a timestamp as RFC 3339 with second precision.
pub fn to_rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses an RFC 3339 timestamp.
pub fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| SealmailError::protocol(format!("bad timestamp '{value}': {e}")))
}

/// Sets a file's modification time.
pub fn set_file_modified(path: &Path, time: &DateTime<Utc>) -> Result<()> {
    let file = fs::File::options().write(true).open(path)?;
    let times = fs::FileTimes::new().set_modified(std::time::SystemTime::from(*time));
    file.set_times(times)?;
    Ok(())
}

/// True when any line of `path` starts with `prefix`. A missing file has
/// no lines.
pub fn prefix_exists_in_file(prefix: &str, path: &Path) -> Result<bool> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    for line in BufReader::new(file).lines() {
        if line?.trim().starts_with(prefix) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Appends `line` (newline-terminated) to `path`, creating the file if
/// needed. Single short writes keep appends line-atomic.
pub fn append_line(line: &str, path: &Path) -> Result<()> {
    let mut file = fs::File::options().append(true).create(true).open(path)?;
    if line.ends_with('\n') {
        file.write_all(line.as_bytes())?;
    } else {
        file.write_all(format!("{line}\n").as_bytes())?;
    }
    Ok(())
}

/// Total size in bytes of all regular files under `path`.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut size = 0;
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            size += dir_size(&entry.path())?;
        } else {
            size += metadata.len();
        }
    }
    Ok(size)
}

/// Deletes regular files directly under `dir` whose modification time is
/// older than `cutoff`.
pub fn delete_files_older_than(dir: &Path, cutoff: std::time::SystemTime) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() && metadata.modified()? < cutoff {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
