//! Destination paths for uploads: sanitized original name salted with a timestamp.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest sanitized name kept in a stored filename.
const MAX_NAME_LEN: usize = 128;

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Create a fresh, empty file in `dir` for an upload of `filename`; returns its path and
/// the writable handle. The name is `<millis>_<sanitized>`; a counter is added when that name is taken,
/// so concurrent uploads of identically named files never share a path.
pub fn reserve_destination(dir: &Path, filename: &str) -> io::Result<(PathBuf, File)> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    reserve_with_stamp(dir, millis, &sanitize_filename(filename))
}

fn reserve_with_stamp(dir: &Path, millis: u128, name: &str) -> io::Result<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 {
            dir.join(format!("{millis}_{name}"))
        } else {
            dir.join(format!("{millis}-{attempt}_{name}"))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}
