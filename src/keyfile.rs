//! Reads per-instance SSH key files.
//!
//! Each instance has a key file named after it in the key directory. Every non-blank line holds
//! one public key in the form `<type> <material> <user> [comment...]`, separated by single
//! spaces. The third field identifies the user, typically by e-mail address.

use regex::Regex;
use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

/// Errors that prevent a key file from being read at all.
///
/// None of these is fatal to a run; the caller skips the instance and moves on.
#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("key file {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("failed to read key file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to look up a key file for instance name {0:?}")]
    InvalidInstanceId(String),
}

/// One well-formed line of a key file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRecord {
    pub key_type: String,
    pub key_material: String,
    pub user: String,
}

/// A line that had fewer than three fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedLine {
    /// One-based line number within the file.
    pub line_number: usize,
    pub line: String,
}

/// The parsed contents of a key file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyFile {
    /// Well-formed records, in file order.
    pub records: Vec<KeyRecord>,

    /// Lines that were skipped because they were malformed.
    pub malformed: Vec<MalformedLine>,
}

/// Returns the path of the key file for `instance` within `keydir`.
///
/// # Errors
///
/// Instance names come from the cluster manager, not from us. Names that could point outside
/// `keydir` (anything but letters, digits, dots, hyphens, and underscores, or a leading dot) are
/// rejected with [KeyFileError::InvalidInstanceId].
pub fn path_for(keydir: &Path, instance: &str) -> Result<PathBuf, KeyFileError> {
    static VALID: OnceLock<Regex> = OnceLock::new();
    let valid = VALID.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]*$").expect("instance name regex is valid")
    });

    if !valid.is_match(instance) {
        return Err(KeyFileError::InvalidInstanceId(instance.to_owned()));
    }
    Ok(keydir.join(instance))
}

/// Reads and parses the key file at `path`.
///
/// The file need not be valid UTF-8. Invalid bytes are replaced with U+FFFD, so they only cost
/// the line they appear in when they fall within the first three fields.
pub fn read(path: &Path) -> Result<KeyFile, KeyFileError> {
    let bytes = fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => KeyFileError::Missing(path.to_owned()),
        _ => KeyFileError::Io {
            path: path.to_owned(),
            source,
        },
    })?;
    let source = path.display().to_string();
    let text = String::from_utf8_lossy(&bytes);
    if matches!(text, Cow::Owned(_)) {
        warn!(file = %source, "key file is not valid UTF-8");
    }
    Ok(parse(&source, &text))
}

/// Parses the text of a key file. `source` names the file in diagnostics.
///
/// Blank lines are ignored. Lines with fewer than three space-separated fields, or whose first
/// three fields contain U+FFFD (the mark of an undecodable byte), are logged and returned in
/// [KeyFile::malformed]; they never produce a [KeyRecord].
pub fn parse(source: &str, text: &str) -> KeyFile {
    let mut key_file = KeyFile::default();

    for (index, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split(' ');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(key_type), Some(key_material), Some(user))
                if ![key_type, key_material, user]
                    .iter()
                    .any(|field| field.contains(char::REPLACEMENT_CHARACTER)) =>
            {
                key_file.records.push(KeyRecord {
                    key_type: key_type.to_owned(),
                    key_material: key_material.to_owned(),
                    user: user.to_owned(),
                });
            }
            _ => {
                warn!(file = source, line = index + 1, "non-conforming key line: {line:?}");
                key_file.malformed.push(MalformedLine {
                    line_number: index + 1,
                    line: line.to_owned(),
                });
            }
        }
    }

    key_file
}
