use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// The suffix every stored image is written with.
pub const IMAGE_SUFFIX: &str = ".webp";

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// The name an image is stored under.
///
/// Derived from the caller's logical name (usually a member's display name or
/// the uploaded file name) by dropping the file extension and collapsing each
/// whitespace run into a single `_`. Two names that only differ in extension
/// or spacing map to the same key, so a re-import overwrites the old image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Derives the key for the given logical name.
    ///
    /// Returns `None` when nothing usable is left, or when the result could
    /// escape the storage namespace (path separators, `.` / `..`).
    pub fn derive(logical_name: &str) -> Option<Self> {
        let stem = strip_extension(logical_name.trim());
        let key = WHITESPACE_RUN.replace_all(stem.trim(), "_");

        if !is_valid(&key) {
            return None;
        }

        Some(Self(key.into_owned()))
    }

    /// Rebuilds a key from a stored file name such as `Jane_Doe.webp`.
    ///
    /// This is the exact inverse of [`StorageKey::file_name`]; anything else
    /// is rejected.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let key = file_name.strip_suffix(IMAGE_SUFFIX)?;
        if !is_valid(key) || key.contains(char::is_whitespace) {
            return None;
        }

        Some(Self(key.to_string()))
    }

    /// The file name the image is stored as.
    #[inline]
    pub fn file_name(&self) -> String {
        format!("{}{}", self.0, IMAGE_SUFFIX)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the lowercased extension of a logical name, if it has one.
pub fn extension_of(logical_name: &str) -> Option<String> {
    split_extension(logical_name.trim()).map(|(_, ext)| ext.to_ascii_lowercase())
}

fn is_valid(key: &str) -> bool {
    !key.is_empty() && !key.chars().all(|c| c == '.') && !key.contains(['/', '\\'])
}

fn strip_extension(name: &str) -> &str {
    split_extension(name).map(|(stem, _)| stem).unwrap_or(name)
}

/// An extension is a non-empty alphanumeric run after the last `.` that has
/// something in front of it. `Dr. Who` therefore keeps its dot.
fn split_extension(name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.trim().is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((stem, ext))
}
