//! Filename normalization
//!
//! Names are stored in NFC. Characters that are forbidden on at least one
//! supported platform are replaced so that a tree created on one machine
//! can be mirrored on any other.

use unicode_normalization::{is_nfc, UnicodeNormalization};

/// Characters replaced by [`safe_filename`]
pub const FORBIDDEN_CHARS: &[char] = &['/', ':', '"', '|', '*', '<', '>', '?', '\\'];

/// Replacement for forbidden characters
pub const REPLACEMENT: &str = "-";

/// Returns `name` with forbidden characters replaced by `-`
///
/// Trailing spaces and dots are stripped on Windows, which refuses them.
pub fn safe_filename(name: &str) -> String {
    let mut safe: String = name
        .chars()
        .map(|c| {
            if FORBIDDEN_CHARS.contains(&c) {
                REPLACEMENT.to_string()
            } else {
                c.to_string()
            }
        })
        .collect();
    if cfg!(windows) {
        let trimmed = safe.trim_end_matches([' ', '.']).len();
        safe.truncate(trimmed);
    }
    normalize(&safe)
}

/// Canonical (NFC) form of a name
pub fn normalize(name: &str) -> String {
    if is_nfc(name) {
        name.to_string()
    } else {
        name.nfc().collect()
    }
}

/// Returns true if `name` is already in canonical form
pub fn is_normalized(name: &str) -> bool {
    is_nfc(name)
}
