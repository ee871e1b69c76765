//! Ignore rules for local names
//!
//! A name is ignored when it starts with one of the configured prefixes,
//! ends with one of the configured suffixes (both compared lowercased), or
//! matches one of the built-in patterns generated by editors and office
//! suites. Children of an ignored folder are ignored too; that part is
//! enforced by [`LocalClient::is_ignored`](super::LocalClient::is_ignored).

use glob::Pattern;
use pairsync_core::config::IgnoreConfig;
use tracing::warn;

/// Built-in patterns for files that are never worth syncing
const BUILTIN_PATTERNS: &[&str] = &[
    // Emacs autosave
    "#*#",
    // LibreOffice lock file
    ".~lock.*#",
    // Apple sandbox temporary copies
    "*.sb-*",
];

/// Autosave files `atmp<digits>`
const AUTOSAVE_PREFIX: &str = "atmp";

/// Compiled ignore rules
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    prefixes: Vec<String>,
    suffixes: Vec<String>,
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    pub fn new(prefixes: &[String], suffixes: &[String]) -> Self {
        let patterns = BUILTIN_PATTERNS
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = raw, error = %e, "Skipping invalid ignore pattern");
                    None
                }
            })
            .collect();

        Self {
            prefixes: prefixes.iter().map(|p| p.to_lowercase()).collect(),
            suffixes: suffixes.iter().map(|s| s.to_lowercase()).collect(),
            patterns,
        }
    }

    pub fn from_config(config: &IgnoreConfig) -> Self {
        Self::new(&config.prefixes, &config.suffixes)
    }

    /// Returns true if a single name (not a path) must be ignored
    pub fn is_ignored(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        if self.prefixes.iter().any(|p| lower.starts_with(p.as_str())) {
            return true;
        }
        if self.suffixes.iter().any(|s| lower.ends_with(s.as_str())) {
            return true;
        }
        if is_autosave(&lower) {
            return true;
        }
        self.patterns.iter().any(|p| p.matches(name))
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::from_config(&IgnoreConfig::default())
    }
}

fn is_autosave(lower: &str) -> bool {
    lower
        .strip_prefix(AUTOSAVE_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Returns true for names office suites give to files they are still writing
///
/// Such files (eight hexadecimal characters, no extension) are usually
/// renamed within seconds; their upload is delayed once.
pub fn is_temp_file(name: &str) -> bool {
    name.len() == 8 && name.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prefixes_and_suffixes() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored(".hidden"));
        assert!(rules.is_ignored("Thumbs.db"));
        assert!(rules.is_ignored("~$report.docx"));
        assert!(rules.is_ignored("movie.PART"));
        assert!(rules.is_ignored(".joe.txt.doc-1.nxpart"));
        assert!(rules.is_ignored("notes.txt~"));
        assert!(!rules.is_ignored("joe.txt"));
        assert!(!rules.is_ignored("Test folder"));
    }

    #[test]
    fn test_builtin_patterns() {
        let rules = IgnoreRules::new(&[], &[]);
        assert!(rules.is_ignored("atmp1234"));
        assert!(!rules.is_ignored("atmp"));
        assert!(!rules.is_ignored("atmpx1"));
        assert!(rules.is_ignored("#draft.txt#"));
        assert!(rules.is_ignored(".~lock.report.odt#"));
        assert!(rules.is_ignored("report.docx.sb-1a2b3c-XyZ"));
        assert!(!rules.is_ignored("report.docx"));
    }

    #[test]
    fn test_is_temp_file() {
        assert!(is_temp_file("A1B2C3D4"));
        assert!(!is_temp_file("A1B2C3D4.docx"));
        assert!(!is_temp_file("ZZZZZZZZ"));
    }
}
