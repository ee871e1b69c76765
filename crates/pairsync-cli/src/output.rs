//! Command output
//!
//! Human mode prints checkmarked lines and aligned fields. JSON mode
//! stays silent except for errors and the one document a command emits
//! through [`Output::json`].

use serde_json::{json, Value};

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy)]
pub struct Output {
    format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    pub fn success(&self, message: &str) {
        if !self.is_json() {
            println!("\u{2713} {}", message);
        }
    }

    pub fn error(&self, message: &str) {
        if self.is_json() {
            eprintln!("{}", json!({"success": false, "error": message}));
        } else {
            eprintln!("\u{2717} Error: {}", message);
        }
    }

    pub fn warn(&self, message: &str) {
        if self.is_json() {
            eprintln!("{}", json!({"level": "warning", "message": message}));
        } else {
            eprintln!("\u{26a0} Warning: {}", message);
        }
    }

    pub fn info(&self, message: &str) {
        if !self.is_json() {
            println!("  {}", message);
        }
    }

    /// `key: value`, aligned
    pub fn field(&self, key: &str, value: &str) {
        if !self.is_json() {
            println!("  {:<16} {}", format!("{}:", key), value);
        }
    }

    pub fn json(&self, value: &Value) {
        if self.is_json() {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
        }
    }
}
