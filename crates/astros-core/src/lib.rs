//! Core record model and canonical hashing for astros ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "astros-core";

/// Length of a rendered content hash (SHA-256, lowercase hex).
pub const CONTENT_HASH_LEN: usize = 64;

/// A fetched payload in canonical form, ready to be appended to the raw table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub canonical_string: String,
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Canonicalize `value` and hash the result.
    pub fn capture(value: &JsonValue, captured_at: DateTime<Utc>) -> Self {
        let canonical_string = canonicalize(value);
        let content_hash = sha256_hex(&canonical_string);
        Self {
            canonical_string,
            content_hash,
            captured_at,
        }
    }

    /// Abbreviated hash for log lines.
    pub fn short_hash(&self) -> &str {
        self.content_hash.get(..10).unwrap_or(&self.content_hash)
    }
}

/// Serialize JSON deterministically: object keys sorted by code point at every
/// level, no whitespace, non-ASCII text left unescaped. Array order is kept.
pub fn canonicalize(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Compact `Display` for scalars; strings only escape quotes, backslashes
        // and control characters. Numbers keep their source digits
        // (`arbitrary_precision`).
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_json_string(text: &str, out: &mut String) {
    out.push_str(&JsonValue::from(text).to_string());
}

/// SHA-256 over the UTF-8 bytes of `text`, as lowercase hex.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
