//! Content hashing for policy specifications.
//!
//! A spec is canonicalized by removing the insignificant whitespace between
//! JSON tokens. Tokens are never rewritten, so key order and number spelling
//! are part of a spec's identity. The digest is SHA-1 over the canonical bytes:
//! it deduplicates specs and lets callers refer to one by hash. It is not a
//! security boundary.

use hex::ToHex;
use sha1::Digest;

pub const SPEC_HASH_HEX_LEN: usize = 40;

#[derive(Debug)]
pub struct MalformedInputError(serde_json::Error);

impl std::fmt::Display for MalformedInputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "spec is not valid JSON: {}", self.0)
    }
}

impl std::error::Error for MalformedInputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_spec_hash(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != SPEC_HASH_HEX_LEN {
        return false;
    }
    bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Compact JSON text for `spec`: whitespace outside string literals is
/// dropped, every token and the key order are kept as sent.
pub fn canonicalize_spec(spec: &str) -> Result<String, MalformedInputError> {
    // Syntax check only; `IgnoredAny` never materializes numbers.
    serde_json::from_str::<serde::de::IgnoredAny>(spec).map_err(MalformedInputError)?;

    let mut out = String::with_capacity(spec.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in spec.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if !matches!(ch, ' ' | '\t' | '\n' | '\r') {
            in_string = ch == '"';
            out.push(ch);
        }
    }
    Ok(out)
}

pub fn hash_spec(spec: &str) -> Result<String, MalformedInputError> {
    Ok(sha1_hex(canonicalize_spec(spec)?.as_bytes()))
}
