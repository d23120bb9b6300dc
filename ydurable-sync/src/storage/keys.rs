//! Ordered storage keys.
//!
//! A key is a tuple of string and number parts, flattened into one string so
//! that lexicographic order on the encoded form matches tuple order:
//!
//! ```text
//! ("v1", "notes", "update", 7)  →  "v1"#"notes"#"update"#000000007
//! ("v1_sv", "notes")            →  "v1_sv"#"notes"
//! ```
//!
//! Strings are JSON-quoted, numbers are zero-padded to nine digits. The
//! format is shared with data written by earlier deployments, so it must not
//! change.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Prefix of every update-log key.
pub const UPDATE_PREFIX: &str = "v1";
/// Prefix of every state-summary key.
pub const STATE_VECTOR_PREFIX: &str = "v1_sv";
const UPDATE_TAG: &str = "update";
const SEPARATOR: char = '#';
const NUMBER_WIDTH: usize = 9;

/// Exclusive upper bound when range-scanning a document's updates.
pub const CLOCK_UPPER_BOUND: u32 = 0xFFFF_FFFF;
/// Largest clock whose padded form still sorts below [`CLOCK_UPPER_BOUND`].
///
/// The bound encodes as `4294967295`, so nine-digit clocks from `429496730`
/// up would fall outside the scan range.
pub const MAX_CLOCK: u32 = 429_496_729;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Unterminated string component in key {0:?}")]
    UnterminatedString(String),
    #[error("Invalid string component in key {key:?}: {reason}")]
    InvalidString { key: String, reason: String },
    #[error("Invalid numeric component {part:?} in key {key:?}")]
    InvalidNumber { key: String, part: String },
    #[error("Expected '#' separator in key {0:?}")]
    MissingSeparator(String),
}

/// One component of a [`StorageKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum KeyPart {
    Str(String),
    Num(u32),
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_owned())
    }
}

impl From<u32> for KeyPart {
    fn from(n: u32) -> Self {
        KeyPart::Num(n)
    }
}

/// A decoded storage key. Serializes as a JSON array of its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StorageKey(Vec<KeyPart>);

impl StorageKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// `("v1", doc_name, "update", clock)`
    pub fn update(doc_name: &str, clock: u32) -> Self {
        Self(vec![
            UPDATE_PREFIX.into(),
            doc_name.into(),
            UPDATE_TAG.into(),
            clock.into(),
        ])
    }

    /// `("v1_sv", doc_name)`
    pub fn state_vector(doc_name: &str) -> Self {
        Self(vec![STATE_VECTOR_PREFIX.into(), doc_name.into()])
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Document name, for update and state-summary keys.
    pub fn doc_name(&self) -> Option<&str> {
        match self.0.get(1) {
            Some(KeyPart::Str(name)) => Some(name),
            _ => None,
        }
    }

    /// Clock of an update key.
    pub fn clock(&self) -> Option<u32> {
        match self.0.as_slice() {
            [KeyPart::Str(prefix), _, KeyPart::Str(tag), KeyPart::Num(clock)]
                if prefix == UPDATE_PREFIX && tag == UPDATE_TAG =>
            {
                Some(*clock)
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            match part {
                KeyPart::Str(s) => {
                    out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\"")));
                }
                KeyPart::Num(n) => out.push_str(&format!("{n:0width$}", width = NUMBER_WIDTH)),
            }
        }
        out
    }

    pub fn decode(key: &str) -> Result<Self, KeyError> {
        let mut parts = Vec::new();
        let mut rest = key;
        loop {
            let consumed = if rest.starts_with('"') {
                let end = closing_quote(rest)
                    .ok_or_else(|| KeyError::UnterminatedString(key.to_owned()))?;
                let value: String = serde_json::from_str(&rest[..=end]).map_err(|e| {
                    KeyError::InvalidString {
                        key: key.to_owned(),
                        reason: e.to_string(),
                    }
                })?;
                parts.push(KeyPart::Str(value));
                end + 1
            } else {
                let end = rest.find(SEPARATOR).unwrap_or(rest.len());
                let number = rest[..end].parse::<u32>().map_err(|_| KeyError::InvalidNumber {
                    key: key.to_owned(),
                    part: rest[..end].to_owned(),
                })?;
                parts.push(KeyPart::Num(number));
                end
            };
            rest = &rest[consumed..];
            if rest.is_empty() {
                break;
            }
            rest = rest
                .strip_prefix(SEPARATOR)
                .ok_or_else(|| KeyError::MissingSeparator(key.to_owned()))?;
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Byte index of the quote closing the string that opens `s`.
fn closing_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, b) in s.bytes().enumerate().skip(1) {
        match b {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            b'"' => return Some(i),
            _ => {}
        }
    }
    None
}
