//! Content fingerprinting.
//!
//! A [`ContentFingerprint`] is the SHA-256 digest of normalized text. It is
//! the key of the extraction cache and the dedup key of the embedding
//! batcher, so normalization must never be weaker than "semantically
//! identical input hashes identically".
//!
//! Normalization:
//! - text is put in Unicode NFC form, so precomposed and decomposed
//!   accents hash the same
//! - a leading byte-order mark is dropped
//! - `\r\n` and lone `\r` become `\n`
//! - trailing whitespace is stripped from every line
//! - trailing blank lines are dropped

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Hex-encoded SHA-256 of normalized text (64 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentFingerprint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            anyhow::bail!("Invalid content fingerprint: '{}'", s);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// Normalize text before hashing. See the module docs for the rules.
pub fn normalize(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let composed = text.nfc().collect::<String>();
    let unified = composed.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    for line in unified.split('\n') {
        out.push_str(line.trim_end());
        out.push('\n');
    }

    let trimmed_len = out.trim_end_matches('\n').len();
    out.truncate(trimmed_len);
    out
}

/// Fingerprint `text` after normalization.
pub fn fingerprint(text: &str) -> ContentFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    ContentFingerprint(hex::encode(hasher.finalize()))
}
