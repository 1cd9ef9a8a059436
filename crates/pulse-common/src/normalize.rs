//! Text normalization and content hashing
//!
//! Normalized text is the concatenation of title and body with control
//! characters stripped and whitespace collapsed. Its SHA-256 digest is the
//! deduplication key for stored classifications.

use crate::types::{NormalizedItem, RawItem};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 32-byte content digest, hex-encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextHash([u8; 32]);

impl TextHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

impl fmt::Display for TextHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TextHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextHash({})", self.to_hex())
    }
}

impl FromStr for TextHash {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(crate::Error::Decode(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0])?;
            let lo = hex_val(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(TextHash(bytes))
    }
}

fn hex_val(c: u8) -> Result<u8, crate::Error> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(crate::Error::Decode(format!("invalid hex char {:?}", c as char))),
    }
}

impl Serialize for TextHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TextHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TextHash::from_str(&s).map_err(D::Error::custom)
    }
}

/// Collapse whitespace runs to single spaces and strip control characters,
/// joining title and body when a title is present.
pub fn normalize_text(title: Option<&str>, body: &str) -> String {
    let mut out = String::with_capacity(body.len() + title.map_or(0, str::len) + 1);
    let mut pending_space = false;
    let parts = title.into_iter().chain(std::iter::once(body));
    for part in parts {
        for c in part.chars() {
            if c.is_whitespace() {
                pending_space = !out.is_empty();
            } else if c.is_control() {
                // stripped outright, no space inserted
            } else {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(c);
            }
        }
        pending_space = !out.is_empty();
    }
    out
}

/// SHA-256 digest of normalized text
pub fn hash_text(text: &str) -> TextHash {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    TextHash(hasher.finalize().into())
}

/// Attach normalized text and its hash to a raw item
pub fn normalize_item(raw: RawItem) -> NormalizedItem {
    let text = normalize_text(raw.title.as_deref(), &raw.body);
    let text_hash = hash_text(&text);
    NormalizedItem { raw, text, text_hash }
}
