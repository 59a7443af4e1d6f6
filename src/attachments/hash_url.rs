//! `hash://sha256/<hex>?type=<mime>` attachment references.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StoreError, StoreResult};
use crate::storage::Hash;

pub const DEFAULT_MIME: &str = "application/octet-stream";

// Matches anywhere in text; the mime part is the url-encoded alphabet only.
static HASH_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)hash://sha256/([0-9a-f]{64})(?:\?type=([A-Za-z0-9%._~+\-]*))?")
        .expect("hash url regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashUrl {
    pub hash: Hash,
    pub mime_type: String,
}

impl HashUrl {
    pub fn new<M: Into<String>>(hash: Hash, mime_type: M) -> Self {
        Self { hash, mime_type: mime_type.into() }
    }

    /// Every hash-URL contained in `text`, in order of appearance.
    pub fn find_all(text: &str) -> Vec<HashUrl> {
        HASH_URL_RE
            .captures_iter(text)
            .filter_map(|c| from_captures(&c).ok())
            .collect()
    }
}

fn from_captures(c: &regex::Captures<'_>) -> StoreResult<HashUrl> {
    let hash: Hash = c.get(1).map(|m| m.as_str()).unwrap_or_default().parse()?;
    let mime_type = match c.get(2).map(|m| m.as_str()) {
        Some(raw) if !raw.is_empty() => urlencoding::decode(raw)
            .map_err(|e| StoreError::validation(format!("bad mime type '{}': {}", raw, e)))?
            .into_owned(),
        _ => DEFAULT_MIME.to_string(),
    };
    Ok(HashUrl { hash, mime_type })
}

impl fmt::Display for HashUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hash://sha256/{}?type={}", self.hash, urlencoding::encode(&self.mime_type))
    }
}

impl FromStr for HashUrl {
    type Err = StoreError;

    /// Parses a string that is exactly one hash-URL.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let c = HASH_URL_RE
            .captures(s)
            .ok_or_else(|| StoreError::validation(format!("'{}' is not a hash url", s)))?;
        let whole = c.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole.len() != s.len() {
            return Err(StoreError::validation(format!("'{}' is not a hash url", s)));
        }
        from_captures(&c)
    }
}

impl Serialize for HashUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HashUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
