//! Structured-value codecs.
//! Content addressing hashes the *encoded* bytes, so each codec must be
//! deterministic for a given value: JSON output follows struct field order and
//! `BTreeMap` key order; bincode is positional.

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    Bincode,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> StoreResult<Vec<u8>> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::Bincode => Ok(bincode::serialize(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> StoreResult<T> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Bincode => Ok(bincode::deserialize(bytes)?),
        }
    }

    /// File extension for files written with this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Json => ".json",
            Codec::Bincode => ".bin",
        }
    }
}

impl FromStr for Codec {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "bincode" | "bin" => Ok(Codec::Bincode),
            other => Err(StoreError::validation(format!("unknown codec '{}'", other))),
        }
    }
}
