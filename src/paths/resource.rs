//! Logical resource addresses: `/<source>/<owner>:<name>[/records/<recordID>]`.
//! This string form is what linkers are recorded as and what the HTTP layer,
//! lens engine and change feed exchange, so it must round-trip exactly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StoreError, StoreResult};

use super::DataPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Datasets,
    Lenses,
    Meta,
    Viewports,
}

impl Source {
    pub const ALL: [Source; 4] = [Source::Datasets, Source::Lenses, Source::Meta, Source::Viewports];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Datasets => "datasets",
            Source::Lenses => "lenses",
            Source::Meta => "meta",
            Source::Viewports => "viewports",
        }
    }
}

impl FromStr for Source {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "datasets" => Ok(Source::Datasets),
            "lenses" => Ok(Source::Lenses),
            "meta" => Ok(Source::Meta),
            "viewports" => Ok(Source::Viewports),
            other => Err(StoreError::validation(format!("unknown source '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourcePath {
    pub source: Source,
    pub owner: String,
    pub name: String,
    pub record_id: Option<String>,
}

impl ResourcePath {
    pub fn dataset<O: Into<String>, N: Into<String>>(source: Source, owner: O, name: N) -> Self {
        Self { source, owner: owner.into(), name: name.into(), record_id: None }
    }

    pub fn record<I: Into<String>>(&self, record_id: I) -> Self {
        Self { record_id: Some(record_id.into()), ..self.clone() }
    }

    /// The containing dataset address (drops the record id).
    pub fn collection(&self) -> Self {
        Self { record_id: None, ..self.clone() }
    }

    /// Folder of the dataset in the file layer: `<source>/<owner>/<name>`.
    pub fn dataset_dir(&self) -> StoreResult<DataPath> {
        DataPath::new([self.source.as_str(), self.owner.as_str(), self.name.as_str()])
    }
}

fn encode_component(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

fn decode_component(s: &str, what: &str) -> StoreResult<String> {
    let out = urlencoding::decode(s)
        .map_err(|e| StoreError::validation(format!("bad {} '{}': {}", what, s, e)))?
        .into_owned();
    if out.is_empty() {
        return Err(StoreError::validation(format!("{} cannot be empty", what)));
    }
    Ok(out)
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}:{}", self.source.as_str(), encode_component(&self.owner), encode_component(&self.name))?;
        if let Some(id) = &self.record_id {
            write!(f, "/records/{}", encode_component(id))?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| StoreError::validation(format!("resource path '{}' must start with '/'", s)))?;
        let parts: Vec<&str> = rest.split('/').collect();
        let (source, dataset, record_id) = match parts.as_slice() {
            [source, dataset] => (*source, *dataset, None),
            [source, dataset, "records", id] => (*source, *dataset, Some(*id)),
            _ => return Err(StoreError::validation(format!("malformed resource path '{}'", s))),
        };
        let source: Source = source.parse()?;
        let (owner, name) = dataset
            .split_once(':')
            .ok_or_else(|| StoreError::validation(format!("resource path '{}' lacks '<owner>:<name>'", s)))?;
        Ok(ResourcePath {
            source,
            owner: decode_component(owner, "owner")?,
            name: decode_component(name, "name")?,
            record_id: record_id.map(|id| decode_component(id, "record id")).transpose()?,
        })
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
