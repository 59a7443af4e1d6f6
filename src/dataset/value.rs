//! Record payloads.
//!
//! A record is a tree of `RecordValue`s. Attachments appear in two forms:
//! `Attachment` carries inline bytes and exists only on the way in (the store
//! writes the bytes to the attachment registry and swaps the node for an
//! `AttachmentRef`); `AttachmentRef` is what is persisted. Hash-URLs written
//! inside text scalars count as references too.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::attachments::HashUrl;
use crate::error::{StoreError, StoreResult};
use crate::storage::Hash;

pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordValue {
    Attachment { data: Vec<u8>, mime_type: String },
    AttachmentRef(HashUrl),
    Sequence(Vec<RecordValue>),
    Mapping(Vec<(RecordValue, RecordValue)>),
    Set(Vec<RecordValue>),
    Record(BTreeMap<String, RecordValue>),
    Scalar(Scalar),
}

impl RecordValue {
    pub fn text<S: Into<String>>(s: S) -> Self { RecordValue::Scalar(Scalar::Text(s.into())) }
    pub fn integer(i: i64) -> Self { RecordValue::Scalar(Scalar::Integer(i)) }
    pub fn null() -> Self { RecordValue::Scalar(Scalar::Null) }

    pub fn attachment<M: Into<String>>(data: Vec<u8>, mime_type: M) -> Self {
        RecordValue::Attachment { data, mime_type: mime_type.into() }
    }

    pub fn record<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, RecordValue)>,
        K: Into<String>,
    {
        RecordValue::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Shape checks applied before a record is stored.
    pub fn validate(&self) -> StoreResult<()> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> StoreResult<()> {
        if depth > MAX_DEPTH {
            return Err(StoreError::validation(format!("record nesting exceeds {} levels", MAX_DEPTH)));
        }
        match self {
            RecordValue::Attachment { mime_type, .. } => {
                if mime_type.trim().is_empty() {
                    return Err(StoreError::validation("inline attachment needs a mime type"));
                }
            }
            RecordValue::AttachmentRef(_) => {}
            RecordValue::Sequence(items) | RecordValue::Set(items) => {
                for v in items {
                    v.validate_at(depth + 1)?;
                }
            }
            RecordValue::Mapping(pairs) => {
                for (k, v) in pairs {
                    if matches!(k, RecordValue::Attachment { .. }) {
                        return Err(StoreError::validation("mapping keys cannot be inline attachments"));
                    }
                    k.validate_at(depth + 1)?;
                    v.validate_at(depth + 1)?;
                }
            }
            RecordValue::Record(fields) => {
                for v in fields.values() {
                    v.validate_at(depth + 1)?;
                }
            }
            RecordValue::Scalar(Scalar::Float(f)) if !f.is_finite() => {
                return Err(StoreError::validation("floats must be finite"));
            }
            RecordValue::Scalar(_) => {}
        }
        Ok(())
    }

    /// Every attachment hash this value references, via refs or hash-URLs in text.
    pub fn references(&self) -> BTreeSet<Hash> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut BTreeSet<Hash>) {
        match self {
            RecordValue::AttachmentRef(url) => {
                out.insert(url.hash);
            }
            RecordValue::Scalar(Scalar::Text(s)) => {
                out.extend(HashUrl::find_all(s).into_iter().map(|u| u.hash));
            }
            RecordValue::Sequence(items) | RecordValue::Set(items) => {
                for v in items {
                    v.collect_references(out);
                }
            }
            RecordValue::Mapping(pairs) => {
                for (k, v) in pairs {
                    k.collect_references(out);
                    v.collect_references(out);
                }
            }
            RecordValue::Record(fields) => {
                for v in fields.values() {
                    v.collect_references(out);
                }
            }
            RecordValue::Attachment { .. } | RecordValue::Scalar(_) => {}
        }
    }

    /// Mutable handles to every inline `Attachment` node, depth first.
    pub fn inline_attachments_mut(&mut self) -> Vec<&mut RecordValue> {
        let mut out = Vec::new();
        collect_inline(self, &mut out);
        out
    }
}

fn collect_inline<'a>(value: &'a mut RecordValue, out: &mut Vec<&'a mut RecordValue>) {
    if matches!(value, RecordValue::Attachment { .. }) {
        out.push(value);
        return;
    }
    match value {
        RecordValue::Sequence(items) | RecordValue::Set(items) => {
            for v in items.iter_mut() {
                collect_inline(v, out);
            }
        }
        RecordValue::Mapping(pairs) => {
            for (k, v) in pairs.iter_mut() {
                collect_inline(k, out);
                collect_inline(v, out);
            }
        }
        RecordValue::Record(fields) => {
            for v in fields.values_mut() {
                collect_inline(v, out);
            }
        }
        RecordValue::Attachment { .. } | RecordValue::AttachmentRef(_) | RecordValue::Scalar(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_cover_refs_and_text_urls() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let v = RecordValue::record([
            ("img", RecordValue::AttachmentRef(HashUrl::new(a, "image/png"))),
            (
                "body",
                RecordValue::Sequence(vec![RecordValue::text(format!("<p>hash://sha256/{}?type=text%2Fplain</p>", b))]),
            ),
            ("n", RecordValue::integer(3)),
        ]);
        assert_eq!(v.references().into_iter().collect::<Vec<_>>(), {
            let mut e = vec![a, b];
            e.sort();
            e
        });
    }

    #[test]
    fn inline_attachments_can_be_swapped() {
        let mut v = RecordValue::Mapping(vec![(
            RecordValue::text("k"),
            RecordValue::Set(vec![RecordValue::attachment(b"x".to_vec(), "text/plain")]),
        )]);
        let h = Hash::digest(b"x");
        for node in v.inline_attachments_mut() {
            *node = RecordValue::AttachmentRef(HashUrl::new(h, "text/plain"));
        }
        assert!(v.inline_attachments_mut().is_empty());
        assert!(v.references().contains(&h));
    }

    #[test]
    fn validation_rules() {
        assert!(RecordValue::Scalar(Scalar::Float(f64::NAN)).validate().is_err());
        assert!(RecordValue::attachment(vec![], "").validate().is_err());
        let key_attach = RecordValue::Mapping(vec![(RecordValue::attachment(vec![1], "a/b"), RecordValue::null())]);
        assert!(key_attach.validate().is_err());
        let mut deep = RecordValue::null();
        for _ in 0..(MAX_DEPTH + 2) {
            deep = RecordValue::Sequence(vec![deep]);
        }
        assert!(deep.validate().is_err());
        assert!(RecordValue::record([("ok", RecordValue::integer(1))]).validate().is_ok());
    }

    #[test]
    fn ref_serializes_as_url_string() {
        let h = Hash::digest(b"s");
        let v = RecordValue::AttachmentRef(HashUrl::new(h, "image/png"));
        let j = serde_json::to_string(&v).unwrap();
        assert_eq!(j, format!("{{\"AttachmentRef\":\"hash://sha256/{}?type=image%2Fpng\"}}", h));
    }
}
