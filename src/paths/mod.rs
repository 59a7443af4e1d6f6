//! Data paths and their mapping onto the filesystem.
//!
//! A `DataPath` is an ordered list of logical segments. On disk every segment is
//! NFC-normalized and percent-encoded with `.` always escaped, so no segment can
//! introduce a separator, a `..` hop, or collide with the `<ext>`/`.backup`
//! suffixes the file layer appends. Resolution is then checked against the jail
//! root component-wise and fails closed.

use std::fmt;
use std::path::{Path, PathBuf};

use path_absolutize::Absolutize;
use unicode_normalization::UnicodeNormalization;

use crate::error::{StoreError, StoreResult};

pub mod resource;

pub use resource::{ResourcePath, Source};

/// Longest escaped segment we will put on disk; leaves room for extension,
/// `.backup` and temp suffixes under common 255-byte name limits.
pub const MAX_ESCAPED_SEGMENT: usize = 180;

/// Normalize a UTF-8 string to NFC.
pub fn normalize_nfc(input: &str) -> String {
    input.nfc().collect::<String>()
}

/// Validate one logical segment: non-empty, no NUL, bounded once escaped.
pub fn validate_segment(segment: &str) -> StoreResult<()> {
    if segment.is_empty() {
        return Err(StoreError::validation("path segment cannot be empty"));
    }
    if segment.chars().any(|c| c == '\u{0000}') {
        return Err(StoreError::validation("path segment cannot contain NUL characters"));
    }
    if escape_segment(segment).len() > MAX_ESCAPED_SEGMENT {
        return Err(StoreError::validation(format!("path segment too long ({} bytes)", segment.len())));
    }
    Ok(())
}

/// Percent-encode a segment for use as a file or directory name.
pub fn escape_segment(segment: &str) -> String {
    urlencoding::encode(&normalize_nfc(segment)).replace('.', "%2E")
}

/// Inverse of [`escape_segment`].
pub fn unescape_segment(name: &str) -> StoreResult<String> {
    urlencoding::decode(name)
        .map(|s| s.into_owned())
        .map_err(|e| StoreError::validation(format!("bad escaped name '{}': {}", name, e)))
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DataPath {
    segments: Vec<String>,
}

impl DataPath {
    /// The empty path (the jail root itself).
    pub fn root() -> Self { Self::default() }

    pub fn new<I, S>(segments: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for s in segments {
            let s = s.as_ref();
            validate_segment(s)?;
            out.push(normalize_nfc(s));
        }
        Ok(Self { segments: out })
    }

    /// Append one segment.
    pub fn child<S: AsRef<str>>(&self, segment: S) -> StoreResult<Self> {
        let s = segment.as_ref();
        validate_segment(s)?;
        let mut segments = self.segments.clone();
        segments.push(normalize_nfc(s));
        Ok(Self { segments })
    }

    /// Append all segments of `other`.
    pub fn join(&self, other: &DataPath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] { &self.segments }

    pub fn is_root(&self) -> bool { self.segments.is_empty() }

    pub fn last(&self) -> Option<&str> { self.segments.last().map(|s| s.as_str()) }

    pub fn parent(&self) -> Option<DataPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self { segments: self.segments[..self.segments.len() - 1].to_vec() })
    }

    /// Directory form: `<root>/<seg>/<seg>/...` (no extension).
    pub fn to_dir(&self, root: &Path) -> StoreResult<PathBuf> {
        let mut p = root.to_path_buf();
        for s in &self.segments {
            p.push(escape_segment(s));
        }
        ensure_in_jail(root, &p)?;
        Ok(p)
    }

    /// File form: `<root>/<seg>/.../<last><ext>`.
    pub fn to_file(&self, root: &Path, ext: &str) -> StoreResult<PathBuf> {
        let last = self
            .segments
            .last()
            .ok_or_else(|| StoreError::validation("the root path cannot name a file"))?;
        let mut p = root.to_path_buf();
        for s in &self.segments[..self.segments.len() - 1] {
            p.push(escape_segment(s));
        }
        p.push(format!("{}{}", escape_segment(last), ext));
        ensure_in_jail(root, &p)?;
        Ok(p)
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for s in &self.segments {
            write!(f, "/{}", escape_segment(s))?;
        }
        Ok(())
    }
}

impl fmt::Debug for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "DataPath({})", self) }
}

/// Normalize a path to an absolute form without resolving symlinks.
pub fn normalize_abs_path(p: &Path) -> StoreResult<PathBuf> {
    p.absolutize()
        .map(|c| c.to_path_buf())
        .map_err(|e| StoreError::io(format!("absolutize {}", p.display()), e))
}

/// Fail with `PathSecurity` unless `candidate` lies inside `root`.
/// Compared component-wise so `/data2` is not inside `/data`.
pub fn ensure_in_jail(root: &Path, candidate: &Path) -> StoreResult<()> {
    let root_abs = normalize_abs_path(root)?;
    let cand_abs = normalize_abs_path(candidate)?;
    if cand_abs.starts_with(&root_abs) {
        Ok(())
    } else {
        Err(StoreError::path_security(format!(
            "'{}' resolves outside of '{}'",
            candidate.display(),
            root.display()
        )))
    }
}
