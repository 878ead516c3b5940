use std::time::{SystemTime, UNIX_EPOCH};

use crate::primitives::bytes::buf::Reader;
use crate::primitives::bytes::ord;
use crate::types::{ArbolError, CollectionId, DocId, Result};

/// Path of the collection every other collection descends from.
pub const ROOT_COLLECTION: &str = "/db";

const COLLECTION_RECORD_LEN: usize = 12;

/// Value stored in the collections tree under a collection path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CollectionRecord {
    /// Id used as the prefix of the collection's document keys.
    pub id: CollectionId,
    /// Creation time, seconds since the Unix epoch.
    pub created: u64,
}

impl CollectionRecord {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COLLECTION_RECORD_LEN);
        ord::put_u32(&mut out, self.id.0);
        ord::put_u64(&mut out, self.created);
        out
    }

    pub(crate) fn decode(value: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(value, "collection record");
        Ok(Self {
            id: CollectionId(reader.u32()?),
            created: reader.u64()?,
        })
    }
}

/// Value stored in the documents tree under `collection id ++ name`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DocumentRecord {
    /// Id keying the document's nodes in the node file.
    pub id: DocId,
    /// Number of stored nodes.
    pub nodes: u64,
    /// Node id the next appended node receives.
    pub next_node: u64,
    /// Creation time, seconds since the Unix epoch.
    pub created: u64,
    /// Last modification time, seconds since the Unix epoch.
    pub modified: u64,
}

impl DocumentRecord {
    pub(crate) fn new(id: DocId) -> Self {
        let now = unix_now();
        Self {
            id,
            nodes: 0,
            next_node: 1,
            created: now,
            modified: now,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36);
        ord::put_u32(&mut out, self.id.0);
        ord::put_u64(&mut out, self.nodes);
        ord::put_u64(&mut out, self.next_node);
        ord::put_u64(&mut out, self.created);
        ord::put_u64(&mut out, self.modified);
        out
    }

    pub(crate) fn decode(value: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(value, "document record");
        Ok(Self {
            id: DocId(reader.u32()?),
            nodes: reader.u64()?,
            next_node: reader.u64()?,
            created: reader.u64()?,
            modified: reader.u64()?,
        })
    }
}

/// A collection as seen by callers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Collection {
    /// Normalized path.
    pub path: String,
    /// Stored record.
    pub record: CollectionRecord,
}

/// A document as seen by callers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Document {
    /// Path of the owning collection.
    pub collection: String,
    /// Name inside the collection.
    pub name: String,
    /// Stored record.
    pub record: DocumentRecord,
}

impl Document {
    /// Full document path.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.name)
    }
}

/// Documents tree key.
pub(crate) fn document_key(collection: CollectionId, name: &str) -> Vec<u8> {
    ord::compound_u32(collection.0, name.as_bytes())
}

/// Normalizes a collection path: collapses repeated slashes, drops a trailing
/// slash and requires the `/db` root.
pub fn normalize_collection_path(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len());
    for part in path.split('/').filter(|p| !p.is_empty()) {
        check_segment(part)?;
        out.push('/');
        out.push_str(part);
    }
    if out != ROOT_COLLECTION && !out.starts_with("/db/") {
        return Err(ArbolError::InvalidOwned(format!(
            "collection path {path:?} is outside {ROOT_COLLECTION}"
        )));
    }
    Ok(out)
}

/// Splits a document path into its normalized collection path and name.
pub fn split_document_path(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let Some(cut) = trimmed.rfind('/') else {
        return Err(ArbolError::InvalidOwned(format!("document path {path:?} has no collection")));
    };
    let name = &trimmed[cut + 1..];
    check_segment(name)?;
    Ok((normalize_collection_path(&trimmed[..cut])?, name.to_string()))
}

/// Parent of a normalized collection path, `None` for the root.
pub fn parent_collection(path: &str) -> Option<&str> {
    if path == ROOT_COLLECTION {
        return None;
    }
    path.rfind('/').map(|cut| &path[..cut])
}

fn check_segment(part: &str) -> Result<()> {
    if part.is_empty() || part == "." || part == ".." || part.len() > u16::MAX as usize {
        return Err(ArbolError::InvalidOwned(format!("invalid path segment {part:?}")));
    }
    if part.chars().any(char::is_control) {
        return Err(ArbolError::InvalidOwned(format!(
            "path segment {part:?} contains control characters"
        )));
    }
    Ok(())
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
