//! Core types shared by the engine and the store/cache contracts.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Plain document fields.
pub type DocumentData = serde_json::Map<String, Value>;

/// Identity of a remote store instance (one per app/database pair).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreInstanceId(pub String);

impl fmt::Debug for StoreInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreInstanceId({})", self.0)
    }
}

impl fmt::Display for StoreInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a reference points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Document,
    Collection,
    Query,
}

/// Opaque handle to "what to query".
///
/// Only the remote store interprets `params`; the engine passes the
/// reference through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRef {
    pub kind: RefKind,
    pub path: String,
    /// Store-specific constraints (filters, ordering, cursors, limits).
    #[serde(default)]
    pub params: Value,
}

impl QueryRef {
    pub fn document(path: impl Into<String>) -> Self {
        Self {
            kind: RefKind::Document,
            path: path.into(),
            params: Value::Null,
        }
    }

    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            kind: RefKind::Collection,
            path: path.into(),
            params: Value::Null,
        }
    }

    pub fn query(path: impl Into<String>, params: Value) -> Self {
        Self {
            kind: RefKind::Query,
            path: path.into(),
            params,
        }
    }
}

/// A reference, either direct or resolved later by name.
#[derive(Clone, Debug, PartialEq)]
pub enum Reference {
    Direct(QueryRef),
    /// Resolved through the named-query resolver on first use.
    Named(String),
}

impl Reference {
    pub fn named(name: impl Into<String>) -> Self {
        Reference::Named(name.into())
    }
}

impl From<QueryRef> for Reference {
    fn from(reference: QueryRef) -> Self {
        Reference::Direct(reference)
    }
}

/// Metadata attached to every snapshot by the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub from_cache: bool,
    pub has_pending_writes: bool,
}

/// A single document as reported by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: String,
    pub path: String,
    /// `None` when the document does not exist.
    pub data: Option<DocumentData>,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }
}

/// Result of a collection or query read, in source order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySnapshot {
    pub documents: Vec<DocumentSnapshot>,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }
}

/// Raw store result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Snapshot {
    Document(DocumentSnapshot),
    Query(QuerySnapshot),
}

impl Snapshot {
    pub fn metadata(&self) -> SnapshotMetadata {
        match self {
            Snapshot::Document(doc) => doc.metadata,
            Snapshot::Query(query) => query.metadata,
        }
    }
}

/// Normalized result written to the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum ResultSnapshot {
    /// Full snapshot with metadata and identifiers.
    Raw(Snapshot),
    /// Plain records in source order.
    Extracted(Vec<DocumentData>),
}

impl ResultSnapshot {
    /// Extracted records, or `None` for a raw snapshot.
    pub fn records(&self) -> Option<&[DocumentData]> {
        match self {
            ResultSnapshot::Extracted(records) => Some(records),
            ResultSnapshot::Raw(_) => None,
        }
    }

    /// Number of documents in the result.
    pub fn len(&self) -> usize {
        match self {
            ResultSnapshot::Extracted(records) => records.len(),
            ResultSnapshot::Raw(Snapshot::Query(query)) => query.len(),
            ResultSnapshot::Raw(Snapshot::Document(doc)) => usize::from(doc.exists()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a one-shot read may be served from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Server when reachable, local cache otherwise.
    #[default]
    Default,
    /// Local cache only.
    Cache,
    /// Server only.
    Server,
}

/// Which form results take in the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    Raw,
    #[default]
    Extracted,
}

/// Per-query mode configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Keep a live listener instead of reading once.
    pub subscribe: bool,

    /// Source preference for one-shot reads.
    pub source: Source,

    /// Deliver metadata-only changes to live listeners.
    pub include_metadata_changes: bool,

    pub shape: ResultShape,

    /// Field that receives the document id in extracted records.
    pub id_field: Option<String>,
}

impl QueryOptions {
    /// Options for a live listener.
    pub fn live() -> Self {
        Self {
            subscribe: true,
            ..Default::default()
        }
    }

    pub fn raw(mut self) -> Self {
        self.shape = ResultShape::Raw;
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    /// Reject combinations that can only be a programmer error.
    pub fn validate(&self) -> Result<()> {
        if self.subscribe && self.source != Source::Default {
            return Err(SyncError::InvalidOptions(format!(
                "source {:?} only applies to one-shot reads",
                self.source
            )));
        }

        if let Some(field) = &self.id_field {
            if self.shape == ResultShape::Raw {
                return Err(SyncError::InvalidOptions(
                    "id_field requires extracted results".to_string(),
                ));
            }
            if field.is_empty() {
                return Err(SyncError::InvalidOptions(
                    "id_field must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert!(QueryOptions::default().validate().is_ok());
        assert!(QueryOptions::live().with_id_field("_id").validate().is_ok());
    }

    #[test]
    fn test_live_with_source_is_rejected() {
        let options = QueryOptions::live().with_source(Source::Server);
        assert!(matches!(
            options.validate(),
            Err(SyncError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_id_field_with_raw_shape_is_rejected() {
        let options = QueryOptions::default().raw().with_id_field("id");
        assert!(matches!(
            options.validate(),
            Err(SyncError::InvalidOptions(_))
        ));

        let options = QueryOptions::default().with_id_field("");
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: QueryOptions =
            serde_json::from_str(r#"{"subscribe": true, "id_field": "uid"}"#).unwrap();

        assert!(options.subscribe);
        assert_eq!(options.source, Source::Default);
        assert_eq!(options.shape, ResultShape::Extracted);
        assert_eq!(options.id_field.as_deref(), Some("uid"));
    }
}
