//! Snapshot normalization.
//!
//! Converts raw store snapshots into the canonical shape written to the
//! cache. Runs before any selection transform the cache applies.

use crate::types::{
    DocumentData, DocumentSnapshot, QueryOptions, ResultShape, ResultSnapshot, Snapshot,
};
use serde_json::Value;

/// How a snapshot is normalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizeMode {
    Raw,
    Extracted {
        /// Field overwritten with the document id.
        id_field: Option<String>,
    },
}

impl From<&QueryOptions> for NormalizeMode {
    fn from(options: &QueryOptions) -> Self {
        match options.shape {
            ResultShape::Raw => NormalizeMode::Raw,
            ResultShape::Extracted => NormalizeMode::Extracted {
                id_field: options.id_field.clone(),
            },
        }
    }
}

/// Normalize a snapshot.
///
/// Extracted results contain one record per existing document in source
/// order. A missing single document and an empty query both yield an
/// empty sequence.
pub fn normalize(snapshot: Snapshot, mode: &NormalizeMode) -> ResultSnapshot {
    let id_field = match mode {
        NormalizeMode::Raw => return ResultSnapshot::Raw(snapshot),
        NormalizeMode::Extracted { id_field } => id_field.as_deref(),
    };

    let records = match snapshot {
        Snapshot::Document(doc) => extract(doc, id_field).into_iter().collect(),
        Snapshot::Query(query) => query
            .documents
            .into_iter()
            .filter_map(|doc| extract(doc, id_field))
            .collect(),
    };

    ResultSnapshot::Extracted(records)
}

fn extract(doc: DocumentSnapshot, id_field: Option<&str>) -> Option<DocumentData> {
    let mut data = doc.data?;
    if let Some(field) = id_field {
        // The document id always wins over a stored field of the same name.
        data.insert(field.to_string(), Value::String(doc.id));
    }
    Some(data)
}
