//! Chunk records: the unit that is embedded, stored, persisted, and ranked.
//!
//! Metadata keeps the handful of fields the store itself reads as typed fields and
//! passes everything else through untouched, so records written by other tools
//! survive a load/save cycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

pub const SOURCE_FILE: &str = "sourceFile";
pub const IMPORTED_AT: &str = "importedAt";
pub const WORD_COUNT: &str = "wordCount";
pub const CHUNK_INDEX: &str = "chunkIndex";

/// A scalar, list, or nested map value attached to a record by upstream stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl From<u64> for MetadataValue {
    fn from(n: u64) -> Self {
        MetadataValue::Number(n.into())
    }
}

impl From<i64> for MetadataValue {
    fn from(n: i64) -> Self {
        MetadataValue::Number(n.into())
    }
}

/// Non-finite floats have no JSON representation and become `Null`.
impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(MetadataValue::Null, MetadataValue::Number)
    }
}

impl From<serde_json::Value> for MetadataValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => MetadataValue::Null,
            serde_json::Value::Bool(b) => MetadataValue::Bool(b),
            serde_json::Value::Number(n) => MetadataValue::Number(n),
            serde_json::Value::String(s) => MetadataValue::Text(s),
            serde_json::Value::Array(items) => {
                MetadataValue::List(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                MetadataValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Record metadata. `sourceFile`, `importedAt`, `wordCount`, and `chunkIndex` are
/// typed; any other key lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, MetadataValue>,
}

impl Metadata {
    /// Looks up a field by its serialized name, typed or passthrough.
    pub fn get(&self, key: &str) -> Option<MetadataValue> {
        match key {
            SOURCE_FILE => self.source_file.as_deref().map(MetadataValue::from),
            IMPORTED_AT => self.imported_at.as_deref().map(MetadataValue::from),
            WORD_COUNT => self.word_count.map(MetadataValue::from),
            CHUNK_INDEX => self.chunk_index.map(MetadataValue::from),
            _ => self.extra.get(key).cloned(),
        }
    }

    /// Adds a passthrough field. Typed keys are left untouched and `false` is returned.
    pub fn insert_extra(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> bool {
        let key = key.into();
        if is_typed_key(&key) {
            return false;
        }
        self.extra.insert(key, value.into());
        true
    }

    /// True when every `(key, value)` in `filter` is present with an equal value.
    pub fn matches(&self, filter: &MetadataFilter) -> bool {
        filter
            .iter()
            .all(|(key, expected)| self.get(key).as_ref() == Some(expected))
    }
}

fn is_typed_key(key: &str) -> bool {
    matches!(key, SOURCE_FILE | IMPORTED_AT | WORD_COUNT | CHUNK_INDEX)
}

/// Exact-match predicates over metadata fields, combined with AND.
pub type MetadataFilter = BTreeMap<String, MetadataValue>;

/// An embedded chunk of document text. Serialized as `{id, text, embedding, metadata}`.
///
/// Missing fields deserialize to empty values so that the store can reject them
/// with a [`ValidationError`] instead of failing the whole payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub embedding: Vec<f32>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl ChunkRecord {
    pub fn new(id: impl Into<String>, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            embedding,
            metadata: Metadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Name of the originating file, if the record carries one.
    pub fn source(&self) -> Option<&str> {
        self.metadata.source_file.as_deref()
    }

    /// Checks the fields the store requires before accepting a record.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingId);
        }
        if self.text.is_empty() {
            return Err(ValidationError::MissingText { id: self.id.clone() });
        }
        if self.embedding.is_empty() {
            return Err(ValidationError::MissingEmbedding { id: self.id.clone() });
        }
        if let Some(position) = self.embedding.iter().position(|x| !x.is_finite()) {
            return Err(ValidationError::NonFiniteEmbedding {
                id: self.id.clone(),
                position,
            });
        }
        Ok(())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("record has no id")]
    MissingId,
    #[error("record {id} has no text")]
    MissingText { id: String },
    #[error("record {id} has no embedding")]
    MissingEmbedding { id: String },
    #[error("record {id} has a non-finite embedding value at position {position}")]
    NonFiniteEmbedding { id: String, position: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_complete_record() {
        let r = ChunkRecord::new("a", "text", vec![1.0, 0.0]);
        assert_eq!(r.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert_eq!(
            ChunkRecord::new("", "text", vec![1.0]).validate(),
            Err(ValidationError::MissingId)
        );
        assert!(matches!(
            ChunkRecord::new("a", "", vec![1.0]).validate(),
            Err(ValidationError::MissingText { .. })
        ));
        assert!(matches!(
            ChunkRecord::new("a", "t", vec![]).validate(),
            Err(ValidationError::MissingEmbedding { .. })
        ));
    }

    #[test]
    fn validate_rejects_non_finite_values() {
        let r = ChunkRecord::new("a", "t", vec![0.5, f32::NAN]);
        assert_eq!(
            r.validate(),
            Err(ValidationError::NonFiniteEmbedding {
                id: "a".into(),
                position: 1
            })
        );
    }

    #[test]
    fn metadata_keeps_unknown_fields() {
        let json = r#"{
            "sourceFile": "report.pdf",
            "wordCount": 42,
            "documentType": "Report",
            "keywords": ["audit", "finance"],
            "contentFeatures": {"hasTables": true}
        }"#;
        let m: Metadata = serde_json::from_str(json).unwrap();
        assert_eq!(m.source_file.as_deref(), Some("report.pdf"));
        assert_eq!(m.word_count, Some(42));
        assert_eq!(m.get("documentType"), Some(MetadataValue::from("Report")));
        assert!(matches!(m.get("keywords"), Some(MetadataValue::List(ref v)) if v.len() == 2));

        let back: Metadata = serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn missing_fields_deserialize_as_empty() {
        let r: ChunkRecord = serde_json::from_str(r#"{"id": "x", "metadata": null}"#).unwrap();
        assert_eq!(r.text, "");
        assert!(r.embedding.is_empty());
        assert_eq!(r.metadata, Metadata::default());
        assert!(r.validate().is_err());
    }

    #[test]
    fn filter_matches_typed_and_extra_fields() {
        let mut m = Metadata {
            source_file: Some("a.txt".into()),
            ..Metadata::default()
        };
        m.insert_extra("documentType", "Report");

        let mut filter = MetadataFilter::new();
        filter.insert(SOURCE_FILE.into(), "a.txt".into());
        assert!(m.matches(&filter));
        filter.insert("documentType".into(), "Report".into());
        assert!(m.matches(&filter));
        filter.insert("missing".into(), true.into());
        assert!(!m.matches(&filter));
    }

    #[test]
    fn insert_extra_refuses_typed_keys() {
        let mut m = Metadata::default();
        assert!(!m.insert_extra(WORD_COUNT, 3u64));
        assert!(m.extra.is_empty());
    }
}
