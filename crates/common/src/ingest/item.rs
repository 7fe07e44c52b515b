use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::lineage::Lineage;
use super::status::{ItemStatus, Stage};
use crate::schema::CanonicalDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Weight subtracted from validation confidence
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Warning => 0.1,
            Severity::Error => 0.5,
            Severity::Critical => 1.0,
        }
    }
}

/// A structured problem attached to an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

impl FieldError {
    pub fn new(
        field: Option<&str>,
        code: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            field: field.map(str::to_string),
            code: code.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn error(field: &str, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Some(field), code, message, Severity::Error)
    }
}

/// The original binary a document-type item was created from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub file_name: String,
    pub mime_type: String,
    /// Kept out of JSON views; persisted in its own column
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// One document or row moving through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub tenant_id: String,
    /// Insertion order within the batch
    pub position: u32,
    /// Row index within the source file
    pub source_index: u32,
    pub idempotency_key: String,
    pub raw: Map<String, Value>,
    pub document: Option<SourceDocument>,
    pub normalized: Option<CanonicalDocument>,
    pub status: ItemStatus,
    #[serde(default)]
    pub errors: Vec<FieldError>,
    pub content_hash: Option<String>,
    pub promoted_to: Option<String>,
    pub promoted_id: Option<String>,
    /// Attempts made per stage
    #[serde(default)]
    pub attempts: BTreeMap<Stage, u32>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub lineage: Lineage,
    /// Bumped by every stored write; a writer holding an older revision loses
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(
        batch_id: Uuid,
        tenant_id: &str,
        source_index: u32,
        idempotency_key: String,
        raw: Map<String, Value>,
        document: Option<SourceDocument>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            batch_id,
            tenant_id: tenant_id.to_string(),
            position: 0,
            source_index,
            idempotency_key,
            raw,
            document,
            normalized: None,
            status: ItemStatus::Pending,
            errors: Vec::new(),
            content_hash: None,
            promoted_to: None,
            promoted_id: None,
            attempts: BTreeMap::new(),
            last_error: None,
            lineage: Lineage::default(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub fn has_critical_error(&self) -> bool {
        self.errors.iter().any(|e| e.severity == Severity::Critical)
    }

    /// Idempotency key for the `index`-th record of `source_file`
    pub fn idempotency_key_for(tenant_id: &str, source_file: &str, index: u32) -> String {
        format!("{}:{}:{}", tenant_id, source_file, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_format() {
        assert_eq!(
            Item::idempotency_key_for("t1", "march.xlsx", 4),
            "t1:march.xlsx:4"
        );
    }

    #[test]
    fn test_document_bytes_stay_out_of_json() {
        let doc = SourceDocument {
            file_name: "scan.pdf".into(),
            mime_type: "application/pdf".into(),
            bytes: vec![1, 2, 3],
        };
        let item = Item::new(Uuid::now_v7(), "t1", 0, "t1:scan.pdf:0".into(), Map::new(), Some(doc));
        let json = serde_json::to_value(&item).unwrap();
        assert!(json["document"].get("bytes").is_none());
        assert_eq!(json["status"], "PENDING");
    }

    #[test]
    fn test_severity_weights() {
        assert!(Severity::Warning.weight() < Severity::Error.weight());
        assert_eq!(Severity::Critical.weight(), 1.0);
    }
}
