//! Append-only learning log
//!
//! Reviewer corrections and classification events are recorded here and
//! read back to bias future mapping and classification for the tenant.

mod memory;

pub use memory::MemoryLearningLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::schema::{CanonicalField, DocType};

/// A reviewer's verdict on a header → field mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFeedback {
    pub tenant_id: String,
    pub doc_type: DocType,
    pub source_header: String,
    pub field: CanonicalField,
    pub correct: bool,
    pub recorded_at: DateTime<Utc>,
}

/// A document type corrected by a reviewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Misclassification {
    pub tenant_id: String,
    pub batch_id: Uuid,
    pub item_index: u32,
    pub original: DocType,
    pub corrected: DocType,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Every classification made, the denominator for tenant accuracy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationEvent {
    pub tenant_id: String,
    pub batch_id: Uuid,
    pub item_index: u32,
    pub doc_type: DocType,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Append and read access to the learning records. No updates, no deletes.
#[async_trait]
pub trait LearningLog: Send + Sync {
    async fn record_mapping_feedback(&self, feedback: MappingFeedback) -> Result<()>;

    async fn record_misclassification(&self, record: Misclassification) -> Result<()>;

    async fn record_classification(&self, event: ClassificationEvent) -> Result<()>;

    /// Feedback for a tenant, optionally restricted to one document type
    async fn mapping_feedback(
        &self,
        tenant_id: &str,
        doc_type: Option<DocType>,
    ) -> Result<Vec<MappingFeedback>>;

    async fn misclassifications(&self, tenant_id: &str) -> Result<Vec<Misclassification>>;

    async fn classification_events(&self, tenant_id: &str) -> Result<Vec<ClassificationEvent>>;
}
