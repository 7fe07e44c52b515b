//! Ingestion service
//!
//! The operations callers use: open a batch, feed it rows or files, watch
//! its progress, correct items under review, promote, export errors and
//! cancel. Reviewer corrections are written to the learning log on the way.

use chrono::Utc;
use ledgerforge_common::errors::{AppError, Result};
use ledgerforge_common::ingest::{
    Batch, BatchStatus, Classification, FieldError, FieldMapping, Item, ItemStatus, NewBatch,
    Severity, SourceDocument, Stage,
};
use ledgerforge_common::learning::{LearningLog, MappingFeedback, Misclassification};
use ledgerforge_common::schema::{values::text_from_value, CanonicalField, DocType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::mapping::{rederive, INVALID_VALUE};
use crate::parser::{detect_mime, is_binary_document, RawRow};
use crate::pipeline::{Pipeline, StageOutcome, BATCH_CANCELLED};
use crate::worker::WorkQueue;

/// Statuses a reviewer may patch from
const PATCHABLE: [ItemStatus; 4] = [
    ItemStatus::Validated,
    ItemStatus::NeedsReview,
    ItemStatus::Rejected,
    ItemStatus::ValidationFailed,
];

/// Statuses with no stage running and more work possible
const IDLE: [ItemStatus; 7] = [
    ItemStatus::Pending,
    ItemStatus::Preprocessed,
    ItemStatus::OcrCompleted,
    ItemStatus::Extracted,
    ItemStatus::Mapped,
    ItemStatus::Validated,
    ItemStatus::NeedsReview,
];

const REVIEWER: &str = "reviewer";

/// What is being added to a batch
#[derive(Debug, Clone)]
pub enum IngestPayload {
    /// Records already split into rows, e.g. from an API caller
    Rows {
        source: Option<String>,
        rows: Vec<RawRow>,
    },
    /// An uploaded file; tabular files become one item per row
    File {
        file_name: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
}

/// A reviewer correction of one canonical field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPatch {
    pub field: String,
    pub value: Value,
    /// Source header the value should have come from
    #[serde(default)]
    pub source_header: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total: usize,
    /// Item count per status
    pub counts: BTreeMap<String, usize>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionSummary {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct IngestionService {
    pipeline: Arc<Pipeline>,
    learning: Arc<dyn LearningLog>,
    queue: Option<WorkQueue>,
    concurrency: usize,
}

impl IngestionService {
    pub fn new(pipeline: Arc<Pipeline>, learning: Arc<dyn LearningLog>) -> Self {
        Self {
            pipeline,
            learning,
            queue: None,
            concurrency: 4,
        }
    }

    /// Hand new work to background workers instead of waiting for callers
    pub fn with_queue(mut self, queue: WorkQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    async fn load_batch(&self, id: Uuid) -> Result<Batch> {
        self.pipeline
            .store()
            .find_batch(id)
            .await?
            .ok_or_else(|| AppError::BatchNotFound { id: id.to_string() })
    }

    async fn load_item(&self, id: Uuid) -> Result<Item> {
        self.pipeline
            .store()
            .find_item(id)
            .await?
            .ok_or_else(|| AppError::ItemNotFound { id: id.to_string() })
    }

    fn ensure_mutable(batch: &Batch) -> Result<()> {
        if batch.is_cancelled() {
            return Err(AppError::BatchCancelled {
                id: batch.id.to_string(),
            });
        }
        if batch.status == BatchStatus::Promoted {
            return Err(AppError::BatchPromoted {
                id: batch.id.to_string(),
            });
        }
        Ok(())
    }

    async fn enqueue(&self, ids: &[Uuid]) {
        if let Some(ref queue) = self.queue {
            for id in ids {
                if let Err(e) = queue.submit(*id).await {
                    warn!(item_id = %id, error = %e, "Failed to enqueue item");
                }
            }
        }
    }

    #[instrument(skip(self, req), fields(tenant = %req.tenant_id))]
    pub async fn create_batch(&self, req: NewBatch) -> Result<Uuid> {
        req.validate().map_err(|e| AppError::Validation {
            message: e.to_string(),
            field: None,
        })?;
        let batch = Batch::from_request(req);
        self.pipeline.store().insert_batch(&batch).await?;
        info!(batch_id = %batch.id, source_type = %batch.source_type, "Batch created");
        Ok(batch.id)
    }

    /// Add items to a batch. Records already ingested under the same
    /// idempotency key resolve to the existing item.
    #[instrument(skip(self, payload))]
    pub async fn ingest(&self, batch_id: Uuid, payload: IngestPayload) -> Result<Vec<Uuid>> {
        let batch = self.load_batch(batch_id).await?;
        Self::ensure_mutable(&batch)?;

        let items = match payload {
            IngestPayload::Rows { source, rows } => {
                let source = source
                    .or_else(|| batch.file_ref.clone())
                    .unwrap_or_else(|| batch.id.to_string());
                self.row_items(&batch, &source, rows)
            }
            IngestPayload::File {
                file_name,
                mime_type,
                bytes,
            } => self.file_items(&batch, file_name, mime_type, bytes),
        };

        let inserted = self.pipeline.store().insert_items(batch.id, items).await?;
        let created: Vec<Uuid> = inserted.iter().filter(|i| i.created).map(|i| i.id).collect();
        info!(
            received = inserted.len(),
            created = created.len(),
            "Items ingested"
        );

        self.pipeline.refresh_batch(batch.id).await?;
        self.enqueue(&created).await;
        Ok(inserted.into_iter().map(|i| i.id).collect())
    }

    fn row_items(&self, batch: &Batch, source: &str, rows: Vec<RawRow>) -> Vec<Item> {
        rows.into_iter()
            .enumerate()
            .map(|(idx, row)| {
                let idx = idx as u32;
                Item::new(
                    batch.id,
                    &batch.tenant_id,
                    idx,
                    Item::idempotency_key_for(&batch.tenant_id, source, idx),
                    row,
                    None,
                )
            })
            .collect()
    }

    fn file_items(
        &self,
        batch: &Batch,
        file_name: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Vec<Item> {
        let mime = detect_mime(&bytes, mime_type.as_deref(), &file_name);
        let within_limit = bytes.len() <= self.pipeline.settings().max_file_bytes;

        if within_limit && !is_binary_document(&mime) {
            if let Some(parser) = self.pipeline.registry().parser_for(&mime) {
                match parser.parse(&file_name, &bytes) {
                    Ok(rows) if !rows.is_empty() => {
                        return self.row_items(batch, &file_name, rows);
                    }
                    Ok(_) => warn!(file = %file_name, "File has no records"),
                    Err(e) => warn!(file = %file_name, error = %e, "File could not be split into rows"),
                }
            }
        }

        // Documents, and files that failed to parse, become a single item
        let key = Item::idempotency_key_for(&batch.tenant_id, &file_name, 0);
        vec![Item::new(
            batch.id,
            &batch.tenant_id,
            0,
            key,
            RawRow::new(),
            Some(SourceDocument {
                file_name,
                mime_type: mime,
                bytes,
            }),
        )]
    }

    pub async fn get_batch_status(&self, batch_id: Uuid) -> Result<BatchSummary> {
        let batch = self.load_batch(batch_id).await?;
        let items = self.pipeline.store().list_items(batch_id).await?;

        let mut counts = BTreeMap::new();
        for item in &items {
            *counts.entry(item.status.as_str().to_string()).or_insert(0) += 1;
        }

        Ok(BatchSummary {
            batch_id,
            status: batch.status,
            total: items.len(),
            counts,
            cancelled: batch.is_cancelled(),
        })
    }

    pub async fn get_item(&self, item_id: Uuid) -> Result<Item> {
        self.load_item(item_id).await
    }

    async fn record_feedback(&self, tenant_id: &str, doc_type: DocType, header: &str, field: CanonicalField, correct: bool) {
        let feedback = MappingFeedback {
            tenant_id: tenant_id.to_string(),
            doc_type,
            source_header: header.to_string(),
            field,
            correct,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.learning.record_mapping_feedback(feedback).await {
            warn!(error = %e, "Failed to record mapping feedback");
        }
    }

    /// Apply a reviewer correction and revalidate the item
    #[instrument(skip(self, patch), fields(field = %patch.field))]
    pub async fn patch_item(&self, item_id: Uuid, patch: ItemPatch) -> Result<Item> {
        let mut item = self.load_item(item_id).await?;
        let batch = self.load_batch(item.batch_id).await?;
        Self::ensure_mutable(&batch)?;

        if !PATCHABLE.contains(&item.status) {
            return Err(AppError::InvalidTransition {
                from: item.status.to_string(),
                to: ItemStatus::Validating.to_string(),
            });
        }
        let expected = item.status;
        let field: CanonicalField = patch.field.parse()?;
        let mut doc = item.normalized.clone().ok_or_else(|| AppError::Validation {
            message: "item has no normalized document to patch".into(),
            field: Some(field.as_str().to_string()),
        })?;

        if field == CanonicalField::DocType {
            let original = doc.doc_type;
            doc.set_field(field, &patch.value)?;
            let corrected = doc.doc_type;

            if original != corrected {
                let confidence = item
                    .lineage
                    .classification
                    .as_ref()
                    .map_or(0.0, |c| c.confidence);
                let record = Misclassification {
                    tenant_id: item.tenant_id.clone(),
                    batch_id: item.batch_id,
                    item_index: item.position,
                    original,
                    corrected,
                    confidence,
                    recorded_at: Utc::now(),
                };
                if let Err(e) = self.learning.record_misclassification(record).await {
                    warn!(error = %e, "Failed to record misclassification");
                }
            }

            let classification = item.lineage.classification.get_or_insert_with(|| Classification {
                doc_type: corrected,
                confidence: 1.0,
                scores: BTreeMap::new(),
                classifier: REVIEWER.to_string(),
            });
            classification.doc_type = corrected;
            classification.confidence = 1.0;
            classification.classifier = REVIEWER.to_string();
        } else {
            doc.set_field(field, &patch.value)?;

            let previous = item.lineage.header_for(field).map(str::to_string);
            match patch.source_header {
                Some(ref header) => {
                    self.record_feedback(&item.tenant_id, doc.doc_type, header, field, true).await;
                    if let Some(ref prev) = previous {
                        if prev != header {
                            self.record_feedback(&item.tenant_id, doc.doc_type, prev, field, false).await;
                        }
                    }
                    reassign_mapping(&mut item.lineage.mappings, header, field);
                    let mappings = &item.lineage.mappings;
                    item.lineage.mapping_confidence = Some(
                        mappings.iter().map(|m| m.confidence).sum::<f64>() / mappings.len() as f64,
                    );
                }
                None => {
                    if let Some(ref prev) = previous {
                        self.record_feedback(&item.tenant_id, doc.doc_type, prev, field, true).await;
                    }
                }
            }
        }

        rederive(&mut doc, &mut item.lineage.derived, field);
        item.errors
            .retain(|e| !(e.code == INVALID_VALUE && e.field.as_deref() == Some(field.as_str())));
        item.normalized = Some(doc);

        let item = self.pipeline.revalidate(item, expected).await?;
        info!(item_id = %item.id, status = %item.status, "Item patched");
        Ok(item)
    }

    /// Reviewer approval of an item waiting in NEEDS_REVIEW
    pub async fn confirm_item(&self, item_id: Uuid) -> Result<Item> {
        let mut item = self.load_item(item_id).await?;
        let batch = self.load_batch(item.batch_id).await?;
        Self::ensure_mutable(&batch)?;

        if item.status != ItemStatus::NeedsReview {
            return Err(AppError::InvalidTransition {
                from: item.status.to_string(),
                to: ItemStatus::Validated.to_string(),
            });
        }
        let doc_type = item
            .normalized
            .as_ref()
            .map(|d| d.doc_type)
            .unwrap_or(DocType::Generic);
        if doc_type == DocType::Generic {
            return Err(AppError::Validation {
                message: "set a document type before confirming".into(),
                field: Some(CanonicalField::DocType.as_str().to_string()),
            });
        }
        if item.has_critical_error() {
            return Err(AppError::Validation {
                message: "item has critical errors".into(),
                field: None,
            });
        }

        for mapping in &item.lineage.mappings {
            if let Some(field) = mapping.field {
                self.record_feedback(&item.tenant_id, doc_type, &mapping.source_header, field, true)
                    .await;
            }
        }

        item.status = ItemStatus::Validated;
        item.updated_at = Utc::now();
        if !self
            .pipeline
            .store()
            .compare_and_set(item.id, ItemStatus::NeedsReview, &mut item)
            .await?
        {
            return Err(AppError::InvalidTransition {
                from: ItemStatus::NeedsReview.to_string(),
                to: ItemStatus::Validated.to_string(),
            });
        }
        self.pipeline.refresh_batch(item.batch_id).await?;
        if self.pipeline.settings().auto_promote {
            self.enqueue(&[item.id]).await;
        }
        Ok(item)
    }

    /// Promote every VALIDATED item of the batch
    #[instrument(skip(self))]
    pub async fn promote_batch(&self, batch_id: Uuid) -> Result<PromotionSummary> {
        let batch = self.load_batch(batch_id).await?;
        if batch.is_cancelled() {
            return Err(AppError::BatchCancelled {
                id: batch.id.to_string(),
            });
        }

        let mut summary = PromotionSummary::default();
        for item in self.pipeline.store().list_items(batch_id).await? {
            if item.status != ItemStatus::Validated {
                summary.skipped += 1;
                continue;
            }
            match self.pipeline.run_stage(Stage::Promote, item.id).await? {
                StageOutcome::Completed(_) => summary.created += 1,
                StageOutcome::Failed(_) => summary.failed += 1,
                StageOutcome::Skipped | StageOutcome::Cancelled => summary.skipped += 1,
            }
        }

        let status = self.pipeline.refresh_batch(batch_id).await?;
        info!(
            created = summary.created,
            skipped = summary.skipped,
            failed = summary.failed,
            status = %status,
            "Batch promotion finished"
        );
        Ok(summary)
    }

    /// Every item error of the batch as CSV: `idx,field,error,value`
    pub async fn export_errors(&self, batch_id: Uuid) -> Result<String> {
        self.load_batch(batch_id).await?;
        let mut out = String::from("idx,field,error,value\n");

        for item in self.pipeline.store().list_items(batch_id).await? {
            for error in &item.errors {
                let field = error.field.as_deref().unwrap_or_default();
                let value = error_value(&item, field);
                out.push_str(&format!(
                    "{},{},{},{}\n",
                    item.position,
                    escape_csv(field),
                    escape_csv(&format!("{}: {}", error.code, error.message)),
                    escape_csv(&value)
                ));
            }
        }
        Ok(out)
    }

    /// Stop a batch: idle items are rejected, running stages finish and then
    /// find the batch cancelled. Returns the number of items rejected here.
    #[instrument(skip(self))]
    pub async fn cancel_batch(&self, batch_id: Uuid) -> Result<usize> {
        let batch = self.load_batch(batch_id).await?;
        if batch.status == BatchStatus::Promoted {
            return Err(AppError::BatchPromoted {
                id: batch.id.to_string(),
            });
        }
        let store = self.pipeline.store();
        store.mark_batch_cancelled(batch_id, Utc::now()).await?;

        let mut rejected = 0;
        for mut item in store.list_items(batch_id).await? {
            if !IDLE.contains(&item.status) {
                continue;
            }
            let expected = item.status;
            item.status = ItemStatus::Rejected;
            item.errors.push(FieldError::new(
                None,
                BATCH_CANCELLED,
                "Batch was cancelled",
                Severity::Error,
            ));
            item.updated_at = Utc::now();
            if store.compare_and_set(item.id, expected, &mut item).await? {
                rejected += 1;
            }
        }

        self.pipeline.refresh_batch(batch_id).await?;
        info!(rejected, "Batch cancelled");
        Ok(rejected)
    }

    /// Drive one item inline until it stops advancing
    pub async fn process_item(&self, item_id: Uuid) -> Result<ItemStatus> {
        self.pipeline.process_item(item_id).await
    }

    /// Drive every item of a batch inline; returns the batch summary afterwards
    pub async fn process_batch(&self, batch_id: Uuid) -> Result<BatchSummary> {
        self.pipeline.process_batch(batch_id, self.concurrency).await?;
        self.get_batch_status(batch_id).await
    }

    /// Enqueue idle items left over from a previous run. VALIDATED items
    /// count as idle only when they promote automatically.
    pub async fn resume(&self, limit: u64) -> Result<usize> {
        let mut resumable = vec![
            ItemStatus::Pending,
            ItemStatus::Preprocessed,
            ItemStatus::OcrCompleted,
            ItemStatus::Extracted,
            ItemStatus::Mapped,
        ];
        if self.pipeline.settings().auto_promote {
            resumable.push(ItemStatus::Validated);
        }
        let items = self
            .pipeline
            .store()
            .find_items_by_status(&resumable, None, limit)
            .await?;
        let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
        self.enqueue(&ids).await;
        Ok(ids.len())
    }
}

/// Point `header` at `field`, taking the field away from any other header
fn reassign_mapping(mappings: &mut Vec<FieldMapping>, header: &str, field: CanonicalField) {
    for mapping in mappings.iter_mut() {
        if mapping.field == Some(field) && mapping.source_header != header {
            mapping.field = None;
            mapping.confidence = 0.0;
            mapping.learned = false;
        }
    }
    match mappings.iter_mut().find(|m| m.source_header == header) {
        Some(mapping) => {
            mapping.field = Some(field);
            mapping.confidence = 1.0;
            mapping.learned = true;
        }
        None => mappings.push(FieldMapping {
            source_header: header.to_string(),
            field: Some(field),
            confidence: 1.0,
            learned: true,
        }),
    }
}

/// Current value behind an error's field: the canonical value, else the raw one
fn error_value(item: &Item, field: &str) -> String {
    let canonical = field.parse::<CanonicalField>().ok();

    let value = canonical
        .and_then(|f| item.normalized.as_ref().and_then(|d| d.get_field(f)))
        .or_else(|| {
            let header = canonical.and_then(|f| item.lineage.header_for(f))?;
            let raw = item.lineage.raw_fields.as_ref().unwrap_or(&item.raw);
            raw.get(header).cloned()
        })
        .or_else(|| item.raw.get(field).cloned());

    value.as_ref().and_then(text_from_value).unwrap_or_default()
}

/// Quote a CSV cell when it contains a delimiter, quote or line break
pub fn escape_csv(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{fast_retry, FlakyExtractor};
    use crate::registry::ComponentRegistry;
    use crate::worker::WorkerPool;
    use ledgerforge_common::config::AppConfig;
    use ledgerforge_common::ingest::{Origin, SourceType};
    use ledgerforge_common::learning::MemoryLearningLog;
    use ledgerforge_common::store::{MemoryDestination, MemoryPipelineStore};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn pipeline_over(store: Arc<MemoryPipelineStore>, auto_promote: bool) -> Arc<Pipeline> {
        let mut config = AppConfig::default();
        config.pipeline.auto_promote = auto_promote;
        let pipeline = Pipeline::new(
            store,
            Arc::new(MemoryDestination::new()),
            Arc::new(FlakyExtractor {
                failures: 0,
                calls: AtomicU32::new(0),
                text: "",
            }),
            ComponentRegistry::with_defaults(&config, None),
            &config,
        )
        .with_retry(fast_retry());
        Arc::new(pipeline)
    }

    fn service() -> (IngestionService, Arc<MemoryLearningLog>) {
        let learning = Arc::new(MemoryLearningLog::new());
        let pipeline = pipeline_over(Arc::new(MemoryPipelineStore::new()), false);
        (IngestionService::new(pipeline, learning.clone()), learning)
    }

    fn new_batch() -> NewBatch {
        NewBatch {
            tenant_id: "t1".into(),
            source_type: SourceType::Invoices,
            origin: Origin::Excel,
            mapping_template: None,
            file_ref: Some("march.csv".into()),
            created_by: Some("ana".into()),
        }
    }

    fn rows(values: Vec<Value>) -> Vec<RawRow> {
        values.into_iter().map(|v| v.as_object().cloned().unwrap()).collect()
    }

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn test_create_batch_validates_request() {
        let (svc, _) = service();
        let mut req = new_batch();
        req.tenant_id = String::new();
        let err = svc.create_batch(req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_csv_file_expands_into_rows() {
        let (svc, _) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let csv = b"invoice_number,invoice_date,total\nF-1,2024-01-02,10\nF-2,2024-01-03,20\n".to_vec();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::File {
                    file_name: "march.csv".into(),
                    mime_type: Some("text/csv".into()),
                    bytes: csv,
                },
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let second = svc.get_item(ids[1]).await.unwrap();
        assert_eq!(second.idempotency_key, "t1:march.csv:1");
        assert_eq!(second.raw["invoice_number"], "F-2");
        assert!(second.document.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_file_becomes_one_failing_item() {
        let (svc, _) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::File {
                    file_name: "broken.json".into(),
                    mime_type: Some("application/json".into()),
                    bytes: b"{not json".to_vec(),
                },
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        let status = svc.process_item(ids[0]).await.unwrap();
        assert_eq!(status, ItemStatus::PreprocessingFailed);
    }

    #[tokio::test]
    async fn test_doc_type_patch_records_misclassification() {
        let (svc, learning) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({
                        "invoice_number": "F-7",
                        "invoice_date": "2024-02-01",
                        "net": 20,
                        "tax": 10,
                        "total": 30,
                    })]),
                },
            )
            .await
            .unwrap();
        svc.process_item(ids[0]).await.unwrap();

        let patched = svc
            .patch_item(
                ids[0],
                ItemPatch {
                    field: "doc_type".into(),
                    value: json!("EXPENSE_RECEIPT"),
                    source_header: None,
                },
            )
            .await
            .unwrap();
        let classification = patched.lineage.classification.unwrap();
        assert_eq!(classification.doc_type, DocType::ExpenseReceipt);
        assert_eq!(classification.classifier, REVIEWER);

        let records = learning.misclassifications("t1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original, DocType::Invoice);
        assert_eq!(records[0].corrected, DocType::ExpenseReceipt);
    }

    #[tokio::test]
    async fn test_patch_with_source_header_feeds_learning() {
        let (svc, learning) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({
                        "invoice_number": "F-1",
                        "invoice_date": "2024-01-02",
                        "total": "100",
                        "importe final": "115",
                    })]),
                },
            )
            .await
            .unwrap();
        svc.process_item(ids[0]).await.unwrap();

        let patched = svc
            .patch_item(
                ids[0],
                ItemPatch {
                    field: "total_amount".into(),
                    value: json!("115"),
                    source_header: Some("importe final".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.normalized.unwrap().totals.total, Some(115.0));
        assert_eq!(patched.lineage.header_for(CanonicalField::TotalAmount), Some("importe final"));

        let feedback = learning.mapping_feedback("t1", None).await.unwrap();
        assert!(feedback.iter().any(|f| f.source_header == "importe final" && f.correct));
        assert!(feedback.iter().any(|f| f.source_header == "total" && !f.correct));
    }

    #[tokio::test]
    async fn test_patch_recomputes_derived_subtotal() {
        let (svc, _) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({
                        "invoice_number": "F-1",
                        "invoice_date": "2024-01-02",
                        "tax": 10,
                        "total": 120,
                    })]),
                },
            )
            .await
            .unwrap();
        svc.process_item(ids[0]).await.unwrap();
        let item = svc.get_item(ids[0]).await.unwrap();
        assert_eq!(item.normalized.unwrap().totals.subtotal, Some(110.0));

        // Repeated corrections each revalidate from a fresh attempt count
        for _ in 0..2 {
            let patched = svc
                .patch_item(
                    ids[0],
                    ItemPatch {
                        field: "total_amount".into(),
                        value: json!(100),
                        source_header: None,
                    },
                )
                .await
                .unwrap();
            assert_eq!(patched.status, ItemStatus::Validated);
            assert_eq!(patched.attempts_for(Stage::Validate), 1);
            assert_eq!(patched.lineage.derived, vec!["subtotal = total_amount - tax_amount"]);
            let totals = patched.normalized.unwrap().totals;
            assert_eq!(totals.subtotal, Some(90.0));
            assert_eq!(totals.total, Some(100.0));
        }
    }

    #[tokio::test]
    async fn test_resume_requeues_validated_items_only_when_auto_promoting() {
        let store = Arc::new(MemoryPipelineStore::new());
        let manual = IngestionService::new(pipeline_over(store.clone(), false), Arc::new(MemoryLearningLog::new()));
        let batch_id = manual.create_batch(new_batch()).await.unwrap();
        let ids = manual
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({
                        "invoice_number": "F-1",
                        "invoice_date": "2024-01-02",
                        "net": 90,
                        "tax": 10,
                        "total": 100,
                    })]),
                },
            )
            .await
            .unwrap();
        assert_eq!(manual.process_item(ids[0]).await.unwrap(), ItemStatus::Validated);
        assert_eq!(manual.resume(100).await.unwrap(), 0);

        let pipeline = pipeline_over(store, true);
        let pool = WorkerPool::start(pipeline.clone(), 1, 8);
        let auto = IngestionService::new(pipeline, Arc::new(MemoryLearningLog::new())).with_queue(pool.queue());
        assert_eq!(auto.resume(100).await.unwrap(), 1);

        let mut status = ItemStatus::Validated;
        for _ in 0..200 {
            status = auto.get_item(ids[0]).await.unwrap().status;
            if status == ItemStatus::Promoted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ItemStatus::Promoted);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_patch_refused_while_processing() {
        let (svc, _) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({"total": "1"})]),
                },
            )
            .await
            .unwrap();
        let err = svc
            .patch_item(
                ids[0],
                ItemPatch {
                    field: "total_amount".into(),
                    value: json!("2"),
                    source_header: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_confirm_needs_review_item() {
        let (svc, learning) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({
                        "invoice_number": "F-1",
                        "invoice_date": "2024-01-02",
                        "net": 90,
                        "tax": 10,
                        "total": 120,
                    })]),
                },
            )
            .await
            .unwrap();
        assert_eq!(svc.process_item(ids[0]).await.unwrap(), ItemStatus::NeedsReview);

        let item = svc.confirm_item(ids[0]).await.unwrap();
        assert_eq!(item.status, ItemStatus::Validated);
        assert_eq!(learning.mapping_feedback("t1", None).await.unwrap().len(), 5);

        let err = svc.confirm_item(ids[0]).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_export_errors_csv() {
        let (svc, _) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({
                        "invoice_number": "F-1",
                        "invoice_date": "2024-01-02",
                        "net": 90,
                        "tax": 10,
                        "total": "1,120.00",
                    })]),
                },
            )
            .await
            .unwrap();
        svc.process_item(ids[0]).await.unwrap();

        let csv = svc.export_errors(batch_id).await.unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("idx,field,error,value"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("0,total_amount,\"TOTALS_MISMATCH: "));
        assert!(row.ends_with(",1120.0"));
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn test_cancel_batch() {
        let (svc, _) = service();
        let batch_id = svc.create_batch(new_batch()).await.unwrap();
        let ids = svc
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({"total": "1"}), json!({"total": "2"})]),
                },
            )
            .await
            .unwrap();

        assert_eq!(svc.cancel_batch(batch_id).await.unwrap(), 2);
        let summary = svc.get_batch_status(batch_id).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.status, BatchStatus::Error);
        assert_eq!(summary.counts["REJECTED"], 2);
        assert_eq!(svc.process_item(ids[0]).await.unwrap(), ItemStatus::Rejected);

        let err = svc
            .ingest(
                batch_id,
                IngestPayload::Rows {
                    source: None,
                    rows: rows(vec![json!({"total": "3"})]),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BatchCancelled { .. }));
    }
}
