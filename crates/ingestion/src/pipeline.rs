//! Stage executor
//!
//! Drives one item through the pipeline a stage at a time. Every transition
//! is a compare-and-set on the stored status: the stage starts only if the
//! item still sits in one of its pre-states, and its result is written only
//! if the item is still in the stage's in-progress state. A worker that loses
//! either race stops without side effects.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use ledgerforge_common::config::{AppConfig, PipelineConfig};
use ledgerforge_common::errors::{AppError, Result};
use ledgerforge_common::ingest::{
    Batch, BatchStatus, ConfidenceScores, FieldError, Item, ItemStatus, Origin, Severity, Stage,
};
use ledgerforge_common::learning::ClassificationEvent;
use ledgerforge_common::metrics;
use ledgerforge_common::store::{DestinationRepository, PipelineStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::classify::ClassifyContext;
use crate::dedup::content_hash;
use crate::extract::fields_from_text;
use crate::gate::{validation_confidence, ConfidenceGate};
use crate::mapping::{MappingContext, INVALID_VALUE};
use crate::ocr::TextExtractor;
use crate::parser::{detect_mime, is_binary_document};
use crate::registry::{ComponentRegistry, DEFAULT_CLASSIFIER, DEFAULT_VALIDATOR};
use crate::retry::RetryPolicy;

pub const BATCH_CANCELLED: &str = "BATCH_CANCELLED";
pub const STAGE_TIMEOUT: &str = "STAGE_TIMEOUT";

/// Items examined per reconciliation sweep
const RECONCILE_LIMIT: u64 = 500;

/// Per-stage limits taken from the pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stage_timeout: Duration,
    pub max_file_bytes: usize,
    pub allowed_mime_types: Vec<String>,
    pub auto_promote: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
            max_file_bytes: config.max_file_bytes,
            allowed_mime_types: config.allowed_mime_types.clone(),
            auto_promote: config.auto_promote,
        }
    }
}

/// What happened when a stage was asked to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran; the item now sits in this status
    Completed(ItemStatus),
    /// Item not in a pre-state, or another worker won the transition
    Skipped,
    /// The batch was cancelled; the item was rejected instead
    Cancelled,
    /// Retries exhausted or structural error; the item is in this failure state
    Failed(ItemStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

pub struct Pipeline {
    store: Arc<dyn PipelineStore>,
    destination: Arc<dyn DestinationRepository>,
    extractor: Arc<dyn TextExtractor>,
    registry: ComponentRegistry,
    gate: ConfidenceGate,
    retry: RetryPolicy,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        destination: Arc<dyn DestinationRepository>,
        extractor: Arc<dyn TextExtractor>,
        registry: ComponentRegistry,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            destination,
            extractor,
            registry,
            gate: ConfidenceGate::from_config(&config.gate),
            retry: RetryPolicy::from_config(&config.pipeline),
            settings: PipelineSettings::from_config(&config.pipeline),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    async fn load_item(&self, id: Uuid) -> Result<Item> {
        self.store
            .find_item(id)
            .await?
            .ok_or_else(|| AppError::ItemNotFound { id: id.to_string() })
    }

    async fn load_batch(&self, id: Uuid) -> Result<Batch> {
        self.store
            .find_batch(id)
            .await?
            .ok_or_else(|| AppError::BatchNotFound { id: id.to_string() })
    }

    /// Recompute and persist the batch aggregate
    pub async fn refresh_batch(&self, batch_id: Uuid) -> Result<BatchStatus> {
        let items = self.store.list_items(batch_id).await?;
        let status = BatchStatus::aggregate(items.iter().map(|i| i.status));
        self.store.update_batch_status(batch_id, status).await?;
        Ok(status)
    }

    /// Next stage for an item, if any runs automatically
    pub fn next_stage(&self, batch: &Batch, item: &Item) -> Option<Stage> {
        match item.status {
            ItemStatus::Pending => Some(Stage::Preprocess),
            ItemStatus::Preprocessed => {
                let binary = item
                    .document
                    .as_ref()
                    .map_or(false, |d| is_binary_document(&d.mime_type));
                if batch.origin == Origin::Ocr && binary {
                    Some(Stage::Ocr)
                } else {
                    Some(Stage::Extract)
                }
            }
            ItemStatus::OcrCompleted => Some(Stage::Extract),
            ItemStatus::Extracted => Some(Stage::Map),
            ItemStatus::Mapped => Some(Stage::Validate),
            ItemStatus::Validated if self.settings.auto_promote => Some(Stage::Promote),
            _ => None,
        }
    }

    /// Run one guarded stage on an item
    #[instrument(skip(self), fields(stage = %stage))]
    pub async fn run_stage(&self, stage: Stage, item_id: Uuid) -> Result<StageOutcome> {
        let item = self.load_item(item_id).await?;
        if !stage.pre_states().contains(&item.status) {
            debug!(status = %item.status, "Item not in a pre-state, skipping");
            return Ok(StageOutcome::Skipped);
        }

        let batch = self.load_batch(item.batch_id).await?;
        if batch.is_cancelled() {
            return self.reject_cancelled(item).await;
        }

        let expected = item.status;
        let mut working = item;
        working.status = stage.in_progress();
        working.updated_at = Utc::now();
        if !self.store.compare_and_set(item_id, expected, &mut working).await? {
            debug!("Lost the race to start the stage");
            return Ok(StageOutcome::Skipped);
        }
        self.refresh_batch(batch.id).await?;

        self.drive(stage, &batch, working).await
    }

    /// Attempt loop for an item already moved to the stage's in-progress state
    async fn drive(&self, stage: Stage, batch: &Batch, mut working: Item) -> Result<StageOutcome> {
        let in_progress = stage.in_progress();
        let started = Instant::now();
        let mut schedule = self.retry.backoff();

        loop {
            *working.attempts.entry(stage).or_insert(0) += 1;
            working.updated_at = Utc::now();
            if !self.store.compare_and_set(working.id, in_progress, &mut working).await? {
                debug!("Item left the stage while in flight");
                return Ok(StageOutcome::Skipped);
            }
            let attempt = working.attempts_for(stage);

            let result = match tokio::time::timeout(
                self.settings.stage_timeout,
                self.execute(stage, batch, &working),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout {
                    operation: format!("{} stage", stage),
                    timeout_ms: self.settings.stage_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(mut next) => {
                    next.updated_at = Utc::now();
                    let status = next.status;
                    if !self.store.compare_and_set(next.id, in_progress, &mut next).await? {
                        debug!("Stage result superseded, discarding");
                        return Ok(StageOutcome::Skipped);
                    }
                    metrics::record_stage(stage.as_str(), "success", started.elapsed().as_secs_f64());
                    debug!(status = %status, attempt, "Stage completed");
                    if stage == Stage::Map {
                        self.record_classification(&next).await;
                    }
                    self.refresh_batch(batch.id).await?;
                    return Ok(StageOutcome::Completed(status));
                }
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    warn!(error = %e, attempt, "Transient stage failure, retrying");
                    metrics::record_retry(stage.as_str(), attempt);
                    working.last_error = Some(e.to_string());
                    tokio::time::sleep(self.retry.next_delay(&mut schedule)).await;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Stage failed");
                    let failure = stage.failure();
                    working.status = failure;
                    working.last_error = Some(e.to_string());
                    working.errors.push(FieldError::new(
                        None,
                        e.code().as_str(),
                        e.to_string(),
                        Severity::Critical,
                    ));
                    working.updated_at = Utc::now();
                    if !self.store.compare_and_set(working.id, in_progress, &mut working).await? {
                        return Ok(StageOutcome::Skipped);
                    }
                    metrics::record_stage(stage.as_str(), "failure", started.elapsed().as_secs_f64());
                    self.refresh_batch(batch.id).await?;
                    return Ok(StageOutcome::Failed(failure));
                }
            }
        }
    }

    /// Count the classification of a freshly mapped item
    async fn record_classification(&self, item: &Item) {
        let Some(ref classification) = item.lineage.classification else {
            return;
        };
        metrics::record_classification(classification.doc_type.as_str());

        let Some(insights) = self.registry.insights() else {
            return;
        };
        let event = ClassificationEvent {
            tenant_id: item.tenant_id.clone(),
            batch_id: item.batch_id,
            item_index: item.position,
            doc_type: classification.doc_type,
            confidence: classification.confidence,
            recorded_at: Utc::now(),
        };
        if let Err(e) = insights.log().record_classification(event).await {
            warn!(error = %e, "Failed to record classification event");
        }
    }

    async fn reject_cancelled(&self, mut item: Item) -> Result<StageOutcome> {
        let expected = item.status;
        item.status = ItemStatus::Rejected;
        item.errors.push(FieldError::new(
            None,
            BATCH_CANCELLED,
            "Batch was cancelled before processing finished",
            Severity::Error,
        ));
        item.updated_at = Utc::now();
        if !self.store.compare_and_set(item.id, expected, &mut item).await? {
            return Ok(StageOutcome::Skipped);
        }
        info!(item_id = %item.id, "Item rejected by batch cancellation");
        self.refresh_batch(item.batch_id).await?;
        Ok(StageOutcome::Cancelled)
    }

    async fn execute(&self, stage: Stage, batch: &Batch, item: &Item) -> Result<Item> {
        let mut next = item.clone();
        match stage {
            Stage::Preprocess => self.preprocess(&mut next)?,
            Stage::Ocr => self.ocr(&mut next).await?,
            Stage::Extract => self.extract(&mut next).await?,
            Stage::Map => self.map(batch, &mut next).await?,
            Stage::Validate => self.validate(&mut next).await?,
            Stage::Promote => self.promote(&mut next).await?,
        }
        Ok(next)
    }

    fn preprocess(&self, item: &mut Item) -> Result<()> {
        match item.document {
            Some(ref mut doc) => {
                if doc.bytes.len() > self.settings.max_file_bytes {
                    return Err(AppError::PayloadTooLarge {
                        size: doc.bytes.len(),
                        limit: self.settings.max_file_bytes,
                    });
                }
                if doc.bytes.is_empty() {
                    return Err(AppError::InvalidFormat {
                        message: format!("{} is empty", doc.file_name),
                    });
                }
                let mime = detect_mime(&doc.bytes, Some(&doc.mime_type), &doc.file_name);
                if !self.settings.allowed_mime_types.iter().any(|m| *m == mime) {
                    return Err(AppError::UnsupportedMediaType { mime });
                }
                doc.mime_type = mime.clone();

                if !is_binary_document(&mime) {
                    // Tabular files reach here only when ingest could not split them
                    let parser = self
                        .registry
                        .parser_for(&mime)
                        .ok_or_else(|| AppError::UnsupportedMediaType { mime: mime.clone() })?;
                    let mut rows = parser.parse(&doc.file_name, &doc.bytes)?;
                    if rows.len() != 1 {
                        return Err(AppError::InvalidFormat {
                            message: format!("expected one record, found {}", rows.len()),
                        });
                    }
                    item.raw = rows.remove(0);
                    item.lineage.parser_confidence = Some(1.0);
                }
            }
            None => {
                if item.raw.is_empty() {
                    return Err(AppError::InvalidFormat {
                        message: "record has no fields".into(),
                    });
                }
                item.lineage.parser_confidence = Some(1.0);
            }
        }
        item.status = ItemStatus::Preprocessed;
        Ok(())
    }

    async fn extract_document_text(&self, item: &mut Item) -> Result<()> {
        let doc = item.document.as_ref().ok_or_else(|| AppError::Internal {
            message: format!("item {} has no document", item.id),
        })?;
        let extracted = self.extractor.extract_text(&doc.bytes, &doc.mime_type).await?;
        debug!(chars = extracted.text.len(), confidence = extracted.confidence, "Text extracted");
        item.lineage.extracted_text = Some(extracted.text);
        item.lineage.ocr_confidence = Some(extracted.confidence);
        item.lineage.parser_confidence = Some(extracted.confidence);
        Ok(())
    }

    async fn ocr(&self, item: &mut Item) -> Result<()> {
        self.extract_document_text(item).await?;
        item.status = ItemStatus::OcrCompleted;
        Ok(())
    }

    async fn extract(&self, item: &mut Item) -> Result<()> {
        let binary = item
            .document
            .as_ref()
            .map_or(false, |d| is_binary_document(&d.mime_type));

        if binary {
            if item.lineage.extracted_text.is_none() {
                self.extract_document_text(item).await?;
            }
            let text = item.lineage.extracted_text.as_deref().unwrap_or_default();
            let mut fields = fields_from_text(text);
            // Fields supplied with the upload win over recovered ones
            for (key, value) in &item.raw {
                fields.insert(key.clone(), value.clone());
            }
            if fields.is_empty() {
                return Err(AppError::InvalidFormat {
                    message: "no fields recovered from document text".into(),
                });
            }
            item.lineage.raw_fields = Some(fields);
        } else {
            item.lineage.raw_fields = Some(item.raw.clone());
            if item.lineage.parser_confidence.is_none() {
                item.lineage.parser_confidence = Some(1.0);
            }
        }

        item.status = ItemStatus::Extracted;
        Ok(())
    }

    async fn map(&self, batch: &Batch, item: &mut Item) -> Result<()> {
        let raw = item
            .lineage
            .raw_fields
            .clone()
            .unwrap_or_else(|| item.raw.clone());

        let classifier = self.registry.classifier(DEFAULT_CLASSIFIER)?;
        let classification = classifier
            .classify(
                &raw,
                &ClassifyContext {
                    tenant_id: &item.tenant_id,
                    source_hint: batch.source_type.hinted_doc_type(),
                },
            )
            .await?;

        let mapper = self.registry.mapper_for(batch.mapping_template.as_deref())?;
        let mapped = mapper
            .map(
                &raw,
                &MappingContext {
                    tenant_id: &item.tenant_id,
                    doc_type: classification.doc_type,
                },
            )
            .await?;

        item.errors.retain(|e| e.code != INVALID_VALUE);
        item.errors.extend(mapped.errors);
        item.normalized = Some(mapped.document);
        item.lineage.classification = Some(classification);
        item.lineage.mappings = mapped.mappings;
        item.lineage.mapping_confidence = Some(mapped.confidence);
        item.lineage.derived = mapped.derived;
        item.status = ItemStatus::Mapped;
        Ok(())
    }

    async fn validate(&self, item: &mut Item) -> Result<()> {
        let validator = self.registry.validator(DEFAULT_VALIDATOR)?;
        let doc = item.normalized.as_ref().ok_or_else(|| AppError::Internal {
            message: format!("item {} reached validation without a document", item.id),
        })?;
        let found = validator.validate(doc).await?;

        // Mapping problems survive revalidation until the field is patched
        item.errors.retain(|e| e.code == INVALID_VALUE);
        item.errors.extend(found);

        let lineage = &item.lineage;
        let scores = ConfidenceScores {
            parser: lineage.parser_confidence.unwrap_or(1.0),
            classification: lineage.classification.as_ref().map_or(0.0, |c| c.confidence),
            mapping: lineage.mapping_confidence.unwrap_or(0.0),
            validation: validation_confidence(&item.errors),
        };
        let (outcome, status) = self.gate.decide_item(scores, &item.errors);
        debug!(
            decision = outcome.decision.as_str(),
            overall = outcome.overall,
            status = %status,
            "Gate decided"
        );

        if let Some(ref mut doc) = item.normalized {
            doc.source_confidence = outcome.overall;
        }
        item.lineage.gate = Some(outcome);
        item.status = status;
        Ok(())
    }

    async fn promote(&self, item: &mut Item) -> Result<()> {
        let doc = item.normalized.as_ref().ok_or_else(|| AppError::Internal {
            message: format!("item {} has no document to promote", item.id),
        })?;
        let target = doc.doc_type.promotion_target().ok_or_else(|| AppError::Validation {
            message: format!("{} documents are not promotable", doc.doc_type),
            field: Some("doc_type".into()),
        })?;

        let hash = content_hash(item)?;
        let upserted = self
            .destination
            .upsert_by_content_hash(&item.tenant_id, &hash, target, doc)
            .await?;
        metrics::record_promotion(target.as_str(), upserted.was_duplicate);
        if upserted.was_duplicate {
            info!(target_id = %upserted.target_id, "Duplicate content resolved to existing record");
        }

        item.content_hash = Some(hash);
        item.promoted_to = Some(target.as_str().to_string());
        item.promoted_id = Some(upserted.target_id);
        item.status = ItemStatus::Promoted;
        Ok(())
    }

    /// Run stages until the item stops advancing; returns its final status
    #[instrument(skip(self))]
    pub async fn process_item(&self, item_id: Uuid) -> Result<ItemStatus> {
        loop {
            let item = self.load_item(item_id).await?;
            let batch = self.load_batch(item.batch_id).await?;
            let Some(stage) = self.next_stage(&batch, &item) else {
                return Ok(item.status);
            };
            match self.run_stage(stage, item_id).await? {
                StageOutcome::Completed(_) => continue,
                _ => return Ok(self.load_item(item_id).await?.status),
            }
        }
    }

    /// Process every item of a batch with bounded concurrency
    pub async fn process_batch(&self, batch_id: Uuid, concurrency: usize) -> Result<Vec<(Uuid, ItemStatus)>> {
        let ids: Vec<Uuid> = self
            .store
            .list_items(batch_id)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();

        let results: Vec<(Uuid, Result<ItemStatus>)> = stream::iter(ids)
            .map(|id| async move { (id, self.process_item(id).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut statuses = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(status) => statuses.push((id, status)),
                Err(e) => warn!(item_id = %id, error = %e, "Item processing aborted"),
            }
        }
        Ok(statuses)
    }

    /// Re-run validation on a reviewer-edited item currently in `expected`
    pub async fn revalidate(&self, patched: Item, expected: ItemStatus) -> Result<Item> {
        let batch = self.load_batch(patched.batch_id).await?;
        let id = patched.id;

        let mut working = patched;
        working.status = ItemStatus::Validating;
        // Each review round gets the full retry budget
        working.attempts.insert(Stage::Validate, 0);
        working.updated_at = Utc::now();
        if !self.store.compare_and_set(id, expected, &mut working).await? {
            return Err(AppError::InvalidTransition {
                from: expected.to_string(),
                to: ItemStatus::Validating.to_string(),
            });
        }

        self.drive(Stage::Validate, &batch, working).await?;
        self.load_item(id).await
    }

    /// Requeue or fail items stuck in an in-progress state since before `stuck_after`
    #[instrument(skip(self))]
    pub async fn reconcile(&self, stuck_after: Duration) -> Result<ReconcileReport> {
        let age = chrono::Duration::from_std(stuck_after).map_err(|e| AppError::Internal {
            message: format!("invalid reconciliation age: {}", e),
        })?;
        let cutoff = Utc::now() - age;
        let in_progress: Vec<ItemStatus> = Stage::ALL.iter().map(|s| s.in_progress()).collect();

        let stuck = self
            .store
            .find_items_by_status(&in_progress, Some(cutoff), RECONCILE_LIMIT)
            .await?;

        let mut report = ReconcileReport::default();
        let mut touched = BTreeSet::new();

        for mut item in stuck {
            let Some(stage) = Stage::owning(item.status) else {
                continue;
            };
            let expected = item.status;

            let requeue = item.attempts_for(stage) < self.retry.max_attempts;
            if requeue {
                item.status = if stage == Stage::Extract && item.lineage.extracted_text.is_some() {
                    ItemStatus::OcrCompleted
                } else {
                    stage.requeue_state()
                };
            } else {
                let message = format!("{} stage did not finish after {} attempts", stage, item.attempts_for(stage));
                item.status = stage.failure();
                item.errors.push(FieldError::new(None, STAGE_TIMEOUT, message.clone(), Severity::Critical));
                item.last_error = Some(message);
            }
            item.updated_at = Utc::now();

            if self.store.compare_and_set(item.id, expected, &mut item).await? {
                touched.insert(item.batch_id);
                if requeue {
                    report.requeued.push(item.id);
                } else {
                    report.failed.push(item.id);
                }
            }
        }

        for batch_id in touched {
            self.refresh_batch(batch_id).await?;
        }

        if !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Reconciled stuck items"
            );
        }
        metrics::record_reconciliation("requeued", report.requeued.len());
        metrics::record_reconciliation("failed", report.failed.len());
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::insights::LearningInsights;
    use crate::mapping::{DictionaryMapper, Mapper, MappingResult};
    use crate::ocr::ExtractedText;
    use crate::parser::RawRow;
    use crate::registry::DEFAULT_MAPPER;
    use async_trait::async_trait;
    use ledgerforge_common::ingest::{NewBatch, SourceDocument, SourceType};
    use ledgerforge_common::learning::{LearningLog, MemoryLearningLog};
    use ledgerforge_common::store::{MemoryDestination, MemoryPipelineStore};
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Extractor failing transiently `failures` times before answering
    pub(crate) struct FlakyExtractor {
        pub failures: u32,
        pub calls: AtomicU32,
        pub text: &'static str,
    }

    #[async_trait]
    impl TextExtractor for FlakyExtractor {
        fn id(&self) -> &'static str {
            "flaky"
        }

        async fn extract_text(&self, _bytes: &[u8], _mime: &str) -> Result<ExtractedText> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AppError::Ocr {
                    message: "engine busy".into(),
                    retryable: true,
                });
            }
            Ok(ExtractedText {
                text: self.text.to_string(),
                confidence: 0.9,
            })
        }
    }

    /// Extractor that takes `delay` per call
    struct SlowExtractor {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TextExtractor for SlowExtractor {
        fn id(&self) -> &'static str {
            "slow"
        }

        async fn extract_text(&self, _bytes: &[u8], _mime: &str) -> Result<ExtractedText> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(ExtractedText {
                text: "Total: 10.00".into(),
                confidence: 0.9,
            })
        }
    }

    /// Dictionary mapper whose first call times out
    struct FlakyMapper {
        inner: DictionaryMapper,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Mapper for FlakyMapper {
        fn id(&self) -> &'static str {
            "flaky"
        }

        async fn map(&self, raw: &RawRow, ctx: &MappingContext<'_>) -> Result<MappingResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AppError::Timeout {
                    operation: "mapping".into(),
                    timeout_ms: 1,
                });
            }
            self.inner.map(raw, ctx).await
        }
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        }
    }

    struct Harness {
        pipeline: Arc<Pipeline>,
        store: Arc<MemoryPipelineStore>,
        destination: Arc<MemoryDestination>,
    }

    fn harness(extractor: Arc<dyn TextExtractor>, config: AppConfig) -> Harness {
        let registry = ComponentRegistry::with_defaults(&config, None);
        harness_with(extractor, registry, config)
    }

    fn harness_with(extractor: Arc<dyn TextExtractor>, registry: ComponentRegistry, config: AppConfig) -> Harness {
        let store = Arc::new(MemoryPipelineStore::new());
        let destination = Arc::new(MemoryDestination::new());
        let pipeline = Pipeline::new(store.clone(), destination.clone(), extractor, registry, &config)
            .with_retry(fast_retry());
        Harness {
            pipeline: Arc::new(pipeline),
            store,
            destination,
        }
    }

    fn scan() -> SourceDocument {
        SourceDocument {
            file_name: "scan.png".into(),
            mime_type: "image/png".into(),
            bytes: b"\x89PNG\r\n\x1a\n0000".to_vec(),
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyExtractor> {
        Arc::new(FlakyExtractor {
            failures,
            calls: AtomicU32::new(0),
            text: "FACTURA\nInvoice No: F-9\nFecha: 2024-01-02\nTotal: 50.00",
        })
    }

    async fn seed(h: &Harness, origin: Origin, raw: Value, document: Option<SourceDocument>) -> (Batch, Uuid) {
        let batch = Batch::from_request(NewBatch {
            tenant_id: "t1".into(),
            source_type: SourceType::Invoices,
            origin,
            mapping_template: None,
            file_ref: None,
            created_by: None,
        });
        h.store.insert_batch(&batch).await.unwrap();
        let raw: Map<String, Value> = raw.as_object().cloned().unwrap();
        let item = Item::new(batch.id, "t1", 0, "t1:f:0".into(), raw, document);
        let inserted = h.store.insert_items(batch.id, vec![item]).await.unwrap();
        (batch, inserted[0].id)
    }

    fn invoice_row() -> Value {
        json!({
            "invoice_number": "F-001",
            "invoice_date": "2024-01-02",
            "net": 90,
            "tax": 10,
            "total": 100,
        })
    }

    #[tokio::test]
    async fn test_clean_row_validates() {
        let h = harness(flaky(0), AppConfig::default());
        let (batch, id) = seed(&h, Origin::Excel, invoice_row(), None).await;

        let status = h.pipeline.process_item(id).await.unwrap();
        assert_eq!(status, ItemStatus::Validated);

        let item = h.store.find_item(id).await.unwrap().unwrap();
        let gate = item.lineage.gate.as_ref().unwrap();
        assert_eq!(gate.decision.as_str(), "AUTO_APPROVE");
        assert_eq!(item.attempts_for(Stage::Map), 1);
        assert!(item.errors.is_empty());

        let stored = h.store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Ready);
    }

    #[tokio::test]
    async fn test_auto_promote() {
        let mut config = AppConfig::default();
        config.pipeline.auto_promote = true;
        let h = harness(flaky(0), config);
        let (_, id) = seed(&h, Origin::Api, invoice_row(), None).await;

        assert_eq!(h.pipeline.process_item(id).await.unwrap(), ItemStatus::Promoted);
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.promoted_to.as_deref(), Some("invoices"));
        assert!(item.content_hash.is_some());
        assert_eq!(h.destination.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_document_fails_without_retry() {
        let mut config = AppConfig::default();
        config.pipeline.max_file_bytes = 4;
        let h = harness(flaky(0), config);
        let doc = SourceDocument {
            file_name: "scan.pdf".into(),
            mime_type: "application/pdf".into(),
            bytes: b"%PDF-1.4 too big".to_vec(),
        };
        let (_, id) = seed(&h, Origin::Ocr, json!({}), Some(doc)).await;

        let outcome = h.pipeline.run_stage(Stage::Preprocess, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::Failed(ItemStatus::PreprocessingFailed));
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.attempts_for(Stage::Preprocess), 1);
        assert_eq!(item.errors[0].code, "PAYLOAD_TOO_LARGE");
        assert_eq!(item.errors[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_transient_ocr_failures_are_retried() {
        let extractor = flaky(2);
        let h = harness(extractor.clone(), AppConfig::default());
        let doc = SourceDocument {
            file_name: "scan.png".into(),
            mime_type: "image/png".into(),
            bytes: b"\x89PNG\r\n\x1a\n0000".to_vec(),
        };
        let (_, id) = seed(&h, Origin::Ocr, json!({}), Some(doc)).await;

        let status = h.pipeline.process_item(id).await.unwrap();
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.attempts_for(Stage::Ocr), 3);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
        assert!(!status.is_failure());
        let raw = item.lineage.raw_fields.unwrap();
        assert_eq!(raw["Invoice No"], "F-9");
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let h = harness(flaky(10), AppConfig::default());
        let doc = SourceDocument {
            file_name: "scan.png".into(),
            mime_type: "image/png".into(),
            bytes: b"\x89PNG\r\n\x1a\n0000".to_vec(),
        };
        let (batch, id) = seed(&h, Origin::Ocr, json!({}), Some(doc)).await;

        assert_eq!(h.pipeline.process_item(id).await.unwrap(), ItemStatus::OcrFailed);
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.attempts_for(Stage::Ocr), 3);
        assert_eq!(item.errors.last().unwrap().code, "OCR_ERROR");
        assert!(item.last_error.is_some());

        let stored = h.store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Error);
    }

    #[tokio::test]
    async fn test_stage_skips_outside_pre_state() {
        let h = harness(flaky(0), AppConfig::default());
        let (_, id) = seed(&h, Origin::Excel, invoice_row(), None).await;
        let outcome = h.pipeline.run_stage(Stage::Map, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_batch_rejects_next_stage() {
        let h = harness(flaky(0), AppConfig::default());
        let (batch, id) = seed(&h, Origin::Excel, invoice_row(), None).await;
        h.store.mark_batch_cancelled(batch.id, Utc::now()).await.unwrap();

        let outcome = h.pipeline.run_stage(Stage::Preprocess, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::Cancelled);
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Rejected);
        assert_eq!(item.errors[0].code, BATCH_CANCELLED);
    }

    #[tokio::test]
    async fn test_reconcile_requeues_then_fails() {
        let h = harness(flaky(0), AppConfig::default());
        let (_, id) = seed(&h, Origin::Excel, invoice_row(), None).await;

        // Simulate a worker that died mid-mapping
        let mut stuck = h.store.find_item(id).await.unwrap().unwrap();
        stuck.status = ItemStatus::Mapping;
        stuck.attempts.insert(Stage::Map, 1);
        stuck.updated_at = Utc::now() - chrono::Duration::hours(1);
        assert!(h.store.compare_and_set(id, ItemStatus::Pending, &mut stuck).await.unwrap());

        let report = h.pipeline.reconcile(Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.requeued, vec![id]);
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Extracted);

        let mut stuck = item;
        stuck.status = ItemStatus::Mapping;
        stuck.attempts.insert(Stage::Map, 3);
        stuck.updated_at = Utc::now() - chrono::Duration::hours(1);
        assert!(h.store.compare_and_set(id, ItemStatus::Extracted, &mut stuck).await.unwrap());

        let report = h.pipeline.reconcile(Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.failed, vec![id]);
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::MappingFailed);
        assert_eq!(item.errors.last().unwrap().code, STAGE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_reconcile_supersedes_in_flight_stage() {
        let extractor = Arc::new(SlowExtractor {
            delay: Duration::from_millis(300),
            calls: AtomicU32::new(0),
        });
        let h = harness(extractor.clone(), AppConfig::default());
        let (_, id) = seed(&h, Origin::Ocr, json!({}), Some(scan())).await;
        h.pipeline.run_stage(Stage::Preprocess, id).await.unwrap();

        let pipeline = h.pipeline.clone();
        let first = tokio::spawn(async move { pipeline.run_stage(Stage::Ocr, id).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Sweep takes the slow attempt for a dead worker
        let report = h.pipeline.reconcile(Duration::from_millis(50)).await.unwrap();
        assert_eq!(report.requeued, vec![id]);

        let second = h.pipeline.run_stage(Stage::Ocr, id).await.unwrap();
        assert_eq!(second, StageOutcome::Completed(ItemStatus::OcrCompleted));
        assert_eq!(first.await.unwrap().unwrap(), StageOutcome::Skipped);

        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::OcrCompleted);
        assert_eq!(item.attempts_for(Stage::Ocr), 2);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_classification_recorded_once_per_item() {
        let config = AppConfig::default();
        let log = Arc::new(MemoryLearningLog::new());
        let mut registry = ComponentRegistry::with_defaults(&config, Some(LearningInsights::new(log.clone())));
        let mapper = Arc::new(FlakyMapper {
            inner: DictionaryMapper::new(config.mapping.learned_override_threshold),
            calls: AtomicU32::new(0),
        });
        registry.register_mapper_as(DEFAULT_MAPPER, mapper.clone());
        let h = harness_with(flaky(0), registry, config);
        let (batch, id) = seed(&h, Origin::Excel, invoice_row(), None).await;

        assert_eq!(h.pipeline.process_item(id).await.unwrap(), ItemStatus::Validated);
        let item = h.store.find_item(id).await.unwrap().unwrap();
        assert_eq!(item.attempts_for(Stage::Map), 2);
        assert_eq!(mapper.calls.load(Ordering::SeqCst), 2);

        let events = log.classification_events("t1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].batch_id, batch.id);
        assert_eq!(events[0].item_index, 0);
    }

    #[tokio::test]
    async fn test_revalidate_restarts_attempt_count() {
        let h = harness(flaky(0), AppConfig::default());
        let (_, id) = seed(&h, Origin::Excel, invoice_row(), None).await;
        h.pipeline.process_item(id).await.unwrap();

        for _ in 0..3 {
            let item = h.store.find_item(id).await.unwrap().unwrap();
            let revalidated = h.pipeline.revalidate(item, ItemStatus::Validated).await.unwrap();
            assert_eq!(revalidated.status, ItemStatus::Validated);
            assert_eq!(revalidated.attempts_for(Stage::Validate), 1);
        }
    }
}
