//! Repository pattern for database operations
//!
//! Implements the pipeline store, the learning log and the ledger
//! destination on Postgres. Item transitions are a single guarded
//! `UPDATE ... WHERE id = $1 AND status = $2`.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use crate::db::models::item::active_model;
use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::ingest::{Batch, BatchStatus, Item, ItemStatus};
use crate::learning::{ClassificationEvent, LearningLog, MappingFeedback, Misclassification};
use crate::schema::{CanonicalDocument, DocType, PromotionTarget};
use crate::store::{DestinationRepository, InsertedItem, PipelineStore, Upserted};

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

fn now() -> DateTime<FixedOffset> {
    Utc::now().into()
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    async fn find_item_by_key(
        &self,
        conn: &impl sea_orm::ConnectionTrait,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<ItemRow>> {
        ItemEntity::find()
            .filter(ItemColumn::TenantId.eq(tenant_id))
            .filter(ItemColumn::IdempotencyKey.eq(key))
            .one(conn)
            .await
            .map_err(Into::into)
    }
}

// ============================================================================
// Batches and items
// ============================================================================

#[async_trait]
impl PipelineStore for Repository {
    async fn insert_batch(&self, batch: &Batch) -> Result<()> {
        BatchActiveModel::from(batch).insert(self.write_conn()).await?;
        Ok(())
    }

    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        BatchEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .map(Batch::try_from)
            .transpose()
    }

    async fn update_batch_status(&self, id: Uuid, status: BatchStatus) -> Result<()> {
        BatchEntity::update_many()
            .col_expr(BatchColumn::Status, Expr::value(status.as_str()))
            .col_expr(BatchColumn::UpdatedAt, Expr::value(now()))
            .filter(BatchColumn::Id.eq(id))
            .filter(BatchColumn::Status.ne(BatchStatus::Promoted.as_str()))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    async fn mark_batch_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let at: DateTime<FixedOffset> = at.into();
        let result = BatchEntity::update_many()
            .col_expr(BatchColumn::CancelledAt, Expr::value(at))
            .col_expr(BatchColumn::UpdatedAt, Expr::value(at))
            .filter(BatchColumn::Id.eq(id))
            .filter(BatchColumn::CancelledAt.is_null())
            .exec(self.write_conn())
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn insert_items(&self, batch_id: Uuid, items: Vec<Item>) -> Result<Vec<InsertedItem>> {
        let txn = self.write_conn().begin().await?;

        // Serializes position assignment per batch
        BatchEntity::find_by_id(batch_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::BatchNotFound {
                id: batch_id.to_string(),
            })?;

        let max_position: Option<i32> = ItemEntity::find()
            .select_only()
            .column_as(ItemColumn::Position.max(), "max_position")
            .filter(ItemColumn::BatchId.eq(batch_id))
            .into_tuple::<Option<i32>>()
            .one(&txn)
            .await?
            .flatten();
        let mut next = max_position.map(|p| p + 1).unwrap_or(0);

        let mut out = Vec::with_capacity(items.len());
        for mut item in items {
            item.batch_id = batch_id;
            item.position = next as u32;

            let inserted = ItemEntity::insert(active_model(&item)?)
                .on_conflict(
                    OnConflict::columns([ItemColumn::TenantId, ItemColumn::IdempotencyKey])
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;

            if inserted == 1 {
                next += 1;
                out.push(InsertedItem {
                    id: item.id,
                    created: true,
                });
            } else {
                let existing = self
                    .find_item_by_key(&txn, &item.tenant_id, &item.idempotency_key)
                    .await?
                    .ok_or_else(|| AppError::Internal {
                        message: format!("idempotency key {} vanished", item.idempotency_key),
                    })?;
                debug!(key = %item.idempotency_key, item_id = %existing.id, "Item already ingested");
                out.push(InsertedItem {
                    id: existing.id,
                    created: false,
                });
            }
        }

        txn.commit().await?;
        Ok(out)
    }

    async fn find_item(&self, id: Uuid) -> Result<Option<Item>> {
        ItemEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .map(Item::try_from)
            .transpose()
    }

    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<Item>> {
        ItemEntity::find()
            .filter(ItemColumn::BatchId.eq(batch_id))
            .order_by_asc(ItemColumn::Position)
            .all(self.read_conn())
            .await?
            .into_iter()
            .map(Item::try_from)
            .collect()
    }

    async fn compare_and_set(&self, id: Uuid, expected: ItemStatus, item: &mut Item) -> Result<bool> {
        let seen = item.revision;
        let mut model = active_model(item)?;
        model.revision = Set(seen as i64 + 1);

        let result = ItemEntity::update_many()
            .set(model)
            .filter(ItemColumn::Id.eq(id))
            .filter(ItemColumn::Status.eq(expected.as_str()))
            .filter(ItemColumn::Revision.eq(seen as i64))
            .exec(self.write_conn())
            .await?;

        if result.rows_affected == 1 {
            item.revision = seen + 1;
            return Ok(true);
        }

        let exists = ItemEntity::find_by_id(id).one(self.write_conn()).await?.is_some();
        if exists {
            Ok(false)
        } else {
            Err(AppError::ItemNotFound { id: id.to_string() })
        }
    }

    async fn find_items_by_status(
        &self,
        statuses: &[ItemStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: u64,
    ) -> Result<Vec<Item>> {
        let mut query = ItemEntity::find()
            .filter(ItemColumn::Status.is_in(statuses.iter().map(|s| s.as_str())));

        if let Some(before) = updated_before {
            let before: DateTime<FixedOffset> = before.into();
            query = query.filter(ItemColumn::UpdatedAt.lt(before));
        }

        query
            .order_by_asc(ItemColumn::BatchId)
            .order_by_asc(ItemColumn::Position)
            .limit(limit)
            .all(self.write_conn())
            .await?
            .into_iter()
            .map(Item::try_from)
            .collect()
    }
}

// ============================================================================
// Learning log
// ============================================================================

#[async_trait]
impl LearningLog for Repository {
    async fn record_mapping_feedback(&self, feedback: MappingFeedback) -> Result<()> {
        MappingFeedbackActiveModel {
            id: Set(Uuid::now_v7()),
            tenant_id: Set(feedback.tenant_id),
            doc_type: Set(feedback.doc_type.as_str().to_string()),
            source_header: Set(feedback.source_header),
            field: Set(feedback.field.as_str().to_string()),
            correct: Set(feedback.correct),
            recorded_at: Set(feedback.recorded_at.into()),
        }
        .insert(self.write_conn())
        .await?;
        Ok(())
    }

    async fn record_misclassification(&self, record: Misclassification) -> Result<()> {
        MisclassificationActiveModel {
            id: Set(Uuid::now_v7()),
            tenant_id: Set(record.tenant_id),
            batch_id: Set(record.batch_id),
            item_index: Set(record.item_index as i32),
            original_type: Set(record.original.as_str().to_string()),
            corrected_type: Set(record.corrected.as_str().to_string()),
            confidence: Set(record.confidence),
            recorded_at: Set(record.recorded_at.into()),
        }
        .insert(self.write_conn())
        .await?;
        Ok(())
    }

    async fn record_classification(&self, event: ClassificationEvent) -> Result<()> {
        ClassificationEventActiveModel {
            id: Set(Uuid::now_v7()),
            tenant_id: Set(event.tenant_id),
            batch_id: Set(event.batch_id),
            item_index: Set(event.item_index as i32),
            doc_type: Set(event.doc_type.as_str().to_string()),
            confidence: Set(event.confidence),
            recorded_at: Set(event.recorded_at.into()),
        }
        .insert(self.write_conn())
        .await?;
        Ok(())
    }

    async fn mapping_feedback(
        &self,
        tenant_id: &str,
        doc_type: Option<DocType>,
    ) -> Result<Vec<MappingFeedback>> {
        let mut query = MappingFeedbackEntity::find()
            .filter(MappingFeedbackColumn::TenantId.eq(tenant_id));
        if let Some(doc_type) = doc_type {
            query = query.filter(MappingFeedbackColumn::DocType.eq(doc_type.as_str()));
        }
        query
            .order_by_asc(MappingFeedbackColumn::RecordedAt)
            .all(self.read_conn())
            .await?
            .into_iter()
            .map(MappingFeedback::try_from)
            .collect()
    }

    async fn misclassifications(&self, tenant_id: &str) -> Result<Vec<Misclassification>> {
        MisclassificationEntity::find()
            .filter(MisclassificationColumn::TenantId.eq(tenant_id))
            .order_by_asc(MisclassificationColumn::RecordedAt)
            .all(self.read_conn())
            .await?
            .into_iter()
            .map(Misclassification::try_from)
            .collect()
    }

    async fn classification_events(&self, tenant_id: &str) -> Result<Vec<ClassificationEvent>> {
        ClassificationEventEntity::find()
            .filter(ClassificationEventColumn::TenantId.eq(tenant_id))
            .order_by_asc(ClassificationEventColumn::RecordedAt)
            .all(self.read_conn())
            .await?
            .into_iter()
            .map(ClassificationEvent::try_from)
            .collect()
    }
}

// ============================================================================
// Ledger destination
// ============================================================================

#[async_trait]
impl DestinationRepository for Repository {
    async fn upsert_by_content_hash(
        &self,
        tenant_id: &str,
        content_hash: &str,
        target: PromotionTarget,
        document: &CanonicalDocument,
    ) -> Result<Upserted> {
        let id = Uuid::now_v7();
        let record = PromotedDocumentActiveModel {
            id: Set(id),
            tenant_id: Set(tenant_id.to_string()),
            content_hash: Set(content_hash.to_string()),
            target: Set(target.as_str().to_string()),
            document: Set(serde_json::to_value(document)?),
            created_at: Set(now()),
        };

        let inserted = PromotedDocumentEntity::insert(record)
            .on_conflict(
                OnConflict::columns([
                    PromotedDocumentColumn::TenantId,
                    PromotedDocumentColumn::ContentHash,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        if inserted == 1 {
            return Ok(Upserted {
                target_id: id.to_string(),
                was_duplicate: false,
            });
        }

        let existing = PromotedDocumentEntity::find()
            .filter(PromotedDocumentColumn::TenantId.eq(tenant_id))
            .filter(PromotedDocumentColumn::ContentHash.eq(content_hash))
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::Destination {
                message: format!("hash {} conflicted but no record was found", content_hash),
            })?;

        Ok(Upserted {
            target_id: existing.id.to_string(),
            was_duplicate: true,
        })
    }
}
