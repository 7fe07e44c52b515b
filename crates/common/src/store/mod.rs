//! Storage seams of the pipeline
//!
//! `PipelineStore` persists batches and items and offers the guarded
//! compare-and-set every state transition goes through.
//! `DestinationRepository` is the tenant ledger promoted documents land in.

mod memory;

pub use memory::{MemoryDestination, MemoryPipelineStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::ingest::{Batch, BatchStatus, Item, ItemStatus};
use crate::schema::{CanonicalDocument, PromotionTarget};

/// Outcome of inserting one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertedItem {
    pub id: Uuid,
    /// False when the idempotency key already existed
    pub created: bool,
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn insert_batch(&self, batch: &Batch) -> Result<()>;

    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>>;

    /// Persist a recomputed aggregate. A PROMOTED batch keeps its status.
    async fn update_batch_status(&self, id: Uuid, status: BatchStatus) -> Result<()>;

    /// Flag the batch cancelled; false when it already was
    async fn mark_batch_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Insert items in order, assigning positions after the batch's last one.
    /// An item whose `(tenant, idempotency key)` exists resolves to the stored item.
    async fn insert_items(&self, batch_id: Uuid, items: Vec<Item>) -> Result<Vec<InsertedItem>>;

    async fn find_item(&self, id: Uuid) -> Result<Option<Item>>;

    /// Items of a batch ordered by position
    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<Item>>;

    /// Write `item` only if the stored status still equals `expected` and the
    /// stored revision equals `item.revision`. On success the revision is
    /// bumped, in storage and on `item`. Returns whether the write happened.
    async fn compare_and_set(&self, id: Uuid, expected: ItemStatus, item: &mut Item) -> Result<bool>;

    /// Items in any of `statuses`, optionally only those not updated since `updated_before`
    async fn find_items_by_status(
        &self,
        statuses: &[ItemStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: u64,
    ) -> Result<Vec<Item>>;
}

/// Result of a content-hash upsert into the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upserted {
    pub target_id: String,
    pub was_duplicate: bool,
}

#[async_trait]
pub trait DestinationRepository: Send + Sync {
    /// Create the ledger record unless one with the same `(tenant, hash)` exists,
    /// in which case the existing record's id is returned.
    async fn upsert_by_content_hash(
        &self,
        tenant_id: &str,
        content_hash: &str,
        target: PromotionTarget,
        document: &CanonicalDocument,
    ) -> Result<Upserted>;
}
