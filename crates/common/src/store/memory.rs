//! In-memory stores for tests and single-process runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{DestinationRepository, InsertedItem, PipelineStore, Upserted};
use crate::errors::{AppError, Result};
use crate::ingest::{Batch, BatchStatus, Item, ItemStatus};
use crate::schema::{CanonicalDocument, PromotionTarget};

#[derive(Default)]
struct ItemTable {
    items: HashMap<Uuid, Item>,
    by_key: HashMap<(String, String), Uuid>,
    next_position: HashMap<Uuid, u32>,
}

#[derive(Default)]
pub struct MemoryPipelineStore {
    batches: RwLock<HashMap<Uuid, Batch>>,
    items: RwLock<ItemTable>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn insert_batch(&self, batch: &Batch) -> Result<()> {
        let mut batches = self.batches.write().await;
        if batches.contains_key(&batch.id) {
            return Err(AppError::Duplicate {
                message: format!("batch {} exists", batch.id),
            });
        }
        batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        Ok(self.batches.read().await.get(&id).cloned())
    }

    async fn update_batch_status(&self, id: Uuid, status: BatchStatus) -> Result<()> {
        let mut batches = self.batches.write().await;
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| AppError::BatchNotFound { id: id.to_string() })?;
        if batch.status != BatchStatus::Promoted {
            batch.status = status;
        }
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_batch_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut batches = self.batches.write().await;
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| AppError::BatchNotFound { id: id.to_string() })?;
        if batch.cancelled_at.is_some() {
            return Ok(false);
        }
        batch.cancelled_at = Some(at);
        batch.updated_at = at;
        Ok(true)
    }

    async fn insert_items(&self, batch_id: Uuid, items: Vec<Item>) -> Result<Vec<InsertedItem>> {
        let mut guard = self.items.write().await;
        let table = &mut *guard;
        let mut out = Vec::with_capacity(items.len());

        for mut item in items {
            let key = (item.tenant_id.clone(), item.idempotency_key.clone());
            if let Some(existing) = table.by_key.get(&key) {
                out.push(InsertedItem {
                    id: *existing,
                    created: false,
                });
                continue;
            }

            let position = table.next_position.entry(batch_id).or_insert(0);
            item.batch_id = batch_id;
            item.position = *position;
            *position += 1;

            table.by_key.insert(key, item.id);
            out.push(InsertedItem {
                id: item.id,
                created: true,
            });
            table.items.insert(item.id, item);
        }

        Ok(out)
    }

    async fn find_item(&self, id: Uuid) -> Result<Option<Item>> {
        Ok(self.items.read().await.items.get(&id).cloned())
    }

    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<Item>> {
        let table = self.items.read().await;
        let mut items: Vec<Item> = table
            .items
            .values()
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.position);
        Ok(items)
    }

    async fn compare_and_set(&self, id: Uuid, expected: ItemStatus, item: &mut Item) -> Result<bool> {
        let mut table = self.items.write().await;
        match table.items.get_mut(&id) {
            Some(current) if current.status == expected && current.revision == item.revision => {
                item.revision += 1;
                *current = item.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::ItemNotFound { id: id.to_string() }),
        }
    }

    async fn find_items_by_status(
        &self,
        statuses: &[ItemStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: u64,
    ) -> Result<Vec<Item>> {
        let table = self.items.read().await;
        let mut found: Vec<Item> = table
            .items
            .values()
            .filter(|i| statuses.contains(&i.status))
            .filter(|i| updated_before.map_or(true, |t| i.updated_at < t))
            .cloned()
            .collect();
        found.sort_by_key(|i| (i.batch_id, i.position));
        found.truncate(limit as usize);
        Ok(found)
    }
}

/// A promoted ledger record held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub id: String,
    pub tenant_id: String,
    pub content_hash: String,
    pub target: PromotionTarget,
    pub document: CanonicalDocument,
}

#[derive(Default)]
pub struct MemoryDestination {
    records: Mutex<Vec<LedgerRecord>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<LedgerRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DestinationRepository for MemoryDestination {
    async fn upsert_by_content_hash(
        &self,
        tenant_id: &str,
        content_hash: &str,
        target: PromotionTarget,
        document: &CanonicalDocument,
    ) -> Result<Upserted> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.content_hash == content_hash)
        {
            return Ok(Upserted {
                target_id: existing.id.clone(),
                was_duplicate: true,
            });
        }

        let id = Uuid::now_v7().to_string();
        records.push(LedgerRecord {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            content_hash: content_hash.to_string(),
            target,
            document: document.clone(),
        });
        Ok(Upserted {
            target_id: id,
            was_duplicate: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{NewBatch, Origin, SourceType};
    use crate::schema::DocType;
    use serde_json::Map;
    use std::sync::Arc;

    fn batch() -> Batch {
        Batch::from_request(NewBatch {
            tenant_id: "t1".into(),
            source_type: SourceType::Invoices,
            origin: Origin::Excel,
            mapping_template: None,
            file_ref: None,
            created_by: None,
        })
    }

    fn item(batch: &Batch, index: u32) -> Item {
        Item::new(
            batch.id,
            &batch.tenant_id,
            index,
            Item::idempotency_key_for(&batch.tenant_id, "f.csv", index),
            Map::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_insert_items_assigns_positions_and_dedups_keys() {
        let store = MemoryPipelineStore::new();
        let b = batch();
        store.insert_batch(&b).await.unwrap();

        let first = store.insert_items(b.id, vec![item(&b, 0), item(&b, 1)]).await.unwrap();
        assert!(first.iter().all(|i| i.created));

        let again = store.insert_items(b.id, vec![item(&b, 1), item(&b, 2)]).await.unwrap();
        assert!(!again[0].created);
        assert_eq!(again[0].id, first[1].id);
        assert!(again[1].created);

        let items = store.list_items(b.id).await.unwrap();
        let positions: Vec<u32> = items.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_compare_and_set_single_winner() {
        let store = Arc::new(MemoryPipelineStore::new());
        let b = batch();
        store.insert_batch(&b).await.unwrap();
        let inserted = store.insert_items(b.id, vec![item(&b, 0)]).await.unwrap();
        let id = inserted[0].id;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut next = store.find_item(id).await.unwrap().unwrap();
                next.status = ItemStatus::Preprocessing;
                store.compare_and_set(id, ItemStatus::Pending, &mut next).await.unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_revision() {
        let store = MemoryPipelineStore::new();
        let b = batch();
        store.insert_batch(&b).await.unwrap();
        let id = store.insert_items(b.id, vec![item(&b, 0)]).await.unwrap()[0].id;

        let mut slow = store.find_item(id).await.unwrap().unwrap();
        let mut fast = slow.clone();
        assert!(store.compare_and_set(id, ItemStatus::Pending, &mut fast).await.unwrap());
        assert_eq!(fast.revision, 1);

        // Same status, older revision
        slow.last_error = Some("late".into());
        assert!(!store.compare_and_set(id, ItemStatus::Pending, &mut slow).await.unwrap());
        assert_eq!(slow.revision, 0);
        let stored = store.find_item(id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_promoted_batch_status_is_frozen() {
        let store = MemoryPipelineStore::new();
        let b = batch();
        store.insert_batch(&b).await.unwrap();
        store.update_batch_status(b.id, BatchStatus::Promoted).await.unwrap();
        store.update_batch_status(b.id, BatchStatus::Parsing).await.unwrap();
        let stored = store.find_batch(b.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Promoted);
    }

    #[tokio::test]
    async fn test_destination_upsert_is_idempotent() {
        let dest = MemoryDestination::new();
        let doc = CanonicalDocument::new(DocType::Invoice);
        let first = dest
            .upsert_by_content_hash("t1", "abc", PromotionTarget::Invoices, &doc)
            .await
            .unwrap();
        let second = dest
            .upsert_by_content_hash("t1", "abc", PromotionTarget::Invoices, &doc)
            .await
            .unwrap();
        assert!(!first.was_duplicate);
        assert!(second.was_duplicate);
        assert_eq!(first.target_id, second.target_id);
        assert_eq!(dest.records().await.len(), 1);

        let other_tenant = dest
            .upsert_by_content_hash("t2", "abc", PromotionTarget::Invoices, &doc)
            .await
            .unwrap();
        assert!(!other_tenant.was_duplicate);
    }
}
