//! Item entity

use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::ingest::{Item, SourceDocument};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub batch_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub tenant_id: String,

    /// Insertion order, unique within the batch
    pub position: i32,

    pub source_index: i32,

    /// `tenant:source-file:index`, unique per tenant
    #[sea_orm(column_type = "Text")]
    pub idempotency_key: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub raw: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub document_name: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub document_mime: Option<String>,

    pub document_bytes: Option<Vec<u8>>,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub normalized: Option<Json>,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub errors: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub content_hash: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub promoted_to: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub promoted_id: Option<String>,

    /// Attempts per stage
    #[sea_orm(column_type = "JsonBinary")]
    pub attempts: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub lineage: Json,

    pub revision: i64,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::batch::Entity",
        from = "Column::BatchId",
        to = "super::batch::Column::Id"
    )]
    Batch,
}

impl Related<super::batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Item {
    type Error = AppError;

    fn try_from(m: Model) -> std::result::Result<Self, Self::Error> {
        let raw = match m.raw {
            Json::Object(map) => map,
            other => {
                return Err(AppError::Internal {
                    message: format!("item {} raw payload is not an object: {}", m.id, other),
                })
            }
        };

        let document = match (m.document_name, m.document_mime) {
            (Some(file_name), Some(mime_type)) => Some(SourceDocument {
                file_name,
                mime_type,
                bytes: m.document_bytes.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Item {
            id: m.id,
            batch_id: m.batch_id,
            tenant_id: m.tenant_id,
            position: m.position as u32,
            source_index: m.source_index as u32,
            idempotency_key: m.idempotency_key,
            raw,
            document,
            normalized: m.normalized.map(serde_json::from_value).transpose()?,
            status: m.status.parse()?,
            errors: serde_json::from_value(m.errors)?,
            content_hash: m.content_hash,
            promoted_to: m.promoted_to,
            promoted_id: m.promoted_id,
            attempts: serde_json::from_value(m.attempts)?,
            last_error: m.last_error,
            lineage: serde_json::from_value(m.lineage)?,
            revision: m.revision as u64,
            created_at: m.created_at.into(),
            updated_at: m.updated_at.into(),
        })
    }
}

/// Full active model for an item; every column is set
pub fn active_model(item: &Item) -> std::result::Result<ActiveModel, AppError> {
    let document = item.document.as_ref();
    Ok(ActiveModel {
        id: Set(item.id),
        batch_id: Set(item.batch_id),
        tenant_id: Set(item.tenant_id.clone()),
        position: Set(item.position as i32),
        source_index: Set(item.source_index as i32),
        idempotency_key: Set(item.idempotency_key.clone()),
        raw: Set(Json::Object(item.raw.clone())),
        document_name: Set(document.map(|d| d.file_name.clone())),
        document_mime: Set(document.map(|d| d.mime_type.clone())),
        document_bytes: Set(document.map(|d| d.bytes.clone())),
        normalized: Set(item.normalized.as_ref().map(serde_json::to_value).transpose()?),
        status: Set(item.status.as_str().to_string()),
        errors: Set(serde_json::to_value(&item.errors)?),
        content_hash: Set(item.content_hash.clone()),
        promoted_to: Set(item.promoted_to.clone()),
        promoted_id: Set(item.promoted_id.clone()),
        attempts: Set(serde_json::to_value(&item.attempts)?),
        last_error: Set(item.last_error.clone()),
        lineage: Set(serde_json::to_value(&item.lineage)?),
        revision: Set(item.revision as i64),
        created_at: Set(item.created_at.into()),
        updated_at: Set(item.updated_at.into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ItemStatus, Stage};
    use serde_json::json;
    use sea_orm::TryIntoModel;

    #[test]
    fn test_item_survives_row_conversion() {
        let raw = json!({"invoice_number": "F-001", "total": 100});
        let mut item = Item::new(
            Uuid::now_v7(),
            "t1",
            3,
            Item::idempotency_key_for("t1", "march.csv", 3),
            raw.as_object().cloned().unwrap(),
            Some(SourceDocument {
                file_name: "march.csv".into(),
                mime_type: "text/csv".into(),
                bytes: b"invoice_number,total".to_vec(),
            }),
        );
        item.status = ItemStatus::Mapped;
        item.attempts.insert(Stage::Map, 2);

        let model = active_model(&item).unwrap().try_into_model().unwrap();
        let restored = Item::try_from(model).unwrap();

        assert_eq!(restored.id, item.id);
        assert_eq!(restored.status, ItemStatus::Mapped);
        assert_eq!(restored.raw, item.raw);
        assert_eq!(restored.attempts_for(Stage::Map), 2);
        assert_eq!(restored.document.unwrap().bytes, b"invoice_number,total".to_vec());
    }
}
