//! Batch entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::ingest::Batch;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "batches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub tenant_id: String,

    #[sea_orm(column_type = "Text")]
    pub source_type: String,

    #[sea_orm(column_type = "Text")]
    pub origin: String,

    /// Aggregate of the batch's items
    #[sea_orm(column_type = "Text")]
    pub status: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub mapping_template: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub file_ref: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub created_by: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub cancelled_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::item::Entity")]
    Items,
}

impl Related<super::item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Items.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Batch {
    type Error = AppError;

    fn try_from(m: Model) -> Result<Self, Self::Error> {
        Ok(Batch {
            id: m.id,
            tenant_id: m.tenant_id,
            source_type: m.source_type.parse()?,
            origin: m.origin.parse()?,
            status: m.status.parse()?,
            mapping_template: m.mapping_template,
            file_ref: m.file_ref,
            created_by: m.created_by,
            created_at: m.created_at.into(),
            updated_at: m.updated_at.into(),
            cancelled_at: m.cancelled_at.map(Into::into),
        })
    }
}

impl From<&Batch> for ActiveModel {
    fn from(b: &Batch) -> Self {
        use sea_orm::Set;
        ActiveModel {
            id: Set(b.id),
            tenant_id: Set(b.tenant_id.clone()),
            source_type: Set(b.source_type.as_str().to_string()),
            origin: Set(b.origin.as_str().to_string()),
            status: Set(b.status.as_str().to_string()),
            mapping_template: Set(b.mapping_template.clone()),
            file_ref: Set(b.file_ref.clone()),
            created_by: Set(b.created_by.clone()),
            created_at: Set(b.created_at.into()),
            updated_at: Set(b.updated_at.into()),
            cancelled_at: Set(b.cancelled_at.map(Into::into)),
        }
    }
}
