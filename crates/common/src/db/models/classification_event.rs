//! Classification event entity (append-only)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::learning::ClassificationEvent;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "classification_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub tenant_id: String,

    pub batch_id: Uuid,

    pub item_index: i32,

    #[sea_orm(column_type = "Text")]
    pub doc_type: String,

    pub confidence: f64,

    pub recorded_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for ClassificationEvent {
    type Error = AppError;

    fn try_from(m: Model) -> Result<Self, Self::Error> {
        Ok(ClassificationEvent {
            tenant_id: m.tenant_id,
            batch_id: m.batch_id,
            item_index: m.item_index as u32,
            doc_type: m.doc_type.parse()?,
            confidence: m.confidence,
            recorded_at: m.recorded_at.into(),
        })
    }
}
