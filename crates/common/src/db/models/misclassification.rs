//! Misclassification entity (append-only)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::learning::Misclassification;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "misclassifications")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub tenant_id: String,

    pub batch_id: Uuid,

    pub item_index: i32,

    #[sea_orm(column_type = "Text")]
    pub original_type: String,

    #[sea_orm(column_type = "Text")]
    pub corrected_type: String,

    /// Classifier confidence when the mistake was made
    pub confidence: f64,

    pub recorded_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Misclassification {
    type Error = AppError;

    fn try_from(m: Model) -> Result<Self, Self::Error> {
        Ok(Misclassification {
            tenant_id: m.tenant_id,
            batch_id: m.batch_id,
            item_index: m.item_index as u32,
            original: m.original_type.parse()?,
            corrected: m.corrected_type.parse()?,
            confidence: m.confidence,
            recorded_at: m.recorded_at.into(),
        })
    }
}
