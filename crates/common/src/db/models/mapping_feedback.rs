//! Mapping feedback entity (append-only)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::learning::MappingFeedback;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "mapping_feedback")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub tenant_id: String,

    #[sea_orm(column_type = "Text")]
    pub doc_type: String,

    #[sea_orm(column_type = "Text")]
    pub source_header: String,

    #[sea_orm(column_type = "Text")]
    pub field: String,

    pub correct: bool,

    pub recorded_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for MappingFeedback {
    type Error = AppError;

    fn try_from(m: Model) -> Result<Self, Self::Error> {
        Ok(MappingFeedback {
            tenant_id: m.tenant_id,
            doc_type: m.doc_type.parse()?,
            source_header: m.source_header,
            field: m.field.parse()?,
            correct: m.correct,
            recorded_at: m.recorded_at.into(),
        })
    }
}
