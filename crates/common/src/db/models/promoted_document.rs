//! Promoted document entity, unique per (tenant, content hash)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "promoted_documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub tenant_id: String,

    #[sea_orm(column_type = "Text")]
    pub content_hash: String,

    /// invoices, expenses, bank_movements or products
    #[sea_orm(column_type = "Text")]
    pub target: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub document: Json,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
