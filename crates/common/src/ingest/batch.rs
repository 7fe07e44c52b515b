use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use super::status::BatchStatus;
use crate::errors::AppError;
use crate::schema::DocType;

/// What the submitter says the batch contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Invoices,
    Bank,
    Receipts,
    ProductList,
    Generic,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Invoices => "invoices",
            SourceType::Bank => "bank",
            SourceType::Receipts => "receipts",
            SourceType::ProductList => "product_list",
            SourceType::Generic => "generic",
        }
    }

    /// Document type the source type hints at
    pub fn hinted_doc_type(&self) -> Option<DocType> {
        match self {
            SourceType::Invoices => Some(DocType::Invoice),
            SourceType::Bank => Some(DocType::BankMovement),
            SourceType::Receipts => Some(DocType::ExpenseReceipt),
            SourceType::ProductList => Some(DocType::ProductList),
            SourceType::Generic => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoices" => Ok(SourceType::Invoices),
            "bank" => Ok(SourceType::Bank),
            "receipts" => Ok(SourceType::Receipts),
            "product_list" => Ok(SourceType::ProductList),
            "generic" => Ok(SourceType::Generic),
            other => Err(AppError::Validation {
                message: format!("unknown source type '{}'", other),
                field: Some("source_type".into()),
            }),
        }
    }
}

/// How the batch's documents were captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Excel,
    Ocr,
    Api,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Excel => "excel",
            Origin::Ocr => "ocr",
            Origin::Api => "api",
        }
    }
}

impl FromStr for Origin {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "excel" => Ok(Origin::Excel),
            "ocr" => Ok(Origin::Ocr),
            "api" => Ok(Origin::Api),
            other => Err(AppError::Validation {
                message: format!("unknown origin '{}'", other),
                field: Some("origin".into()),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub tenant_id: String,
    pub source_type: SourceType,
    pub origin: Origin,
    pub status: BatchStatus,
    pub mapping_template: Option<String>,
    pub file_ref: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }
}

/// Request to open a batch
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewBatch {
    #[validate(length(min = 1, max = 128))]
    pub tenant_id: String,
    pub source_type: SourceType,
    pub origin: Origin,
    #[validate(length(max = 256))]
    pub mapping_template: Option<String>,
    #[validate(length(max = 1024))]
    pub file_ref: Option<String>,
    #[validate(length(max = 256))]
    pub created_by: Option<String>,
}

impl Batch {
    pub fn from_request(req: NewBatch) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            tenant_id: req.tenant_id,
            source_type: req.source_type,
            origin: req.origin,
            status: BatchStatus::Pending,
            mapping_template: req.mapping_template,
            file_ref: req.file_ref,
            created_by: req.created_by,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        }
    }
}
