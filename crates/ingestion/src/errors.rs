//! Ingestion error types
//!
//! Problems reading a submitted file. All of them are structural: retrying
//! the same bytes cannot succeed, so they convert into `AppError::InvalidFormat`.

use ledgerforge_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("PDF parse error for {name}: {message}")]
    PdfParse { name: String, message: String },

    #[error("Spreadsheet error for {name}: {message}")]
    Spreadsheet { name: String, message: String },

    #[error("CSV error at line {line}: {message}")]
    Csv { line: usize, message: String },

    #[error("JSON feed error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected JSON record at index {index}: expected an object")]
    NotAnObject { index: usize },

    #[error("No records found in {0}")]
    Empty(String),

    #[error("No parser accepts {mime}")]
    NoParser { mime: String },
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        AppError::InvalidFormat {
            message: e.to_string(),
        }
    }
}
