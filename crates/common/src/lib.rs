//! LedgerForge Common Library
//!
//! Shared code for the LedgerForge ingestion pipeline including:
//! - Canonical document schema and value parsing
//! - Batch/item model and the item state machine
//! - Storage and learning-log seams with in-memory and SeaORM implementations
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod errors;
pub mod ingest;
pub mod learning;
pub mod metrics;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use errors::{AppError, ErrorKind, Result};
pub use ingest::{Batch, BatchStatus, Item, ItemStatus, Stage};
pub use learning::LearningLog;
pub use schema::{CanonicalDocument, CanonicalField, DocType};
pub use store::{DestinationRepository, PipelineStore};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
