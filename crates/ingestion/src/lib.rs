//! LedgerForge Ingestion
//!
//! Turns spreadsheets, JSON feeds, PDFs and scans into validated ledger
//! records: parse, extract, classify, map, validate, gate and promote,
//! with every step recorded on the item.

pub mod classify;
pub mod dedup;
pub mod errors;
pub mod extract;
pub mod gate;
pub mod insights;
pub mod mapping;
pub mod ocr;
pub mod parser;
pub mod pdf;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod service;
pub mod validate;
pub mod worker;

pub use pipeline::Pipeline;
pub use registry::ComponentRegistry;
pub use service::{IngestPayload, IngestionService, ItemPatch};
pub use worker::{WorkQueue, WorkerPool};
