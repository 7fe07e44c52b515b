//! Content hashing for promotion
//!
//! Binary documents hash their bytes. Everything else hashes the canonical
//! JSON of the normalized document, with the run-dependent parts (source
//! confidence, routing proposal) zeroed so the same facts hash the same.

use ledgerforge_common::errors::{AppError, Result};
use ledgerforge_common::ingest::Item;
use sha2::{Digest, Sha256};

use crate::parser::is_binary_document;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Deduplication key of an item ready for promotion
pub fn content_hash(item: &Item) -> Result<String> {
    if let Some(ref doc) = item.document {
        if !doc.bytes.is_empty() && is_binary_document(&doc.mime_type) {
            return Ok(sha256_hex(&doc.bytes));
        }
    }

    let mut normalized = item.normalized.clone().ok_or_else(|| AppError::Internal {
        message: format!("item {} has no normalized document to hash", item.id),
    })?;
    normalized.source_confidence = 0.0;
    normalized.routing = None;

    Ok(sha256_hex(&serde_json::to_vec(&normalized)?))
}
