//! Database schema initialization.

use sea_orm::ConnectionTrait;
use tracing::info;

use crate::db::DbPool;
use crate::errors::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id UUID PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    source_type TEXT NOT NULL,
    origin TEXT NOT NULL,
    status TEXT NOT NULL,
    mapping_template TEXT,
    file_ref TEXT,
    created_by TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    cancelled_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_batches_tenant ON batches (tenant_id);

CREATE TABLE IF NOT EXISTS items (
    id UUID PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES batches(id),
    tenant_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    source_index INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    raw JSONB NOT NULL,
    document_name TEXT,
    document_mime TEXT,
    document_bytes BYTEA,
    normalized JSONB,
    status TEXT NOT NULL,
    errors JSONB NOT NULL DEFAULT '[]',
    content_hash TEXT,
    promoted_to TEXT,
    promoted_id TEXT,
    attempts JSONB NOT NULL DEFAULT '{}',
    last_error TEXT,
    lineage JSONB NOT NULL DEFAULT '{}',
    revision BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT uq_items_idempotency UNIQUE (tenant_id, idempotency_key),
    CONSTRAINT uq_items_position UNIQUE (batch_id, position)
);

CREATE INDEX IF NOT EXISTS idx_items_status_updated ON items (status, updated_at);

ALTER TABLE items ADD COLUMN IF NOT EXISTS revision BIGINT NOT NULL DEFAULT 0;

CREATE TABLE IF NOT EXISTS mapping_feedback (
    id UUID PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    doc_type TEXT NOT NULL,
    source_header TEXT NOT NULL,
    field TEXT NOT NULL,
    correct BOOLEAN NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mapping_feedback_tenant ON mapping_feedback (tenant_id, doc_type);

CREATE TABLE IF NOT EXISTS misclassifications (
    id UUID PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    batch_id UUID NOT NULL,
    item_index INTEGER NOT NULL,
    original_type TEXT NOT NULL,
    corrected_type TEXT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_misclassifications_tenant ON misclassifications (tenant_id);

CREATE TABLE IF NOT EXISTS classification_events (
    id UUID PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    batch_id UUID NOT NULL,
    item_index INTEGER NOT NULL,
    doc_type TEXT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_classification_events_tenant ON classification_events (tenant_id);

CREATE TABLE IF NOT EXISTS promoted_documents (
    id UUID PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    target TEXT NOT NULL,
    document JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT uq_promoted_hash UNIQUE (tenant_id, content_hash)
);
"#;

/// Create every table and index the pipeline needs. Safe to run repeatedly.
pub async fn ensure_schema(pool: &DbPool) -> Result<()> {
    pool.write().execute_unprepared(SCHEMA).await?;
    info!("Database schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declares_uniqueness_constraints() {
        assert!(SCHEMA.contains("UNIQUE (tenant_id, idempotency_key)"));
        assert!(SCHEMA.contains("UNIQUE (batch_id, position)"));
        assert!(SCHEMA.contains("UNIQUE (tenant_id, content_hash)"));
    }

    #[test]
    fn test_schema_is_idempotent_ddl() {
        let creates = SCHEMA.matches("CREATE TABLE").count();
        let guarded = SCHEMA.matches("CREATE TABLE IF NOT EXISTS").count();
        assert_eq!(creates, guarded);
    }
}
