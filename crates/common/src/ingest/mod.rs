//! Batch and item model
//!
//! Batches group items submitted together; items move through the
//! pipeline state machine one guarded transition at a time.

mod batch;
mod item;
mod lineage;
mod status;

pub use batch::{Batch, NewBatch, Origin, SourceType};
pub use item::{FieldError, Item, Severity, SourceDocument};
pub use lineage::{
    Classification, ConfidenceScores, FieldMapping, GateDecision, GateOutcome, Lineage,
};
pub use status::{BatchStatus, ItemStatus, Stage};
