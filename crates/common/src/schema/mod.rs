//! Canonical document schema (version 1)
//!
//! The normalized representation every source document is mapped into,
//! plus the flat field catalogue used for errors, patches and exports.

mod document;
mod fields;
pub mod values;

pub use document::{
    CanonicalDocument, DocType, LineItem, Party, PromotionTarget, RoutingProposal, TaxLine,
    Totals, SCHEMA_VERSION,
};
pub use fields::{required_fields, CanonicalField};
