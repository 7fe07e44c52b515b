//! Per-item provenance: how each value in the canonical document came to be

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::schema::{CanonicalField, DocType};

/// Result of the scoring engine for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub doc_type: DocType,
    pub confidence: f64,
    /// Score per candidate type
    pub scores: BTreeMap<DocType, f64>,
    /// Identifier of the classifier that produced it
    pub classifier: String,
}

/// How one source header was mapped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_header: String,
    pub field: Option<CanonicalField>,
    pub confidence: f64,
    /// Taken from tenant feedback rather than the dictionary
    #[serde(default)]
    pub learned: bool,
}

/// The four confidence inputs of the gate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScores {
    pub parser: f64,
    pub classification: f64,
    pub mapping: f64,
    pub validation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDecision {
    AutoApprove,
    NeedsReview,
    BlockPromotion,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::AutoApprove => "AUTO_APPROVE",
            GateDecision::NeedsReview => "NEEDS_REVIEW",
            GateDecision::BlockPromotion => "BLOCK_PROMOTION",
        }
    }
}

/// Gate decision with its full breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub decision: GateDecision,
    pub overall: f64,
    pub scores: ConfidenceScores,
    /// Set when error-severity issues capped an otherwise automatic approval
    #[serde(default)]
    pub capped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    /// Text recovered from a binary document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f64>,
    /// Raw key/value fields the mapper worked from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_fields: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<FieldMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping_confidence: Option<f64>,
    /// Fields computed from others, e.g. `unit_price <- pack_price / units_per_pack`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateOutcome>,
}

impl Lineage {
    /// Source header currently mapped to `field`, if any
    pub fn header_for(&self, field: CanonicalField) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.field == Some(field))
            .map(|m| m.source_header.as_str())
    }
}
