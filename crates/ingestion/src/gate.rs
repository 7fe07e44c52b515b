//! Confidence gate
//!
//! Combines the four per-item confidences into one weighted score and decides
//! whether the item promotes automatically, waits for a reviewer or is
//! blocked. The gate reads scores and errors only; it never touches the item.

use ledgerforge_common::config::GateConfig;
use ledgerforge_common::ingest::{
    ConfidenceScores, FieldError, GateDecision, GateOutcome, ItemStatus, Severity,
};
use ledgerforge_common::metrics;

#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    config: GateConfig,
}

/// `1 - Σ severity weights`, floored at zero
pub fn validation_confidence(errors: &[FieldError]) -> f64 {
    let penalty: f64 = errors.iter().map(|e| e.severity.weight()).sum();
    (1.0 - penalty).max(0.0)
}

impl ConfidenceGate {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Weighted mean of the four confidences
    pub fn overall(&self, scores: &ConfidenceScores) -> f64 {
        let c = &self.config;
        let weights = c.parser_weight + c.classification_weight + c.mapping_weight + c.validation_weight;
        if weights <= 0.0 {
            return 0.0;
        }
        let sum = scores.parser.clamp(0.0, 1.0) * c.parser_weight
            + scores.classification.clamp(0.0, 1.0) * c.classification_weight
            + scores.mapping.clamp(0.0, 1.0) * c.mapping_weight
            + scores.validation.clamp(0.0, 1.0) * c.validation_weight;
        sum / weights
    }

    pub fn evaluate(&self, scores: ConfidenceScores) -> GateOutcome {
        let overall = self.overall(&scores);
        let decision = if overall >= self.config.auto_approve_threshold {
            GateDecision::AutoApprove
        } else if overall >= self.config.review_threshold {
            GateDecision::NeedsReview
        } else {
            GateDecision::BlockPromotion
        };
        GateOutcome {
            decision,
            overall,
            scores,
            capped: false,
        }
    }

    /// Gate outcome and the item status it leads to, given the item's errors
    pub fn decide_item(&self, scores: ConfidenceScores, errors: &[FieldError]) -> (GateOutcome, ItemStatus) {
        let mut outcome = self.evaluate(scores);

        let status = if errors.iter().any(|e| e.severity == Severity::Critical) {
            ItemStatus::Rejected
        } else {
            if outcome.decision == GateDecision::AutoApprove
                && errors.iter().any(|e| e.severity == Severity::Error)
            {
                outcome.decision = GateDecision::NeedsReview;
                outcome.capped = true;
            }
            match outcome.decision {
                GateDecision::AutoApprove => ItemStatus::Validated,
                GateDecision::NeedsReview => ItemStatus::NeedsReview,
                GateDecision::BlockPromotion => ItemStatus::Rejected,
            }
        };

        metrics::record_gate_decision(outcome.decision.as_str(), outcome.overall);
        (outcome, status)
    }
}
