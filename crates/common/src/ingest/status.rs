//! Item state machine, pipeline stages and the batch aggregate

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

/// Lifecycle of a single item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Preprocessing,
    Preprocessed,
    OcrProcessing,
    OcrCompleted,
    Extracting,
    Extracted,
    Mapping,
    Mapped,
    Validating,
    Validated,
    NeedsReview,
    Rejected,
    Promoting,
    Promoted,
    PreprocessingFailed,
    OcrFailed,
    ExtractionFailed,
    MappingFailed,
    ValidationFailed,
    PromotionFailed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 21] = [
        ItemStatus::Pending,
        ItemStatus::Preprocessing,
        ItemStatus::Preprocessed,
        ItemStatus::OcrProcessing,
        ItemStatus::OcrCompleted,
        ItemStatus::Extracting,
        ItemStatus::Extracted,
        ItemStatus::Mapping,
        ItemStatus::Mapped,
        ItemStatus::Validating,
        ItemStatus::Validated,
        ItemStatus::NeedsReview,
        ItemStatus::Rejected,
        ItemStatus::Promoting,
        ItemStatus::Promoted,
        ItemStatus::PreprocessingFailed,
        ItemStatus::OcrFailed,
        ItemStatus::ExtractionFailed,
        ItemStatus::MappingFailed,
        ItemStatus::ValidationFailed,
        ItemStatus::PromotionFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::Preprocessing => "PREPROCESSING",
            ItemStatus::Preprocessed => "PREPROCESSED",
            ItemStatus::OcrProcessing => "OCR_PROCESSING",
            ItemStatus::OcrCompleted => "OCR_COMPLETED",
            ItemStatus::Extracting => "EXTRACTING",
            ItemStatus::Extracted => "EXTRACTED",
            ItemStatus::Mapping => "MAPPING",
            ItemStatus::Mapped => "MAPPED",
            ItemStatus::Validating => "VALIDATING",
            ItemStatus::Validated => "VALIDATED",
            ItemStatus::NeedsReview => "NEEDS_REVIEW",
            ItemStatus::Rejected => "REJECTED",
            ItemStatus::Promoting => "PROMOTING",
            ItemStatus::Promoted => "PROMOTED",
            ItemStatus::PreprocessingFailed => "PREPROCESSING_FAILED",
            ItemStatus::OcrFailed => "OCR_FAILED",
            ItemStatus::ExtractionFailed => "EXTRACTION_FAILED",
            ItemStatus::MappingFailed => "MAPPING_FAILED",
            ItemStatus::ValidationFailed => "VALIDATION_FAILED",
            ItemStatus::PromotionFailed => "PROMOTION_FAILED",
        }
    }

    /// One of the `_FAILED` terminals
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemStatus::PreprocessingFailed
                | ItemStatus::OcrFailed
                | ItemStatus::ExtractionFailed
                | ItemStatus::MappingFailed
                | ItemStatus::ValidationFailed
                | ItemStatus::PromotionFailed
        )
    }

    /// No further automatic transition leaves this state
    pub fn is_terminal(&self) -> bool {
        self.is_failure() || matches!(self, ItemStatus::Promoted | ItemStatus::Rejected)
    }

    /// A stage owns the item right now
    pub fn is_in_progress(&self) -> bool {
        Stage::ALL.iter().any(|s| s.in_progress() == *self)
    }

    /// Validation has not produced a verdict yet
    pub fn is_before_validation(&self) -> bool {
        matches!(
            self,
            ItemStatus::Pending
                | ItemStatus::Preprocessing
                | ItemStatus::Preprocessed
                | ItemStatus::OcrProcessing
                | ItemStatus::OcrCompleted
                | ItemStatus::Extracting
                | ItemStatus::Extracted
                | ItemStatus::Mapping
                | ItemStatus::Mapped
                | ItemStatus::Validating
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::Internal {
                message: format!("unknown item status '{}'", s),
            })
    }
}

/// A unit of pipeline work with a guarded entry and exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocess,
    Ocr,
    Extract,
    Map,
    Validate,
    Promote,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Preprocess,
        Stage::Ocr,
        Stage::Extract,
        Stage::Map,
        Stage::Validate,
        Stage::Promote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::Ocr => "ocr",
            Stage::Extract => "extract",
            Stage::Map => "map",
            Stage::Validate => "validate",
            Stage::Promote => "promote",
        }
    }

    /// States from which the stage may start
    pub fn pre_states(&self) -> &'static [ItemStatus] {
        match self {
            Stage::Preprocess => &[ItemStatus::Pending],
            Stage::Ocr => &[ItemStatus::Preprocessed],
            Stage::Extract => &[ItemStatus::Preprocessed, ItemStatus::OcrCompleted],
            Stage::Map => &[ItemStatus::Extracted],
            Stage::Validate => &[ItemStatus::Mapped],
            Stage::Promote => &[ItemStatus::Validated],
        }
    }

    pub fn in_progress(&self) -> ItemStatus {
        match self {
            Stage::Preprocess => ItemStatus::Preprocessing,
            Stage::Ocr => ItemStatus::OcrProcessing,
            Stage::Extract => ItemStatus::Extracting,
            Stage::Map => ItemStatus::Mapping,
            Stage::Validate => ItemStatus::Validating,
            Stage::Promote => ItemStatus::Promoting,
        }
    }

    /// Success state; validation picks its own outcome from the gate
    pub fn success(&self) -> ItemStatus {
        match self {
            Stage::Preprocess => ItemStatus::Preprocessed,
            Stage::Ocr => ItemStatus::OcrCompleted,
            Stage::Extract => ItemStatus::Extracted,
            Stage::Map => ItemStatus::Mapped,
            Stage::Validate => ItemStatus::Validated,
            Stage::Promote => ItemStatus::Promoted,
        }
    }

    pub fn failure(&self) -> ItemStatus {
        match self {
            Stage::Preprocess => ItemStatus::PreprocessingFailed,
            Stage::Ocr => ItemStatus::OcrFailed,
            Stage::Extract => ItemStatus::ExtractionFailed,
            Stage::Map => ItemStatus::MappingFailed,
            Stage::Validate => ItemStatus::ValidationFailed,
            Stage::Promote => ItemStatus::PromotionFailed,
        }
    }

    /// The stage owning an in-progress status
    pub fn owning(status: ItemStatus) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.in_progress() == status)
    }

    /// Status the reconciliation sweep requeues a stuck item to
    pub fn requeue_state(&self) -> ItemStatus {
        self.pre_states()[0]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a batch, derived from its items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Parsing,
    Validated,
    Ready,
    Promoted,
    Partial,
    Error,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 7] = [
        BatchStatus::Pending,
        BatchStatus::Parsing,
        BatchStatus::Validated,
        BatchStatus::Ready,
        BatchStatus::Promoted,
        BatchStatus::Partial,
        BatchStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Parsing => "PARSING",
            BatchStatus::Validated => "VALIDATED",
            BatchStatus::Ready => "READY",
            BatchStatus::Promoted => "PROMOTED",
            BatchStatus::Partial => "PARTIAL",
            BatchStatus::Error => "ERROR",
        }
    }

    /// Derive the batch status from its items' statuses
    pub fn aggregate<I>(statuses: I) -> BatchStatus
    where
        I: IntoIterator<Item = ItemStatus>,
    {
        let statuses: Vec<ItemStatus> = statuses.into_iter().collect();
        if statuses.is_empty() {
            return BatchStatus::Pending;
        }

        let failed = |s: &ItemStatus| s.is_failure() || *s == ItemStatus::Rejected;

        if statuses.iter().all(|s| *s == ItemStatus::Promoted) {
            return BatchStatus::Promoted;
        }
        if statuses.iter().all(failed) {
            return BatchStatus::Error;
        }
        if statuses.iter().all(|s| s.is_terminal()) {
            return BatchStatus::Partial;
        }
        if statuses.iter().any(|s| s.is_before_validation()) {
            return BatchStatus::Parsing;
        }
        let approved = |s: &ItemStatus| {
            matches!(
                s,
                ItemStatus::Validated | ItemStatus::Promoting | ItemStatus::Promoted
            )
        };
        if statuses.iter().filter(|s| !failed(*s)).all(approved) {
            BatchStatus::Ready
        } else {
            BatchStatus::Validated
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::Internal {
                message: format!("unknown batch status '{}'", s),
            })
    }
}
