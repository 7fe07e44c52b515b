//! Aggregates over the learning log
//!
//! Reads the append-only records and turns them into the numbers the
//! scoring engine and the mapper consume. Nothing here writes.

use ledgerforge_common::errors::Result;
use ledgerforge_common::learning::LearningLog;
use ledgerforge_common::schema::{CanonicalField, DocType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::mapping::normalize_header;

/// Laplace-smoothed share of confirmations: `(correct + 1) / (total + 2)`
pub fn laplace(correct: u32, total: u32) -> f64 {
    (correct as f64 + 1.0) / (total as f64 + 2.0)
}

/// The tenant's best-supported field for one source header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedMapping {
    pub field: CanonicalField,
    pub confidence: f64,
    pub observations: u32,
}

#[derive(Clone)]
pub struct LearningInsights {
    log: Arc<dyn LearningLog>,
}

impl LearningInsights {
    pub fn new(log: Arc<dyn LearningLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<dyn LearningLog> {
        &self.log
    }

    /// How often each `original -> corrected` pair was corrected for the tenant
    pub async fn misclassification_counts(
        &self,
        tenant_id: &str,
    ) -> Result<BTreeMap<(DocType, DocType), u32>> {
        let mut counts = BTreeMap::new();
        for record in self.log.misclassifications(tenant_id).await? {
            if record.original != record.corrected {
                *counts.entry((record.original, record.corrected)).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Overall classification accuracy: `1 - corrections / classifications`.
    /// None until the tenant has any classification on record.
    pub async fn accuracy(&self, tenant_id: &str) -> Result<Option<f64>> {
        let events = self.log.classification_events(tenant_id).await?.len();
        if events == 0 {
            return Ok(None);
        }
        let corrections = self.log.misclassifications(tenant_id).await?.len();
        Ok(Some((1.0 - corrections as f64 / events as f64).max(0.0)))
    }

    /// Accuracy per originally assigned document type
    pub async fn accuracy_by_type(&self, tenant_id: &str) -> Result<BTreeMap<DocType, f64>> {
        let mut classified: BTreeMap<DocType, u32> = BTreeMap::new();
        for event in self.log.classification_events(tenant_id).await? {
            *classified.entry(event.doc_type).or_insert(0) += 1;
        }

        let mut corrected: BTreeMap<DocType, u32> = BTreeMap::new();
        for record in self.log.misclassifications(tenant_id).await? {
            *corrected.entry(record.original).or_insert(0) += 1;
        }

        Ok(classified
            .into_iter()
            .map(|(doc_type, total)| {
                let wrong = corrected.get(&doc_type).copied().unwrap_or(0);
                (doc_type, (1.0 - wrong as f64 / total as f64).max(0.0))
            })
            .collect())
    }

    /// Confidence that `header` means `field` for the tenant and document type
    pub async fn mapping_confidence(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        header: &str,
        field: CanonicalField,
    ) -> Result<f64> {
        let header = normalize_header(header);
        let (mut correct, mut total) = (0, 0);
        for feedback in self.log.mapping_feedback(tenant_id, Some(doc_type)).await? {
            if feedback.field == field && normalize_header(&feedback.source_header) == header {
                total += 1;
                if feedback.correct {
                    correct += 1;
                }
            }
        }
        Ok(laplace(correct, total))
    }

    /// Best learned field per normalized header
    pub async fn learned_mappings(
        &self,
        tenant_id: &str,
        doc_type: DocType,
    ) -> Result<HashMap<String, LearnedMapping>> {
        let mut tallies: HashMap<(String, CanonicalField), (u32, u32)> = HashMap::new();
        for feedback in self.log.mapping_feedback(tenant_id, Some(doc_type)).await? {
            let tally = tallies
                .entry((normalize_header(&feedback.source_header), feedback.field))
                .or_insert((0, 0));
            tally.1 += 1;
            if feedback.correct {
                tally.0 += 1;
            }
        }

        let mut best: HashMap<String, LearnedMapping> = HashMap::new();
        for ((header, field), (correct, total)) in tallies {
            let candidate = LearnedMapping {
                field,
                confidence: laplace(correct, total),
                observations: total,
            };
            let replace = match best.get(&header) {
                Some(current) => {
                    candidate.confidence > current.confidence
                        || (candidate.confidence == current.confidence
                            && candidate.field < current.field)
                }
                None => true,
            };
            if replace {
                best.insert(header, candidate);
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ledgerforge_common::learning::{
        ClassificationEvent, MappingFeedback, MemoryLearningLog, Misclassification,
    };
    use uuid::Uuid;

    fn feedback(header: &str, field: CanonicalField, correct: bool) -> MappingFeedback {
        MappingFeedback {
            tenant_id: "t1".into(),
            doc_type: DocType::Invoice,
            source_header: header.into(),
            field,
            correct,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_laplace() {
        assert_eq!(laplace(0, 0), 0.5);
        assert_eq!(laplace(2, 2), 0.75);
        assert!((laplace(0, 1) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_learned_mappings_pick_best_field() {
        let log = Arc::new(MemoryLearningLog::new());
        log.record_mapping_feedback(feedback("Importe_Final", CanonicalField::TotalAmount, true)).await.unwrap();
        log.record_mapping_feedback(feedback("importe final", CanonicalField::TotalAmount, true)).await.unwrap();
        log.record_mapping_feedback(feedback("Importe Final", CanonicalField::Subtotal, false)).await.unwrap();

        let insights = LearningInsights::new(log);
        let learned = insights.learned_mappings("t1", DocType::Invoice).await.unwrap();
        let best = &learned["importe final"];
        assert_eq!(best.field, CanonicalField::TotalAmount);
        assert_eq!(best.confidence, 0.75);
        assert_eq!(best.observations, 2);

        let conf = insights
            .mapping_confidence("t1", DocType::Invoice, "IMPORTE-FINAL", CanonicalField::Subtotal)
            .await
            .unwrap();
        assert!((conf - 1.0 / 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_accuracy_and_counts() {
        let log = Arc::new(MemoryLearningLog::new());
        let batch_id = Uuid::now_v7();
        for i in 0..4 {
            log.record_classification(ClassificationEvent {
                tenant_id: "t1".into(),
                batch_id,
                item_index: i,
                doc_type: DocType::Invoice,
                confidence: 0.8,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        log.record_misclassification(Misclassification {
            tenant_id: "t1".into(),
            batch_id,
            item_index: 0,
            original: DocType::Invoice,
            corrected: DocType::ExpenseReceipt,
            confidence: 0.8,
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();

        let insights = LearningInsights::new(log);
        assert_eq!(insights.accuracy("t1").await.unwrap(), Some(0.75));
        assert_eq!(insights.accuracy("other").await.unwrap(), None);
        assert_eq!(
            insights.accuracy_by_type("t1").await.unwrap()[&DocType::Invoice],
            0.75
        );
        let counts = insights.misclassification_counts("t1").await.unwrap();
        assert_eq!(counts[&(DocType::Invoice, DocType::ExpenseReceipt)], 1);
    }
}
