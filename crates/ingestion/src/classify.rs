//! Document-type scoring engine
//!
//! Each candidate type collects a score from registered rules (functions of
//! the raw fields) and semantic signals (keywords found in the serialized raw
//! data). The best type wins unless its score stays under the confidence
//! floor, in which case the document is GENERIC.

use async_trait::async_trait;
use ledgerforge_common::config::ClassificationConfig;
use ledgerforge_common::errors::Result;
use ledgerforge_common::ingest::Classification;
use ledgerforge_common::schema::DocType;
use std::collections::BTreeMap;
use tracing::debug;

use crate::insights::LearningInsights;
use crate::mapping::normalize_header;
use crate::parser::RawRow;

/// Largest score mass moved by tenant correction history for one type pair
const MAX_FEEDBACK_SHIFT: f64 = 0.2;
const FEEDBACK_SHIFT_PER_CORRECTION: f64 = 0.05;

/// A scoring rule: raw fields to a score in `[0, 1]`
pub type Rule = Box<dyn Fn(&RawRow) -> f64 + Send + Sync>;

/// Keywords that vote for a type when found in the raw data
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticSignal {
    pub doc_type: DocType,
    pub keywords: Vec<String>,
    pub weight: f64,
}

/// Where the document comes from
#[derive(Debug, Clone)]
pub struct ClassifyContext<'a> {
    pub tenant_id: &'a str,
    /// Type implied by the batch's source type
    pub source_hint: Option<DocType>,
}

/// Capability: raw fields to a document type
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Registry identifier
    fn id(&self) -> &'static str;

    async fn classify(&self, raw: &RawRow, ctx: &ClassifyContext<'_>) -> Result<Classification>;
}

pub struct ScoringEngine {
    rules: BTreeMap<DocType, Vec<Rule>>,
    signals: Vec<SemanticSignal>,
    confidence_floor: f64,
    source_hint_weight: f64,
    use_feedback: bool,
    insights: Option<LearningInsights>,
}

fn header_has(raw: &RawRow, needles: &[&str]) -> bool {
    raw.keys().any(|key| {
        let key = normalize_header(key);
        needles.iter().any(|n| key.contains(n))
    })
}

fn has_invoice_number(raw: &RawRow) -> bool {
    header_has(
        raw,
        &[
            "invoice number", "invoice no", "invoice num", "invoice #", "inv no",
            "bill no", "numero factura", "numero de factura", "nro factura", "factura no",
        ],
    ) || raw.keys().any(|k| normalize_header(k) == "invoice")
}

fn has_totals(raw: &RawRow) -> bool {
    header_has(raw, &["total", "amount", "importe", "monto"])
}

impl ScoringEngine {
    /// Engine without rules or signals
    pub fn new(config: &ClassificationConfig) -> Self {
        Self {
            rules: BTreeMap::new(),
            signals: Vec::new(),
            confidence_floor: config.confidence_floor,
            source_hint_weight: config.source_hint_weight,
            use_feedback: config.use_feedback,
            insights: None,
        }
    }

    /// Engine with the built-in rules and signals for every promotable type
    pub fn with_defaults(config: &ClassificationConfig) -> Self {
        let mut engine = Self::new(config);

        engine.register_rule(DocType::Invoice, |raw| {
            if has_invoice_number(raw) {
                0.5
            } else {
                0.0
            }
        });
        engine.register_rule(DocType::Invoice, |raw| if has_totals(raw) { 0.25 } else { 0.0 });
        engine.register_signal(DocType::Invoice, &["invoice", "factura", "bill"], 0.3);

        engine.register_rule(DocType::ExpenseReceipt, |raw| {
            if has_totals(raw) && !has_invoice_number(raw) {
                0.3
            } else {
                0.0
            }
        });
        engine.register_signal(
            DocType::ExpenseReceipt,
            &["receipt", "expense", "ticket", "recibo", "gasto"],
            0.5,
        );

        engine.register_rule(DocType::BankMovement, |raw| {
            if header_has(
                raw,
                &["iban", "balance", "saldo", "debit", "credit", "debe", "haber", "account number"],
            ) {
                0.5
            } else {
                0.0
            }
        });
        engine.register_signal(
            DocType::BankMovement,
            &["bank", "iban", "transfer", "deposit", "withdrawal", "banco", "transferencia"],
            0.4,
        );

        engine.register_rule(DocType::ProductList, |raw| {
            let product_columns = header_has(
                raw,
                &["sku", "qty", "quantity", "unit price", "cantidad", "precio unitario", "barcode", "ean"],
            );
            if product_columns && !header_has(raw, &["total"]) {
                0.5
            } else {
                0.0
            }
        });
        engine.register_signal(
            DocType::ProductList,
            &["product", "sku", "catalog", "inventory", "producto", "stock"],
            0.4,
        );

        engine
    }

    /// Bias scores with the tenant's misclassification history
    pub fn with_insights(mut self, insights: LearningInsights) -> Self {
        self.insights = Some(insights);
        self
    }

    pub fn register_rule<F>(&mut self, doc_type: DocType, rule: F)
    where
        F: Fn(&RawRow) -> f64 + Send + Sync + 'static,
    {
        self.rules.entry(doc_type).or_default().push(Box::new(rule));
    }

    pub fn register_signal(&mut self, doc_type: DocType, keywords: &[&str], weight: f64) {
        self.signals.push(SemanticSignal {
            doc_type,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            weight,
        });
    }

    /// Score every promotable type. Pure.
    pub fn score(&self, raw: &RawRow, source_hint: Option<DocType>) -> BTreeMap<DocType, f64> {
        let haystack = serde_json::to_string(raw)
            .unwrap_or_default()
            .to_lowercase();

        DocType::ALL
            .iter()
            .copied()
            .filter(|t| *t != DocType::Generic)
            .map(|doc_type| {
                let rules: f64 = self
                    .rules
                    .get(&doc_type)
                    .map(|rules| rules.iter().map(|r| r(raw).clamp(0.0, 1.0)).sum())
                    .unwrap_or(0.0);
                let signals: f64 = self
                    .signals
                    .iter()
                    .filter(|s| s.doc_type == doc_type)
                    .filter(|s| s.keywords.iter().any(|k| haystack.contains(k.as_str())))
                    .map(|s| s.weight)
                    .sum();
                let hint = if source_hint == Some(doc_type) {
                    self.source_hint_weight
                } else {
                    0.0
                };
                (doc_type, (rules + signals + hint).clamp(0.0, 1.0))
            })
            .collect()
    }

    /// Move score mass from a frequently corrected type to its correction,
    /// when that type is currently on top
    pub fn apply_feedback(
        scores: &mut BTreeMap<DocType, f64>,
        counts: &BTreeMap<(DocType, DocType), u32>,
    ) {
        let Some((top, _)) = Self::top(scores) else {
            return;
        };
        for (&(original, corrected), &count) in counts {
            if original != top || corrected == DocType::Generic {
                continue;
            }
            let shift = (FEEDBACK_SHIFT_PER_CORRECTION * count as f64).min(MAX_FEEDBACK_SHIFT);
            if let Some(score) = scores.get_mut(&original) {
                *score = (*score - shift).max(0.0);
            }
            let target = scores.entry(corrected).or_insert(0.0);
            *target = (*target + shift).min(1.0);
        }
    }

    fn top(scores: &BTreeMap<DocType, f64>) -> Option<(DocType, f64)> {
        // First type in declaration order wins ties
        scores
            .iter()
            .fold(None, |best: Option<(DocType, f64)>, (&t, &s)| match best {
                Some((_, bs)) if bs >= s => best,
                _ => Some((t, s)),
            })
    }

    /// Pick the type from the scores, applying the confidence floor
    pub fn decide(&self, scores: &BTreeMap<DocType, f64>) -> (DocType, f64) {
        match Self::top(scores) {
            Some((doc_type, score)) if score >= self.confidence_floor => (doc_type, score),
            Some((_, score)) => (DocType::Generic, score),
            None => (DocType::Generic, 0.0),
        }
    }
}

#[async_trait]
impl Classifier for ScoringEngine {
    fn id(&self) -> &'static str {
        "scoring"
    }

    async fn classify(&self, raw: &RawRow, ctx: &ClassifyContext<'_>) -> Result<Classification> {
        let mut scores = self.score(raw, ctx.source_hint);

        if let Some(ref insights) = self.insights {
            if self.use_feedback {
                let counts = insights.misclassification_counts(ctx.tenant_id).await?;
                Self::apply_feedback(&mut scores, &counts);
            }
        }

        let (doc_type, confidence) = self.decide(&scores);
        debug!(doc_type = %doc_type, confidence, "Classified document");

        Ok(Classification {
            doc_type,
            confidence,
            scores,
            classifier: self.id().to_string(),
        })
    }
}
