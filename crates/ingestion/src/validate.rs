//! Document validation
//!
//! Checks a canonical document for required fields, arithmetic consistency
//! and the fiscal rules of its country. Problems come back as structured
//! item errors; nothing here fails the stage.

use async_trait::async_trait;
use chrono::Utc;
use ledgerforge_common::errors::Result;
use ledgerforge_common::ingest::{FieldError, Severity};
use ledgerforge_common::schema::{required_fields, CanonicalDocument, CanonicalField, DocType};
use ledgerforge_rules::{rule_pack_for, RuleError};

/// Largest tolerated difference between stated and computed amounts
pub const AMOUNT_TOLERANCE: f64 = 0.01;

pub const UNCLASSIFIED_DOCUMENT: &str = "UNCLASSIFIED_DOCUMENT";
pub const MISSING_FIELD: &str = "MISSING_FIELD";
pub const NO_AMOUNTS: &str = "NO_AMOUNTS";
pub const NEGATIVE_TOTAL: &str = "NEGATIVE_TOTAL";
pub const TOTALS_MISMATCH: &str = "TOTALS_MISMATCH";
pub const LINE_TOTAL_MISMATCH: &str = "LINE_TOTAL_MISMATCH";
pub const FUTURE_DATE: &str = "FUTURE_DATE";
pub const INVALID_CURRENCY: &str = "INVALID_CURRENCY";
pub const UNSUPPORTED_COUNTRY: &str = "UNSUPPORTED_COUNTRY";

/// Capability: canonical document to item errors
#[async_trait]
pub trait Validator: Send + Sync {
    /// Registry identifier
    fn id(&self) -> &'static str;

    async fn validate(&self, doc: &CanonicalDocument) -> Result<Vec<FieldError>>;
}

/// Structural, arithmetic and country-rule checks
pub struct DocumentValidator {
    default_country: Option<String>,
}

impl DocumentValidator {
    pub fn new(default_country: Option<String>) -> Self {
        Self { default_country }
    }

    /// All checks, synchronously. Pure apart from reading today's date.
    pub fn check(&self, doc: &CanonicalDocument) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if doc.doc_type == DocType::Generic {
            errors.push(FieldError::error(
                CanonicalField::DocType.as_str(),
                UNCLASSIFIED_DOCUMENT,
                "Document type could not be determined",
            ));
        }

        self.check_required(doc, &mut errors);
        self.check_amounts(doc, &mut errors);
        self.check_lines(doc, &mut errors);
        self.check_metadata(doc, &mut errors);
        self.check_country_rules(doc, &mut errors);

        errors
    }

    fn check_required(&self, doc: &CanonicalDocument, errors: &mut Vec<FieldError>) {
        let totals = &doc.totals;
        let no_amounts = totals.subtotal.is_none() && totals.tax.is_none() && totals.total.is_none();

        for &field in required_fields(doc.doc_type) {
            if doc.get_field(field).is_some() {
                continue;
            }
            if field == CanonicalField::TotalAmount && no_amounts {
                errors.push(FieldError::new(
                    Some(field.as_str()),
                    NO_AMOUNTS,
                    "Document carries no amounts",
                    Severity::Critical,
                ));
            } else {
                errors.push(FieldError::error(
                    field.as_str(),
                    MISSING_FIELD,
                    format!("{} is required for {}", field, doc.doc_type),
                ));
            }
        }
    }

    fn check_amounts(&self, doc: &CanonicalDocument, errors: &mut Vec<FieldError>) {
        let totals = &doc.totals;

        if let Some(total) = totals.total {
            if total < 0.0 && matches!(doc.doc_type, DocType::Invoice | DocType::ExpenseReceipt) {
                errors.push(FieldError::new(
                    Some(CanonicalField::TotalAmount.as_str()),
                    NEGATIVE_TOTAL,
                    format!("Total {:.2} is negative", total),
                    Severity::Critical,
                ));
            }
        }

        if let (Some(subtotal), Some(tax), Some(total)) = (totals.subtotal, totals.tax, totals.total) {
            let expected = subtotal + tax;
            if (expected - total).abs() > AMOUNT_TOLERANCE {
                errors.push(FieldError::error(
                    CanonicalField::TotalAmount.as_str(),
                    TOTALS_MISMATCH,
                    format!(
                        "subtotal {:.2} + tax {:.2} = {:.2}, but total is {:.2}",
                        subtotal, tax, expected, total
                    ),
                ));
            }
        }
    }

    fn check_lines(&self, doc: &CanonicalDocument, errors: &mut Vec<FieldError>) {
        for (idx, line) in doc.line_items.iter().enumerate() {
            if let (Some(qty), Some(price), Some(total)) = (line.quantity, line.unit_price, line.total) {
                let expected = qty * price;
                if (expected - total).abs() > AMOUNT_TOLERANCE {
                    errors.push(FieldError::new(
                        Some(CanonicalField::LineTotal.as_str()),
                        LINE_TOTAL_MISMATCH,
                        format!(
                            "line {}: {} x {:.2} = {:.2}, but line total is {:.2}",
                            idx + 1,
                            qty,
                            price,
                            expected,
                            total
                        ),
                        Severity::Warning,
                    ));
                }
            }
        }
    }

    fn check_metadata(&self, doc: &CanonicalDocument, errors: &mut Vec<FieldError>) {
        if let Some(date) = doc.issue_date {
            if date > Utc::now().date_naive() {
                errors.push(FieldError::new(
                    Some(CanonicalField::IssueDate.as_str()),
                    FUTURE_DATE,
                    format!("Issue date {} is in the future", date),
                    Severity::Warning,
                ));
            }
        }

        if let Some(ref currency) = doc.currency {
            let valid = currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase());
            if !valid {
                errors.push(FieldError::new(
                    Some(CanonicalField::Currency.as_str()),
                    INVALID_CURRENCY,
                    format!("'{}' is not an ISO 4217 currency code", currency),
                    Severity::Warning,
                ));
            }
        }
    }

    fn check_country_rules(&self, doc: &CanonicalDocument, errors: &mut Vec<FieldError>) {
        let explicit = doc.effective_country();
        let country = match explicit.or(self.default_country.as_deref()) {
            Some(country) => country,
            None => return,
        };

        let pack = match rule_pack_for(country) {
            Some(pack) => pack,
            None => {
                if explicit.is_some() {
                    errors.push(FieldError::new(
                        Some(CanonicalField::Country.as_str()),
                        UNSUPPORTED_COUNTRY,
                        format!("No fiscal rules registered for '{}'", country),
                        Severity::Warning,
                    ));
                }
                return;
            }
        };

        let mut push_rules = |rule_errors: Vec<RuleError>, field: Option<CanonicalField>| {
            errors.extend(rule_errors.into_iter().map(|e| {
                let field = field
                    .map(|f| f.as_str().to_string())
                    .or(e.field);
                FieldError {
                    field,
                    code: e.code.as_str().to_string(),
                    message: e.message,
                    severity: Severity::Error,
                }
            }));
        };

        if let Some(ref id) = doc.vendor.tax_id {
            push_rules(pack.validate_tax_id(id), Some(CanonicalField::VendorTaxId));
        }
        if let Some(ref id) = doc.buyer.tax_id {
            push_rules(pack.validate_tax_id(id), Some(CanonicalField::BuyerTaxId));
        }
        if doc.doc_type == DocType::Invoice {
            if let Some(ref number) = doc.invoice_number {
                push_rules(pack.validate_invoice_number(number), None);
            }
        }
        if let Some(ref key) = doc.access_key {
            push_rules(pack.validate_access_key(key), None);
        }
        for line in &doc.totals.tax_breakdown {
            push_rules(pack.validate_tax_rate(line.kind, line.rate), None);
        }
    }
}

#[async_trait]
impl Validator for DocumentValidator {
    fn id(&self) -> &'static str {
        "document"
    }

    async fn validate(&self, doc: &CanonicalDocument) -> Result<Vec<FieldError>> {
        Ok(self.check(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use ledgerforge_common::schema::LineItem;

    fn invoice() -> CanonicalDocument {
        let mut doc = CanonicalDocument::new(DocType::Invoice);
        doc.invoice_number = Some("F-001".into());
        doc.issue_date = NaiveDate::from_ymd_opt(2024, 1, 2);
        doc.totals.subtotal = Some(90.0);
        doc.totals.tax = Some(10.0);
        doc.totals.total = Some(100.0);
        doc
    }

    fn codes(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.code.as_str()).collect()
    }

    #[test]
    fn test_clean_invoice() {
        let validator = DocumentValidator::new(None);
        assert!(validator.check(&invoice()).is_empty());
    }

    #[test]
    fn test_totals_mismatch() {
        let mut doc = invoice();
        doc.totals.total = Some(120.0);
        let errors = DocumentValidator::new(None).check(&doc);
        assert_eq!(codes(&errors), vec![TOTALS_MISMATCH]);
        assert_eq!(errors[0].field.as_deref(), Some("total_amount"));
        assert_eq!(errors[0].severity, Severity::Error);
    }

    #[test]
    fn test_missing_fields_and_no_amounts() {
        let doc = CanonicalDocument::new(DocType::Invoice);
        let errors = DocumentValidator::new(None).check(&doc);
        assert_eq!(codes(&errors), vec![MISSING_FIELD, MISSING_FIELD, NO_AMOUNTS]);
        assert_eq!(errors[2].severity, Severity::Critical);
    }

    #[test]
    fn test_generic_and_negative_total() {
        let mut doc = CanonicalDocument::new(DocType::Generic);
        doc.totals.total = Some(-5.0);
        let errors = DocumentValidator::new(None).check(&doc);
        assert_eq!(codes(&errors), vec![UNCLASSIFIED_DOCUMENT]);

        let mut doc = invoice();
        doc.totals = Default::default();
        doc.totals.total = Some(-5.0);
        let errors = DocumentValidator::new(None).check(&doc);
        assert!(errors
            .iter()
            .any(|e| e.code == NEGATIVE_TOTAL && e.severity == Severity::Critical));
    }

    #[test]
    fn test_warnings() {
        let mut doc = invoice();
        doc.issue_date = Some(Utc::now().date_naive() + Duration::days(30));
        doc.currency = Some("DOLLARS".into());
        doc.line_items.push(LineItem {
            description: Some("Widget".into()),
            quantity: Some(2.0),
            unit_price: Some(10.0),
            total: Some(25.0),
            tax_code: None,
        });
        let errors = DocumentValidator::new(None).check(&doc);
        assert_eq!(codes(&errors), vec![LINE_TOTAL_MISMATCH, FUTURE_DATE, INVALID_CURRENCY]);
        assert!(errors.iter().all(|e| e.severity == Severity::Warning));
    }

    #[test]
    fn test_country_rules() {
        let mut doc = invoice();
        doc.country = Some("EC".into());
        doc.invoice_number = Some("001-002-000000123".into());
        doc.vendor.tax_id = Some("1790011674001".into());
        doc.buyer.tax_id = Some("1234".into());
        let errors = DocumentValidator::new(None).check(&doc);
        assert!(!errors.is_empty());
        assert!(errors
            .iter()
            .all(|e| e.field.as_deref() == Some("buyer_tax_id")));

        // Bad number format for the jurisdiction
        let mut doc = invoice();
        doc.invoice_number = Some("F-001".into());
        let errors = DocumentValidator::new(Some("EC".into())).check(&doc);
        assert_eq!(codes(&errors), vec!["INVOICE_NUMBER_FORMAT"]);
    }

    #[test]
    fn test_unsupported_country_is_warning() {
        let mut doc = invoice();
        doc.country = Some("ZZ".into());
        let errors = DocumentValidator::new(Some("EC".into())).check(&doc);
        assert_eq!(codes(&errors), vec![UNSUPPORTED_COUNTRY]);
        assert_eq!(errors[0].severity, Severity::Warning);
    }
}
