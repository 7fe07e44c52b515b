use chrono::NaiveDate;
use ledgerforge_rules::TaxKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::fields::CanonicalField;
use super::values::{amount_from_value, date_from_value, text_from_value};
use crate::errors::{AppError, Result};

pub const SCHEMA_VERSION: u32 = 1;

/// Document type decided by the scoring engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocType {
    Invoice,
    ExpenseReceipt,
    BankMovement,
    ProductList,
    Generic,
}

impl DocType {
    pub const ALL: [DocType; 5] = [
        DocType::Invoice,
        DocType::ExpenseReceipt,
        DocType::BankMovement,
        DocType::ProductList,
        DocType::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Invoice => "INVOICE",
            DocType::ExpenseReceipt => "EXPENSE_RECEIPT",
            DocType::BankMovement => "BANK_MOVEMENT",
            DocType::ProductList => "PRODUCT_LIST",
            DocType::Generic => "GENERIC",
        }
    }

    /// Destination table for promoted documents; GENERIC is never promoted
    pub fn promotion_target(&self) -> Option<PromotionTarget> {
        match self {
            DocType::Invoice => Some(PromotionTarget::Invoices),
            DocType::ExpenseReceipt => Some(PromotionTarget::Expenses),
            DocType::BankMovement => Some(PromotionTarget::BankMovements),
            DocType::ProductList => Some(PromotionTarget::Products),
            DocType::Generic => None,
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        match upper.as_str() {
            "INVOICE" => Ok(DocType::Invoice),
            "EXPENSE_RECEIPT" | "RECEIPT" | "EXPENSE" => Ok(DocType::ExpenseReceipt),
            "BANK_MOVEMENT" | "BANK" => Ok(DocType::BankMovement),
            "PRODUCT_LIST" | "PRODUCT" => Ok(DocType::ProductList),
            "GENERIC" => Ok(DocType::Generic),
            _ => Err(AppError::Validation {
                message: format!("unknown document type '{}'", s),
                field: Some("doc_type".into()),
            }),
        }
    }
}

/// Ledger destination a promoted document lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionTarget {
    Invoices,
    Expenses,
    BankMovements,
    Products,
}

impl PromotionTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionTarget::Invoices => "invoices",
            PromotionTarget::Expenses => "expenses",
            PromotionTarget::BankMovements => "bank_movements",
            PromotionTarget::Products => "products",
        }
    }
}

impl fmt::Display for PromotionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromotionTarget {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "invoices" => Ok(PromotionTarget::Invoices),
            "expenses" => Ok(PromotionTarget::Expenses),
            "bank_movements" => Ok(PromotionTarget::BankMovements),
            "products" => Ok(PromotionTarget::Products),
            other => Err(AppError::Internal {
                message: format!("unknown promotion target '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub name: Option<String>,
    pub tax_id: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLine {
    pub kind: TaxKind,
    /// Rate in percent
    pub rate: f64,
    pub base: Option<f64>,
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Option<f64>,
    pub tax: Option<f64>,
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tax_breakdown: Vec<TaxLine>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub total: Option<f64>,
    pub tax_code: Option<String>,
}

/// Ledger routing suggestion attached to a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingProposal {
    pub category: String,
    pub account: Option<String>,
    pub confidence: f64,
}

/// The normalized, validated form of a source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    pub schema_version: u32,
    pub doc_type: DocType,
    pub country: Option<String>,
    pub currency: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub invoice_number: Option<String>,
    pub access_key: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub vendor: Party,
    #[serde(default)]
    pub buyer: Party,
    #[serde(default)]
    pub totals: Totals,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub line_items: Vec<LineItem>,
    pub payment_method: Option<String>,
    pub source_confidence: f64,
    pub routing: Option<RoutingProposal>,
    /// Source fields without a canonical home
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl CanonicalDocument {
    pub fn new(doc_type: DocType) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            doc_type,
            country: None,
            currency: None,
            issue_date: None,
            invoice_number: None,
            access_key: None,
            description: None,
            vendor: Party::default(),
            buyer: Party::default(),
            totals: Totals::default(),
            line_items: Vec::new(),
            payment_method: None,
            source_confidence: 0.0,
            routing: None,
            extra: BTreeMap::new(),
        }
    }

    /// Country of the document, falling back to the vendor's
    pub fn effective_country(&self) -> Option<&str> {
        self.country.as_deref().or(self.vendor.country.as_deref())
    }

    fn line_item_mut(&mut self) -> &mut LineItem {
        if self.line_items.is_empty() {
            self.line_items.push(LineItem::default());
        }
        &mut self.line_items[0]
    }

    /// Read a flat field as JSON
    pub fn get_field(&self, field: CanonicalField) -> Option<Value> {
        let line = self.line_items.first();
        match field {
            CanonicalField::DocType => Some(Value::from(self.doc_type.as_str())),
            CanonicalField::InvoiceNumber => self.invoice_number.clone().map(Value::from),
            CanonicalField::IssueDate => self.issue_date.map(|d| Value::from(d.to_string())),
            CanonicalField::Subtotal => self.totals.subtotal.map(Value::from),
            CanonicalField::TaxAmount => self.totals.tax.map(Value::from),
            CanonicalField::TotalAmount => self.totals.total.map(Value::from),
            CanonicalField::Currency => self.currency.clone().map(Value::from),
            CanonicalField::VendorName => self.vendor.name.clone().map(Value::from),
            CanonicalField::VendorTaxId => self.vendor.tax_id.clone().map(Value::from),
            CanonicalField::BuyerName => self.buyer.name.clone().map(Value::from),
            CanonicalField::BuyerTaxId => self.buyer.tax_id.clone().map(Value::from),
            CanonicalField::Country => self.country.clone().map(Value::from),
            CanonicalField::PaymentMethod => self.payment_method.clone().map(Value::from),
            CanonicalField::AccessKey => self.access_key.clone().map(Value::from),
            CanonicalField::Description => self.description.clone().map(Value::from),
            CanonicalField::Quantity => line.and_then(|l| l.quantity).map(Value::from),
            CanonicalField::UnitPrice => line.and_then(|l| l.unit_price).map(Value::from),
            CanonicalField::LineTotal => line.and_then(|l| l.total).map(Value::from),
            CanonicalField::TaxCode => line.and_then(|l| l.tax_code.clone()).map(Value::from),
            CanonicalField::TaxRate => self.totals.tax_breakdown.first().map(|t| Value::from(t.rate)),
            CanonicalField::PackPrice | CanonicalField::UnitsPerPack => {
                self.extra.get(field.as_str()).cloned()
            }
        }
    }

    /// Write a flat field from JSON, parsing localized amounts and dates.
    /// A null value clears the field.
    pub fn set_field(&mut self, field: CanonicalField, value: &Value) -> Result<()> {
        let invalid = |kind: &str| AppError::Validation {
            message: format!("'{}' is not a valid {}", value, kind),
            field: Some(field.as_str().to_string()),
        };
        let amount = || -> Result<Option<f64>> {
            if value.is_null() {
                return Ok(None);
            }
            amount_from_value(value).map(Some).ok_or_else(|| invalid("amount"))
        };
        let text = text_from_value(value);

        match field {
            CanonicalField::DocType => {
                let raw = text.ok_or_else(|| invalid("document type"))?;
                self.doc_type = raw.parse()?;
            }
            CanonicalField::InvoiceNumber => self.invoice_number = text,
            CanonicalField::IssueDate => {
                self.issue_date = if value.is_null() {
                    None
                } else {
                    Some(date_from_value(value).ok_or_else(|| invalid("date"))?)
                };
            }
            CanonicalField::Subtotal => self.totals.subtotal = amount()?,
            CanonicalField::TaxAmount => self.totals.tax = amount()?,
            CanonicalField::TotalAmount => self.totals.total = amount()?,
            CanonicalField::Currency => self.currency = text.map(|t| t.to_ascii_uppercase()),
            CanonicalField::VendorName => self.vendor.name = text,
            CanonicalField::VendorTaxId => self.vendor.tax_id = text,
            CanonicalField::BuyerName => self.buyer.name = text,
            CanonicalField::BuyerTaxId => self.buyer.tax_id = text,
            CanonicalField::Country => self.country = text.map(|t| t.to_ascii_uppercase()),
            CanonicalField::PaymentMethod => self.payment_method = text,
            CanonicalField::AccessKey => self.access_key = text,
            CanonicalField::Description => self.description = text,
            CanonicalField::Quantity => {
                let parsed = amount()?;
                self.line_item_mut().quantity = parsed;
            }
            CanonicalField::UnitPrice => {
                let parsed = amount()?;
                self.line_item_mut().unit_price = parsed;
            }
            CanonicalField::LineTotal => {
                let parsed = amount()?;
                self.line_item_mut().total = parsed;
            }
            CanonicalField::TaxCode => self.line_item_mut().tax_code = text,
            CanonicalField::TaxRate => match amount()? {
                Some(rate) => {
                    let (base, tax) = (self.totals.subtotal, self.totals.tax);
                    match self.totals.tax_breakdown.first_mut() {
                        Some(line) => line.rate = rate,
                        None => self.totals.tax_breakdown.push(TaxLine {
                            kind: TaxKind::Vat,
                            rate,
                            base,
                            amount: tax,
                        }),
                    }
                }
                None => self.totals.tax_breakdown.clear(),
            },
            CanonicalField::PackPrice | CanonicalField::UnitsPerPack => match amount()? {
                Some(v) => {
                    self.extra.insert(field.as_str().to_string(), Value::from(v));
                }
                None => {
                    self.extra.remove(field.as_str());
                }
            },
        }
        Ok(())
    }
}
