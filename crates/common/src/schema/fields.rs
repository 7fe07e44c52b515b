use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::document::DocType;
use crate::errors::AppError;

/// Flat address of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    DocType,
    InvoiceNumber,
    IssueDate,
    Subtotal,
    TaxAmount,
    TotalAmount,
    Currency,
    VendorName,
    VendorTaxId,
    BuyerName,
    BuyerTaxId,
    Country,
    PaymentMethod,
    AccessKey,
    Description,
    Quantity,
    UnitPrice,
    LineTotal,
    PackPrice,
    UnitsPerPack,
    TaxCode,
    TaxRate,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 22] = [
        CanonicalField::DocType,
        CanonicalField::InvoiceNumber,
        CanonicalField::IssueDate,
        CanonicalField::Subtotal,
        CanonicalField::TaxAmount,
        CanonicalField::TotalAmount,
        CanonicalField::Currency,
        CanonicalField::VendorName,
        CanonicalField::VendorTaxId,
        CanonicalField::BuyerName,
        CanonicalField::BuyerTaxId,
        CanonicalField::Country,
        CanonicalField::PaymentMethod,
        CanonicalField::AccessKey,
        CanonicalField::Description,
        CanonicalField::Quantity,
        CanonicalField::UnitPrice,
        CanonicalField::LineTotal,
        CanonicalField::PackPrice,
        CanonicalField::UnitsPerPack,
        CanonicalField::TaxCode,
        CanonicalField::TaxRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::DocType => "doc_type",
            CanonicalField::InvoiceNumber => "invoice_number",
            CanonicalField::IssueDate => "issue_date",
            CanonicalField::Subtotal => "subtotal",
            CanonicalField::TaxAmount => "tax_amount",
            CanonicalField::TotalAmount => "total_amount",
            CanonicalField::Currency => "currency",
            CanonicalField::VendorName => "vendor_name",
            CanonicalField::VendorTaxId => "vendor_tax_id",
            CanonicalField::BuyerName => "buyer_name",
            CanonicalField::BuyerTaxId => "buyer_tax_id",
            CanonicalField::Country => "country",
            CanonicalField::PaymentMethod => "payment_method",
            CanonicalField::AccessKey => "access_key",
            CanonicalField::Description => "description",
            CanonicalField::Quantity => "quantity",
            CanonicalField::UnitPrice => "unit_price",
            CanonicalField::LineTotal => "line_total",
            CanonicalField::PackPrice => "pack_price",
            CanonicalField::UnitsPerPack => "units_per_pack",
            CanonicalField::TaxCode => "tax_code",
            CanonicalField::TaxRate => "tax_rate",
        }
    }

    /// Fields holding monetary or numeric values
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            CanonicalField::Subtotal
                | CanonicalField::TaxAmount
                | CanonicalField::TotalAmount
                | CanonicalField::Quantity
                | CanonicalField::UnitPrice
                | CanonicalField::LineTotal
                | CanonicalField::PackPrice
                | CanonicalField::UnitsPerPack
                | CanonicalField::TaxRate
        )
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        // Nested spellings are accepted alongside the flat ones
        let key = match key {
            "totals.total" | "total" => "total_amount",
            "totals.subtotal" => "subtotal",
            "totals.tax" | "tax" => "tax_amount",
            "vendor.name" => "vendor_name",
            "vendor.tax_id" => "vendor_tax_id",
            "buyer.name" => "buyer_name",
            "buyer.tax_id" => "buyer_tax_id",
            other => other,
        };
        CanonicalField::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == key)
            .ok_or_else(|| AppError::Validation {
                message: format!("unknown canonical field '{}'", s),
                field: Some(s.to_string()),
            })
    }
}

/// Fields a document of the given type must carry
pub fn required_fields(doc_type: DocType) -> &'static [CanonicalField] {
    match doc_type {
        DocType::Invoice => &[
            CanonicalField::InvoiceNumber,
            CanonicalField::IssueDate,
            CanonicalField::TotalAmount,
        ],
        DocType::ExpenseReceipt | DocType::BankMovement => {
            &[CanonicalField::IssueDate, CanonicalField::TotalAmount]
        }
        DocType::ProductList => &[CanonicalField::Description],
        DocType::Generic => &[],
    }
}
