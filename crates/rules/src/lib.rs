//! LedgerForge Country Rule Packs
//!
//! Pure, deterministic fiscal validators grouped per jurisdiction:
//! - Tax identifier format and checksum validation
//! - Allowed tax rates per tax kind
//! - Invoice number structure
//! - Long-form access key checksums
//!
//! Validators never perform I/O. An empty error list means the value is valid.

mod checksum;
pub mod ecuador;
pub mod spain;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use ecuador::Ecuador;
pub use spain::Spain;

/// Machine-readable rule violation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleCode {
    InvalidLength,
    InvalidCharacters,
    InvalidFormat,
    Checksum,
    InvalidEstablishment,
    TaxRateNotAllowed,
    InvoiceNumberFormat,
}

impl RuleCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCode::InvalidLength => "INVALID_LENGTH",
            RuleCode::InvalidCharacters => "INVALID_CHARACTERS",
            RuleCode::InvalidFormat => "INVALID_FORMAT",
            RuleCode::Checksum => "CHECKSUM",
            RuleCode::InvalidEstablishment => "INVALID_ESTABLISHMENT",
            RuleCode::TaxRateNotAllowed => "TAX_RATE_NOT_ALLOWED",
            RuleCode::InvoiceNumberFormat => "INVOICE_NUMBER_FORMAT",
        }
    }
}

impl fmt::Display for RuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleError {
    pub code: RuleCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl RuleError {
    pub fn new(code: RuleCode, field: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

/// Canonical field names used by rule errors
pub mod fields {
    pub const TAX_ID: &str = "vendor_tax_id";
    pub const TAX_RATE: &str = "tax_rate";
    pub const INVOICE_NUMBER: &str = "invoice_number";
    pub const ACCESS_KEY: &str = "access_key";
}

/// Kind of tax a rate belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxKind {
    /// Value added tax (IVA)
    Vat,
    /// Excise duty (ICE in Ecuador)
    Excise,
    /// Equivalence surcharge (recargo de equivalencia in Spain)
    Surcharge,
}

/// Identifier subtype detected while validating a tax id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxIdKind {
    NaturalPerson,
    Company,
    PublicEntity,
    Foreigner,
}

/// A jurisdiction's bundle of fiscal validators
pub trait RulePack: Send + Sync {
    /// ISO 3166-1 alpha-2 country code
    fn country(&self) -> &'static str;

    /// Validate a tax identifier (format, then checksum)
    fn validate_tax_id(&self, id: &str) -> Vec<RuleError>;

    /// Detect the identifier subtype without validating the checksum
    fn tax_id_kind(&self, id: &str) -> Option<TaxIdKind>;

    /// Validate a tax rate, expressed in percent
    fn validate_tax_rate(&self, kind: TaxKind, rate: f64) -> Vec<RuleError>;

    /// Validate the structure of an invoice number
    fn validate_invoice_number(&self, number: &str) -> Vec<RuleError>;

    /// Validate a long-form access key; jurisdictions without one accept anything
    fn validate_access_key(&self, key: &str) -> Vec<RuleError>;
}

static ECUADOR: Ecuador = Ecuador;
static SPAIN: Spain = Spain;

/// Look up the rule pack for a country code (case-insensitive)
pub fn rule_pack_for(country: &str) -> Option<&'static dyn RulePack> {
    match country.trim().to_ascii_uppercase().as_str() {
        "EC" | "ECU" => Some(&ECUADOR),
        "ES" | "ESP" => Some(&SPAIN),
        _ => None,
    }
}

/// Country codes with a registered rule pack
pub fn supported_countries() -> &'static [&'static str] {
    &["EC", "ES"]
}

/// Shared rate check against an allowed set
pub(crate) fn check_rate(allowed: &[f64], kind: TaxKind, rate: f64, country: &str) -> Vec<RuleError> {
    const EPSILON: f64 = 1e-6;

    if allowed.iter().any(|a| (a - rate).abs() < EPSILON) {
        return Vec::new();
    }

    let listed = allowed
        .iter()
        .map(|r| format!("{}", r))
        .collect::<Vec<_>>()
        .join(", ");

    vec![RuleError::new(
        RuleCode::TaxRateNotAllowed,
        fields::TAX_RATE,
        format!(
            "{:?} rate {}% is not allowed in {} (allowed: {})",
            kind, rate, country, listed
        ),
    )]
}
