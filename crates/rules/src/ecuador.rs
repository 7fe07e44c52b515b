//! Ecuador (EC) rule pack
//!
//! Identifiers issued by the Registro Civil (cédula) and the SRI (RUC),
//! electronic invoice access keys and the IVA / ICE rate tables.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::checksum::{digits, mod10_coefficients, mod11_cyclic, mod11_weighted};
use crate::{check_rate, fields, RuleCode, RuleError, RulePack, TaxIdKind, TaxKind};

const CEDULA_COEFFICIENTS: [u32; 9] = [2, 1, 2, 1, 2, 1, 2, 1, 2];
const PUBLIC_WEIGHTS: [u32; 8] = [3, 2, 7, 6, 5, 4, 3, 2];
const COMPANY_WEIGHTS: [u32; 9] = [4, 3, 2, 7, 6, 5, 4, 3, 2];

/// IVA rates in percent
pub const VAT_RATES: [f64; 3] = [0.0, 12.0, 15.0];

/// ICE (excise) rates in percent
pub const EXCISE_RATES: [f64; 10] = [5.0, 10.0, 20.0, 25.0, 30.0, 35.0, 75.0, 100.0, 150.0, 300.0];

pub const ACCESS_KEY_LEN: usize = 49;

fn invoice_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{3}-\d{3}-\d{9}$").expect("static pattern"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ecuador;

impl Ecuador {
    fn validate_cedula(d: &[u32]) -> Vec<RuleError> {
        if let Some(err) = check_prefix(d) {
            return vec![err];
        }
        if d[2] >= 6 {
            return vec![format_error("third digit of a cédula must be below 6")];
        }
        if mod10_coefficients(&d[..9], &CEDULA_COEFFICIENTS) != d[9] {
            return vec![checksum_error("cédula check digit does not match")];
        }
        Vec::new()
    }

    fn validate_ruc(d: &[u32]) -> Vec<RuleError> {
        if let Some(err) = check_prefix(d) {
            return vec![err];
        }

        match d[2] {
            0..=5 => {
                if mod10_coefficients(&d[..9], &CEDULA_COEFFICIENTS) != d[9] {
                    return vec![checksum_error("RUC (natural person) check digit does not match")];
                }
                establishment(&d[10..])
            }
            6 => match mod11_weighted(&d[..8], &PUBLIC_WEIGHTS) {
                Some(check) if check == d[8] => establishment(&d[9..]),
                _ => vec![checksum_error("RUC (public entity) check digit does not match")],
            },
            9 => match mod11_weighted(&d[..9], &COMPANY_WEIGHTS) {
                Some(check) if check == d[9] => establishment(&d[10..]),
                _ => vec![checksum_error("RUC (company) check digit does not match")],
            },
            other => vec![format_error(format!("third digit {} is not a valid RUC type", other))],
        }
    }
}

impl RulePack for Ecuador {
    fn country(&self) -> &'static str {
        "EC"
    }

    fn validate_tax_id(&self, id: &str) -> Vec<RuleError> {
        let id = id.trim();
        if id.len() != 10 && id.len() != 13 {
            return vec![RuleError::new(
                RuleCode::InvalidLength,
                fields::TAX_ID,
                format!("expected 10 (cédula) or 13 (RUC) digits, got {}", id.len()),
            )];
        }
        let Some(d) = digits(id) else {
            return vec![RuleError::new(
                RuleCode::InvalidCharacters,
                fields::TAX_ID,
                "tax id must contain digits only",
            )];
        };

        if d.len() == 10 {
            Self::validate_cedula(&d)
        } else {
            Self::validate_ruc(&d)
        }
    }

    fn tax_id_kind(&self, id: &str) -> Option<TaxIdKind> {
        let id = id.trim();
        let third = id.chars().nth(2)?.to_digit(10)?;
        match (id.len(), third) {
            (10, _) => Some(TaxIdKind::NaturalPerson),
            (13, 0..=5) => Some(TaxIdKind::NaturalPerson),
            (13, 6) => Some(TaxIdKind::PublicEntity),
            (13, 9) => Some(TaxIdKind::Company),
            _ => None,
        }
    }

    fn validate_tax_rate(&self, kind: TaxKind, rate: f64) -> Vec<RuleError> {
        match kind {
            TaxKind::Vat => check_rate(&VAT_RATES, kind, rate, self.country()),
            TaxKind::Excise => check_rate(&EXCISE_RATES, kind, rate, self.country()),
            TaxKind::Surcharge => check_rate(&[], kind, rate, self.country()),
        }
    }

    fn validate_invoice_number(&self, number: &str) -> Vec<RuleError> {
        if invoice_number_pattern().is_match(number.trim()) {
            Vec::new()
        } else {
            vec![RuleError::new(
                RuleCode::InvoiceNumberFormat,
                fields::INVOICE_NUMBER,
                "invoice number must follow NNN-NNN-NNNNNNNNN",
            )]
        }
    }

    fn validate_access_key(&self, key: &str) -> Vec<RuleError> {
        let key = key.trim();
        if key.len() != ACCESS_KEY_LEN {
            return vec![RuleError::new(
                RuleCode::InvalidLength,
                fields::ACCESS_KEY,
                format!("access key must have {} digits, got {}", ACCESS_KEY_LEN, key.len()),
            )];
        }
        let Some(d) = digits(key) else {
            return vec![RuleError::new(
                RuleCode::InvalidCharacters,
                fields::ACCESS_KEY,
                "access key must contain digits only",
            )];
        };
        if mod11_cyclic(&d[..48]) != d[48] {
            return vec![RuleError::new(
                RuleCode::Checksum,
                fields::ACCESS_KEY,
                "access key check digit does not match",
            )];
        }
        Vec::new()
    }
}

fn check_prefix(d: &[u32]) -> Option<RuleError> {
    let province = d[0] * 10 + d[1];
    if (1..=24).contains(&province) || province == 30 {
        None
    } else {
        Some(format_error(format!("province code {:02} does not exist", province)))
    }
}

fn establishment(d: &[u32]) -> Vec<RuleError> {
    if d.iter().all(|&x| x == 0) {
        vec![RuleError::new(
            RuleCode::InvalidEstablishment,
            fields::TAX_ID,
            "RUC establishment number cannot be zero",
        )]
    } else {
        Vec::new()
    }
}

fn format_error(message: impl Into<String>) -> RuleError {
    RuleError::new(RuleCode::InvalidFormat, fields::TAX_ID, message)
}

fn checksum_error(message: &str) -> RuleError {
    RuleError::new(RuleCode::Checksum, fields::TAX_ID, message)
}

fn render(d: &[u32]) -> String {
    d.iter().filter_map(|&x| char::from_digit(x, 10)).collect()
}

/// Complete a 9-digit cédula body with its check digit.
pub fn cedula_with_check(body: &str) -> Option<String> {
    let d = digits(body).filter(|d| d.len() == 9)?;
    let check = mod10_coefficients(&d, &CEDULA_COEFFICIENTS);
    Some(format!("{}{}", render(&d), check))
}

/// Complete a 9-digit company body into a RUC with establishment `001`.
/// `None` when the body has no valid check digit.
pub fn ruc_company_with_check(body: &str) -> Option<String> {
    let d = digits(body).filter(|d| d.len() == 9)?;
    let check = mod11_weighted(&d, &COMPANY_WEIGHTS)?;
    Some(format!("{}{}001", render(&d), check))
}

/// Complete an 8-digit public-entity body into a RUC with establishment `0001`.
pub fn ruc_public_with_check(body: &str) -> Option<String> {
    let d = digits(body).filter(|d| d.len() == 8)?;
    let check = mod11_weighted(&d, &PUBLIC_WEIGHTS)?;
    Some(format!("{}{}0001", render(&d), check))
}

/// Complete the first 48 digits of an access key with its check digit.
pub fn access_key_with_check(body: &str) -> Option<String> {
    let d = digits(body).filter(|d| d.len() == 48)?;
    Some(format!("{}{}", render(&d), mod11_cyclic(&d)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_cedula() {
        assert!(Ecuador.validate_tax_id("1710034065").is_empty());
    }

    #[test]
    fn test_cedula_bad_province() {
        let errors = Ecuador.validate_tax_id("2510034065");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, RuleCode::InvalidFormat);
    }

    #[test]
    fn test_valid_company_ruc() {
        assert!(Ecuador.validate_tax_id("1790011674001").is_empty());
        assert_eq!(Ecuador.tax_id_kind("1790011674001"), Some(TaxIdKind::Company));
    }

    #[test]
    fn test_company_ruc_checksum() {
        let errors = Ecuador.validate_tax_id("1790011675001");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, RuleCode::Checksum);
        assert_eq!(errors[0].field.as_deref(), Some("vendor_tax_id"));
    }

    #[test]
    fn test_valid_public_ruc() {
        assert!(Ecuador.validate_tax_id("1760001550001").is_empty());
        assert_eq!(Ecuador.tax_id_kind("1760001550001"), Some(TaxIdKind::PublicEntity));
    }

    #[test]
    fn test_natural_ruc_establishment() {
        assert!(Ecuador.validate_tax_id("1710034065001").is_empty());
        let errors = Ecuador.validate_tax_id("1710034065000");
        assert_eq!(errors[0].code, RuleCode::InvalidEstablishment);
    }

    #[test]
    fn test_invalid_length_and_characters() {
        assert_eq!(Ecuador.validate_tax_id("123")[0].code, RuleCode::InvalidLength);
        assert_eq!(Ecuador.validate_tax_id("17100340AB")[0].code, RuleCode::InvalidCharacters);
    }

    #[test]
    fn test_ruc_type_seven_rejected() {
        let errors = Ecuador.validate_tax_id("1770011674001");
        assert_eq!(errors[0].code, RuleCode::InvalidFormat);
    }

    #[test]
    fn test_invoice_number() {
        assert!(Ecuador.validate_invoice_number("001-001-000000123").is_empty());
        assert_eq!(
            Ecuador.validate_invoice_number("001-001-123")[0].code,
            RuleCode::InvoiceNumberFormat
        );
    }

    #[test]
    fn test_access_key() {
        let key = access_key_with_check(&"2".repeat(48)).unwrap();
        assert!(Ecuador.validate_access_key(&key).is_empty());

        let mut broken: Vec<char> = key.chars().collect();
        broken[48] = if broken[48] == '0' { '5' } else { '0' };
        let broken: String = broken.into_iter().collect();
        assert_eq!(Ecuador.validate_access_key(&broken)[0].code, RuleCode::Checksum);
        assert_eq!(Ecuador.validate_access_key("123")[0].code, RuleCode::InvalidLength);
    }

    #[test]
    fn test_tax_rates() {
        assert!(Ecuador.validate_tax_rate(TaxKind::Vat, 15.0).is_empty());
        assert!(Ecuador.validate_tax_rate(TaxKind::Vat, 12.0).is_empty());
        assert!(Ecuador.validate_tax_rate(TaxKind::Excise, 75.0).is_empty());
        assert_eq!(
            Ecuador.validate_tax_rate(TaxKind::Vat, 21.0)[0].code,
            RuleCode::TaxRateNotAllowed
        );
        assert!(!Ecuador.validate_tax_rate(TaxKind::Surcharge, 0.5).is_empty());
    }

    #[test]
    fn test_generators() {
        assert_eq!(cedula_with_check("171003406").as_deref(), Some("1710034065"));
        assert_eq!(ruc_company_with_check("179001167").as_deref(), Some("1790011674001"));
        assert_eq!(ruc_public_with_check("17600015").as_deref(), Some("1760001550001"));
        assert!(cedula_with_check("12").is_none());
    }
}
