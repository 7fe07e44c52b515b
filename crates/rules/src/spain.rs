//! Spain (ES) rule pack: DNI, NIE and CIF identifiers, IVA and recargo de
//! equivalencia rates, invoice series numbers.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::checksum::digits;
use crate::{check_rate, fields, RuleCode, RuleError, RulePack, TaxIdKind, TaxKind};

const DNI_LETTERS: &[u8; 23] = b"TRWAGMYFPDXBNJZSQVHLCKE";
const CIF_CONTROL_LETTERS: &[u8; 10] = b"JABCDEFGHI";
const CIF_ENTITY_LETTERS: &str = "ABCDEFGHJNPQRSUVW";

/// IVA rates in percent
pub const VAT_RATES: [f64; 4] = [0.0, 4.0, 10.0, 21.0];

/// Recargo de equivalencia rates in percent
pub const SURCHARGE_RATES: [f64; 3] = [0.5, 1.4, 5.2];

pub const MAX_INVOICE_NUMBER_LEN: usize = 30;

fn invoice_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9/.\-]*[A-Za-z0-9])?$").expect("static pattern")
    })
}

/// Which control character forms a CIF entity letter accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CifControl {
    Digit,
    Letter,
    Either,
}

fn cif_control_for(entity: char) -> CifControl {
    match entity {
        'P' | 'Q' | 'R' | 'S' | 'N' | 'W' => CifControl::Letter,
        'A' | 'B' | 'E' | 'H' => CifControl::Digit,
        _ => CifControl::Either,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Spain;

/// Uppercase, drop separators and an intra-community `ES` prefix.
fn normalize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .filter(|c| !matches!(c, '-' | ' ' | '.'))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    match cleaned.strip_prefix("ES") {
        Some(rest) if rest.len() == 9 => rest.to_string(),
        _ => cleaned,
    }
}

fn dni_letter(number: u32) -> char {
    DNI_LETTERS[(number % 23) as usize] as char
}

fn cif_control_digit(body: &[u32]) -> u32 {
    let sum: u32 = body
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 0 {
                let doubled = d * 2;
                doubled / 10 + doubled % 10
            } else {
                d
            }
        })
        .sum();
    (10 - sum % 10) % 10
}

fn format_error(message: impl Into<String>) -> RuleError {
    RuleError::new(RuleCode::InvalidFormat, fields::TAX_ID, message)
}

fn checksum_error(message: &str) -> RuleError {
    RuleError::new(RuleCode::Checksum, fields::TAX_ID, message)
}

impl Spain {
    fn validate_personal(number_part: &str, letter: char, label: &str) -> Vec<RuleError> {
        let Some(number) = digits(number_part)
            .map(|d| d.iter().fold(0u32, |acc, &x| acc * 10 + x))
        else {
            return vec![format_error(format!("{} number must be numeric", label))];
        };
        if !letter.is_ascii_uppercase() {
            return vec![format_error(format!("{} must end with a control letter", label))];
        }
        if dni_letter(number) != letter {
            return vec![checksum_error("control letter does not match")];
        }
        Vec::new()
    }

    fn validate_cif(entity: char, body: &str, control: char) -> Vec<RuleError> {
        let Some(d) = digits(body) else {
            return vec![format_error("CIF body must be seven digits")];
        };
        if !(control.is_ascii_digit() || ('A'..='J').contains(&control)) {
            return vec![format_error("CIF control must be a digit or a letter A-J")];
        }

        let expected = cif_control_digit(&d);
        let as_digit = char::from_digit(expected, 10);
        let as_letter = Some(CIF_CONTROL_LETTERS[expected as usize] as char);

        let ok = match cif_control_for(entity) {
            CifControl::Digit => as_digit == Some(control),
            CifControl::Letter => as_letter == Some(control),
            CifControl::Either => as_digit == Some(control) || as_letter == Some(control),
        };
        if ok {
            Vec::new()
        } else {
            vec![checksum_error("CIF control character does not match")]
        }
    }
}

impl RulePack for Spain {
    fn country(&self) -> &'static str {
        "ES"
    }

    fn validate_tax_id(&self, id: &str) -> Vec<RuleError> {
        let id = normalize(id);
        if !id.is_ascii() {
            return vec![RuleError::new(
                RuleCode::InvalidCharacters,
                fields::TAX_ID,
                "NIF must contain ASCII letters and digits only",
            )];
        }
        let chars: Vec<char> = id.chars().collect();
        if chars.len() != 9 {
            return vec![RuleError::new(
                RuleCode::InvalidLength,
                fields::TAX_ID,
                format!("NIF must have 9 characters, got {}", chars.len()),
            )];
        }

        let first = chars[0];
        let last = chars[8];
        if first.is_ascii_digit() {
            Self::validate_personal(&id[..8], last, "DNI")
        } else if let Some(prefix) = match first {
            'X' => Some('0'),
            'Y' => Some('1'),
            'Z' => Some('2'),
            _ => None,
        } {
            let number = format!("{}{}", prefix, &id[1..8]);
            Self::validate_personal(&number, last, "NIE")
        } else if CIF_ENTITY_LETTERS.contains(first) {
            Self::validate_cif(first, &id[1..8], last)
        } else {
            vec![format_error(format!("'{}' is not a recognised NIF prefix", first))]
        }
    }

    fn tax_id_kind(&self, id: &str) -> Option<TaxIdKind> {
        let first = normalize(id).chars().next()?;
        match first {
            '0'..='9' => Some(TaxIdKind::NaturalPerson),
            'X' | 'Y' | 'Z' => Some(TaxIdKind::Foreigner),
            'P' | 'Q' | 'S' => Some(TaxIdKind::PublicEntity),
            c if CIF_ENTITY_LETTERS.contains(c) => Some(TaxIdKind::Company),
            _ => None,
        }
    }

    fn validate_tax_rate(&self, kind: TaxKind, rate: f64) -> Vec<RuleError> {
        match kind {
            TaxKind::Vat => check_rate(&VAT_RATES, kind, rate, self.country()),
            TaxKind::Surcharge => check_rate(&SURCHARGE_RATES, kind, rate, self.country()),
            TaxKind::Excise => check_rate(&[], kind, rate, self.country()),
        }
    }

    fn validate_invoice_number(&self, number: &str) -> Vec<RuleError> {
        let number = number.trim();
        if number.is_empty() || number.len() > MAX_INVOICE_NUMBER_LEN {
            return vec![RuleError::new(
                RuleCode::InvoiceNumberFormat,
                fields::INVOICE_NUMBER,
                format!("invoice number must have 1-{} characters", MAX_INVOICE_NUMBER_LEN),
            )];
        }
        if !invoice_number_pattern().is_match(number) {
            return vec![RuleError::new(
                RuleCode::InvoiceNumberFormat,
                fields::INVOICE_NUMBER,
                "invoice number must be alphanumeric with - / . separators",
            )];
        }
        Vec::new()
    }

    fn validate_access_key(&self, _key: &str) -> Vec<RuleError> {
        Vec::new()
    }
}

/// Build a DNI from its eight-digit number.
pub fn dni_with_letter(number: u32) -> String {
    let number = number % 100_000_000;
    format!("{:08}{}", number, dni_letter(number))
}

/// Build a NIE from its prefix (`X`, `Y` or `Z`) and seven-digit number.
pub fn nie_with_letter(prefix: char, number: u32) -> Option<String> {
    let lead = match prefix {
        'X' => 0,
        'Y' => 1,
        'Z' => 2,
        _ => return None,
    };
    let number = number % 10_000_000;
    Some(format!("{}{:07}{}", prefix, number, dni_letter(lead * 10_000_000 + number)))
}

/// Build a CIF from its entity letter and seven-digit body, using the control
/// form the entity letter requires (digit when either is accepted).
pub fn cif_with_control(entity: char, body: u32) -> Option<String> {
    if !CIF_ENTITY_LETTERS.contains(entity) {
        return None;
    }
    let body = format!("{:07}", body % 10_000_000);
    let d = digits(&body)?;
    let expected = cif_control_digit(&d);
    let control = match cif_control_for(entity) {
        CifControl::Letter => CIF_CONTROL_LETTERS[expected as usize] as char,
        CifControl::Digit | CifControl::Either => char::from_digit(expected, 10)?,
    };
    Some(format!("{}{}{}", entity, body, control))
}
