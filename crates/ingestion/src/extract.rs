//! Raw field recovery from extracted document text
//!
//! `Key: value` lines become raw fields under their own header. Values the
//! lines did not label are found by pattern (tax ids, access keys, invoice
//! numbers, dates, totals) and stored under conventional headers so the
//! mapper treats both the same way.

use regex_lite::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::parser::RawRow;

/// Longest label accepted as a key
const MAX_KEY_LEN: usize = 40;

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("static pattern"))
}

fn access_key_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"\b\d{49}\b")
}

fn ec_invoice_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"\b\d{3}-\d{3}-\d{9}\b")
}

fn ruc_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"\b\d{13}\b")
}

fn nif_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"\b(?:\d{8}[A-Z]|[XYZ]\d{7}[A-Z]|[ABCDEFGHJNPQRSUVW]\d{7}[0-9A-J])\b")
}

fn date_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"\b(?:\d{4}[-/]\d{2}[-/]\d{2}|\d{2}[-/.]\d{2}[-/.]\d{4})\b")
}

fn total_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\btotal\b[^0-9\-]{0,20}(-?[0-9][0-9.,]*)")
}

/// Recover raw fields from free text
pub fn fields_from_text(text: &str) -> RawRow {
    let mut fields = RawRow::new();

    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if key.is_empty()
                || value.is_empty()
                || value.starts_with("//")
                || key.len() > MAX_KEY_LEN
                || !key.chars().any(char::is_alphabetic)
            {
                continue;
            }
            fields
                .entry(key.to_string())
                .or_insert_with(|| Value::String(value.to_string()));
        }
    }

    let labelled: Vec<String> = fields
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    let is_labelled = |found: &str| labelled.iter().any(|v| v.contains(found));

    let mut detect = |header: &str, found: Option<&str>| {
        if let Some(found) = found {
            if !is_labelled(found) {
                fields
                    .entry(header.to_string())
                    .or_insert_with(|| Value::String(found.to_string()));
            }
        }
    };

    let access_key = access_key_pattern().find(text).map(|m| m.as_str());
    detect("access_key", access_key);
    detect(
        "invoice_number",
        ec_invoice_pattern().find(text).map(|m| m.as_str()),
    );
    detect("tax_id", ruc_pattern().find(text).map(|m| m.as_str()));
    detect("tax_id", nif_pattern().find(text).map(|m| m.as_str()));
    detect("date", date_pattern().find(text).map(|m| m.as_str()));
    detect(
        "total",
        total_pattern()
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim_end_matches(['.', ','])),
    );

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_lines() {
        let text = "FACTURA\nInvoice No: F-001\nFecha: 02/01/2024\nTotal: 100,00\nhttp://x.y";
        let fields = fields_from_text(text);
        assert_eq!(fields["Invoice No"], "F-001");
        assert_eq!(fields["Fecha"], "02/01/2024");
        assert_eq!(fields["Total"], "100,00");
        // Labelled values are not detected a second time
        assert!(!fields.contains_key("date"));
        assert!(!fields.contains_key("http"));
    }

    #[test]
    fn test_pattern_detection() {
        let key = "1".repeat(49);
        let text = format!(
            "RUC 1790011674001\nNo. 001-002-000000123\nAutorizacion {}\nEmitida 2024-01-02\nTOTAL A PAGAR 115.00",
            key
        );
        let fields = fields_from_text(&text);
        assert_eq!(fields["tax_id"], "1790011674001");
        assert_eq!(fields["invoice_number"], "001-002-000000123");
        assert_eq!(fields["access_key"], key.as_str());
        assert_eq!(fields["date"], "2024-01-02");
        assert_eq!(fields["total"], "115.00");
    }

    #[test]
    fn test_spanish_nif_detection() {
        let fields = fields_from_text("Proveedor B12345674 S.L.");
        assert_eq!(fields["tax_id"], "B12345674");
    }
}
