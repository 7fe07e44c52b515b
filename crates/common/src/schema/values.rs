//! Localized value parsing for amounts and dates

use chrono::NaiveDate;
use serde_json::Value;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d.%m.%Y"];

/// Parse a localized amount such as `1.234,56`, `1,234.56`, `$ 99.90` or `(12,00)`.
///
/// When both separators appear the rightmost one is the decimal mark. A lone
/// comma followed by exactly three digits is a thousands separator; a lone
/// dot is always decimal.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '$' | '€' | '£' | '%' | '\u{a0}'))
        .collect();

    for code in ["USD", "EUR", "GBP"] {
        if let Some(rest) = s.strip_prefix(code) {
            s = rest.to_string();
        }
        if let Some(rest) = s.strip_suffix(code) {
            s = rest.to_string();
        }
    }

    let negative = (s.starts_with('(') && s.ends_with(')')) || s.starts_with('-');
    let s = s.trim_start_matches('-').trim_start_matches('(').trim_end_matches(')');
    if s.is_empty() {
        return None;
    }

    let last_dot = s.rfind('.');
    let last_comma = s.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) if c > d => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (None, Some(c)) => {
            let commas = s.matches(',').count();
            let trailing = s.len() - c - 1;
            if commas == 1 && trailing != 3 {
                s.replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        (Some(_), None) if s.matches('.').count() > 1 => s.replace('.', ""),
        _ => s.to_string(),
    };

    let value: f64 = normalized.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Amount from a JSON value (number or localized string)
pub fn amount_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Parse `YYYY-MM-DD`, `DD/MM/YYYY`, `YYYY/MM/DD`, `DD-MM-YYYY` or `DD.MM.YYYY`.
/// Timestamps are cut at the date part.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let s = s.split(['T', ' ']).next().unwrap_or(s);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

pub fn date_from_value(value: &Value) -> Option<NaiveDate> {
    value.as_str().and_then(parse_date)
}

/// Text form of a scalar JSON value; empty strings and nulls are absent
pub fn text_from_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
