//! PDF text extraction
//!
//! Reads the text embedded in a PDF's content streams using lopdf. Scanned
//! PDFs carry no text and fall through to the OCR engine.

use crate::errors::IngestionError;
use tracing::{debug, warn};

/// Extract the embedded text of an in-memory PDF, one line per text line
pub fn extract_text_from_pdf(name: &str, bytes: &[u8]) -> Result<String, IngestionError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| IngestionError::PdfParse {
        name: name.to_string(),
        message: format!("Failed to load PDF: {}", e),
    })?;

    let pages = doc.get_pages();
    debug!(page_count = pages.len(), "Extracting text from PDF");

    let mut text = String::new();
    for (page_num, page_id) in pages {
        match doc.get_page_content(page_id) {
            Ok(content) => {
                text.push_str(&extract_text_from_content(&content));
                text.push('\n');
            }
            Err(e) => {
                warn!(page = page_num, error = %e, "Failed to read page content, skipping");
            }
        }
    }

    Ok(clean_text(&text))
}

/// Walk a content stream and collect text shown between BT and ET
fn extract_text_from_content(content: &[u8]) -> String {
    let content_str = String::from_utf8_lossy(content);
    let mut text = String::new();
    let mut in_text_block = false;
    let mut current = String::new();

    for line in content_str.lines() {
        let trimmed = line.trim();

        match trimmed {
            "BT" => {
                in_text_block = true;
                continue;
            }
            "ET" => {
                in_text_block = false;
                flush_line(&mut text, &mut current);
                continue;
            }
            _ => {}
        }

        if !in_text_block {
            continue;
        }

        // Line-moving operators start a new output line
        if trimmed.ends_with("Td") || trimmed.ends_with("TD") || trimmed == "T*" {
            flush_line(&mut text, &mut current);
            continue;
        }

        if let Some(shown) = extract_text_from_operator(trimmed) {
            if trimmed.ends_with('\'') || trimmed.ends_with('"') {
                flush_line(&mut text, &mut current);
            }
            current.push_str(&shown);
        }
    }

    flush_line(&mut text, &mut current);
    text
}

fn flush_line(text: &mut String, current: &mut String) {
    if !current.trim().is_empty() {
        text.push_str(current.trim());
        text.push('\n');
    }
    current.clear();
}

/// Text operand of a Tj, TJ, ' or " operator
fn extract_text_from_operator(line: &str) -> Option<String> {
    if line.ends_with("Tj") || line.ends_with('\'') || line.ends_with('"') {
        let start = line.find('(')?;
        let end = line.rfind(')')?;
        if end > start {
            return Some(decode_pdf_string(&line[start + 1..end]));
        }
        return None;
    }

    if line.ends_with("TJ") {
        let mut result = String::new();
        let mut current = String::new();
        let mut in_paren = false;
        let mut escaped = false;

        for ch in line.chars() {
            match ch {
                _ if escaped => {
                    current.push('\\');
                    current.push(ch);
                    escaped = false;
                }
                '\\' if in_paren => escaped = true,
                '(' if !in_paren => in_paren = true,
                ')' if in_paren => {
                    in_paren = false;
                    result.push_str(&decode_pdf_string(&current));
                    current.clear();
                }
                _ if in_paren => current.push(ch),
                _ => {}
            }
        }

        if !result.is_empty() {
            return Some(result);
        }
    }

    None
}

/// Decode PDF literal string escapes
fn decode_pdf_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some(c) => result.push(c),
            None => {}
        }
    }

    result
}

/// Trim lines, collapse inner whitespace, drop blank lines and byte-order marks
fn clean_text(text: &str) -> String {
    text.replace('\u{FEFF}', "")
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
