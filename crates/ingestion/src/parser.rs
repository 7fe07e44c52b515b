//! Parser adapters
//!
//! Turn tabular files (CSV, spreadsheets, JSON feeds) into raw rows keyed by
//! source header. Binary documents (PDF, images) are not parsed here; they
//! travel as a single item and go through text extraction instead.

use serde_json::{Map, Value};
use std::io::Cursor;
use tracing::debug;

use crate::errors::IngestionError;

/// One source record, keyed by header
pub type RawRow = Map<String, Value>;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_JSON: &str = "application/json";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_XLS: &str = "application/vnd.ms-excel";

/// Capability: read a file into rows
pub trait ParserAdapter: Send + Sync {
    /// Registry identifier
    fn id(&self) -> &'static str;

    fn supports(&self, mime: &str) -> bool;

    fn parse(&self, name: &str, bytes: &[u8]) -> Result<Vec<RawRow>, IngestionError>;
}

/// Whether the MIME type is a document needing text extraction
pub fn is_binary_document(mime: &str) -> bool {
    mime == MIME_PDF || mime.starts_with("image/")
}

/// Resolve the effective MIME type: content sniffing first, then the declared
/// type, then the file extension.
pub fn detect_mime(bytes: &[u8], declared: Option<&str>, file_name: &str) -> String {
    if let Some(kind) = infer::get(bytes) {
        let sniffed = kind.mime_type();
        // Office files sniff as zip containers unless infer recognises them
        if sniffed != "application/zip" {
            return sniffed.to_string();
        }
    }

    if let Some(declared) = declared.map(str::trim).filter(|d| !d.is_empty()) {
        return declared.to_ascii_lowercase();
    }

    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" | "txt" => MIME_CSV,
        "json" => MIME_JSON,
        "xlsx" => MIME_XLSX,
        "xls" => MIME_XLS,
        "pdf" => MIME_PDF,
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Delimited text with a header row. Quoted fields may contain delimiters,
/// doubled quotes and newlines. Semicolon files are detected from the header.
pub struct CsvParser;

impl CsvParser {
    fn delimiter(text: &str) -> char {
        let header = text.lines().next().unwrap_or_default();
        if header.matches(';').count() > header.matches(',').count() {
            ';'
        } else {
            ','
        }
    }

    fn records(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, IngestionError> {
        let mut records = Vec::new();
        let mut record = Vec::new();
        let mut field = String::new();
        let mut in_quotes = false;
        let mut line = 1;
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '"' if in_quotes => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                '"' if field.is_empty() => in_quotes = true,
                '\n' if in_quotes => {
                    line += 1;
                    field.push('\n');
                }
                '\r' if !in_quotes => {}
                '\n' => {
                    line += 1;
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                c if c == delimiter && !in_quotes => record.push(std::mem::take(&mut field)),
                c => field.push(c),
            }
        }

        if in_quotes {
            return Err(IngestionError::Csv {
                line,
                message: "unterminated quoted field".into(),
            });
        }
        if !field.is_empty() || !record.is_empty() {
            record.push(field);
            records.push(record);
        }

        records.retain(|r| r.iter().any(|f| !f.trim().is_empty()));
        Ok(records)
    }
}

impl ParserAdapter for CsvParser {
    fn id(&self) -> &'static str {
        "csv"
    }

    fn supports(&self, mime: &str) -> bool {
        mime == MIME_CSV || mime == "text/plain"
    }

    fn parse(&self, name: &str, bytes: &[u8]) -> Result<Vec<RawRow>, IngestionError> {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_start_matches('\u{feff}');
        let records = Self::records(text, Self::delimiter(text))?;

        let mut iter = records.into_iter();
        let headers = iter
            .next()
            .ok_or_else(|| IngestionError::Empty(name.to_string()))?;
        let headers = header_names(headers);

        let rows: Vec<RawRow> = iter
            .map(|record| {
                headers
                    .iter()
                    .zip(record)
                    .filter(|(_, value)| !value.trim().is_empty())
                    .map(|(header, value)| (header.clone(), Value::String(value.trim().to_string())))
                    .collect()
            })
            .collect();

        if rows.is_empty() {
            return Err(IngestionError::Empty(name.to_string()));
        }
        debug!(file = name, rows = rows.len(), "Parsed CSV");
        Ok(rows)
    }
}

/// A JSON array of objects, an object wrapping one under `items`/`rows`/`records`,
/// or a single object.
pub struct JsonParser;

impl ParserAdapter for JsonParser {
    fn id(&self) -> &'static str {
        "json"
    }

    fn supports(&self, mime: &str) -> bool {
        mime == MIME_JSON
    }

    fn parse(&self, name: &str, bytes: &[u8]) -> Result<Vec<RawRow>, IngestionError> {
        let value: Value = serde_json::from_slice(bytes)?;

        let records = match value {
            Value::Array(records) => records,
            Value::Object(mut object) => {
                match ["items", "rows", "records"]
                    .iter()
                    .find_map(|key| match object.get(*key) {
                        Some(Value::Array(_)) => Some(*key),
                        _ => None,
                    }) {
                    Some(key) => match object.remove(key) {
                        Some(Value::Array(records)) => records,
                        _ => Vec::new(),
                    },
                    None => vec![Value::Object(object)],
                }
            }
            _ => Vec::new(),
        };

        let rows = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| match record {
                Value::Object(row) => Ok(row),
                _ => Err(IngestionError::NotAnObject { index }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Err(IngestionError::Empty(name.to_string()));
        }
        Ok(rows)
    }
}

/// First worksheet of an XLSX/XLS workbook; the first non-empty row is the header
pub struct SpreadsheetParser;

impl SpreadsheetParser {
    fn cell_value(cell: &calamine::Data) -> Value {
        use calamine::Data;
        match cell {
            Data::Empty => Value::Null,
            Data::String(s) => Value::String(s.trim().to_string()),
            Data::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Data::Int(i) => Value::from(*i),
            Data::Bool(b) => Value::Bool(*b),
            other => Value::String(other.to_string()),
        }
    }
}

impl ParserAdapter for SpreadsheetParser {
    fn id(&self) -> &'static str {
        "spreadsheet"
    }

    fn supports(&self, mime: &str) -> bool {
        mime == MIME_XLSX || mime == MIME_XLS
    }

    fn parse(&self, name: &str, bytes: &[u8]) -> Result<Vec<RawRow>, IngestionError> {
        use calamine::Reader;

        let spreadsheet_error = |message: String| IngestionError::Spreadsheet {
            name: name.to_string(),
            message,
        };

        let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
            .map_err(|e| spreadsheet_error(format!("could not open workbook: {}", e)))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| spreadsheet_error("workbook has no sheets".into()))?
            .map_err(|e| spreadsheet_error(format!("could not read first sheet: {}", e)))?;

        let mut rows_iter = range
            .rows()
            .filter(|row| row.iter().any(|c| !matches!(c, calamine::Data::Empty)));

        let headers = rows_iter
            .next()
            .map(|row| header_names(row.iter().map(|c| c.to_string()).collect()))
            .ok_or_else(|| IngestionError::Empty(name.to_string()))?;

        let rows: Vec<RawRow> = rows_iter
            .map(|row| {
                headers
                    .iter()
                    .zip(row.iter())
                    .map(|(header, cell)| (header.clone(), Self::cell_value(cell)))
                    .filter(|(_, value)| !value.is_null())
                    .collect()
            })
            .collect();

        if rows.is_empty() {
            return Err(IngestionError::Empty(name.to_string()));
        }
        debug!(file = name, rows = rows.len(), "Parsed spreadsheet");
        Ok(rows)
    }
}

/// Trimmed header names; blanks become `column_N`
fn header_names(raw: Vec<String>) -> Vec<String> {
    raw.into_iter()
        .enumerate()
        .map(|(i, h)| {
            let h = h.trim();
            if h.is_empty() {
                format!("column_{}", i + 1)
            } else {
                h.to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_quoted_fields() {
        let csv = "invoice_number,description,total\n\
                   F-001,\"Paper, A4\",100.00\n\
                   F-002,\"Said \"\"hi\"\"\",\"1,234.50\"\n";
        let rows = CsvParser.parse("rows.csv", csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["description"], "Paper, A4");
        assert_eq!(rows[1]["description"], "Said \"hi\"");
        assert_eq!(rows[1]["total"], "1,234.50");
    }

    #[test]
    fn test_csv_semicolon_and_multiline() {
        let csv = "fecha;importe;concepto\r\n02/01/2024;1.234,56;\"linea uno\nlinea dos\"\r\n\r\n";
        let rows = CsvParser.parse("es.csv", csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["importe"], "1.234,56");
        assert_eq!(rows[0]["concepto"], "linea uno\nlinea dos");
    }

    #[test]
    fn test_csv_errors() {
        assert!(matches!(
            CsvParser.parse("bad.csv", b"a,b\n\"open,1\n"),
            Err(IngestionError::Csv { .. })
        ));
        assert!(matches!(
            CsvParser.parse("header_only.csv", b"a,b\n"),
            Err(IngestionError::Empty(_))
        ));
    }

    #[test]
    fn test_json_shapes() {
        let rows = JsonParser
            .parse("a.json", br#"[{"total": 1}, {"total": 2}]"#)
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = JsonParser
            .parse("b.json", br#"{"items": [{"total": 3}]}"#)
            .unwrap();
        assert_eq!(rows[0]["total"], 3);

        let rows = JsonParser.parse("c.json", br#"{"total": 4}"#).unwrap();
        assert_eq!(rows.len(), 1);

        assert!(matches!(
            JsonParser.parse("d.json", br#"[1, 2]"#),
            Err(IngestionError::NotAnObject { index: 0 })
        ));
    }

    #[test]
    fn test_detect_mime() {
        assert_eq!(detect_mime(b"%PDF-1.5\n...", None, "scan.bin"), MIME_PDF);
        assert_eq!(detect_mime(b"a,b\n1,2\n", None, "rows.csv"), MIME_CSV);
        assert_eq!(detect_mime(b"a,b\n", Some("text/csv"), "rows"), MIME_CSV);
        assert_eq!(detect_mime(b"[]", None, "feed.JSON"), MIME_JSON);
        assert!(is_binary_document("image/png"));
        assert!(!is_binary_document(MIME_CSV));
    }
}
