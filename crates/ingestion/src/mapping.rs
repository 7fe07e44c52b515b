//! Canonical mapper
//!
//! Maps source headers onto canonical fields with a synonym dictionary,
//! lets confirmed tenant feedback override it, parses values into the
//! canonical document and fills in fields derivable from others.

use async_trait::async_trait;
use ledgerforge_common::errors::Result;
use ledgerforge_common::ingest::{FieldError, FieldMapping, Severity};
use ledgerforge_common::schema::{CanonicalDocument, CanonicalField, DocType};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::insights::{LearnedMapping, LearningInsights};
use crate::parser::RawRow;

/// Error code attached to a mapped value that could not be parsed
pub const INVALID_VALUE: &str = "INVALID_VALUE";

/// Normalize a header: lowercase, Latin diacritics stripped, punctuation to spaces
pub fn normalize_header(header: &str) -> String {
    let mapped: String = header
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' | 'ã' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            'º' | 'ª' | '°' => ' ',
            c if c.is_alphanumeric() || c == '#' || c == '%' => c,
            _ => ' ',
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Default synonym dictionary. Order breaks ties between equal-length matches.
fn default_dictionary() -> Vec<(CanonicalField, Vec<&'static str>)> {
    use CanonicalField::*;
    vec![
        (
            InvoiceNumber,
            vec![
                "invoice number", "invoice no", "invoice num", "invoice #", "inv no",
                "inv number", "bill number", "bill no", "document number", "numero de factura",
                "numero factura", "no factura", "nro factura", "num factura", "factura no",
                "comprobante",
            ],
        ),
        (
            IssueDate,
            vec![
                "date", "issue date", "invoice date", "emission date", "transaction date",
                "posting date", "value date", "fecha", "fecha emision", "fecha de emision",
                "fecha factura", "fecha valor",
            ],
        ),
        (
            Subtotal,
            vec![
                "subtotal", "sub total", "net", "net amount", "neto", "base", "base imponible",
                "taxable base", "amount before tax",
            ],
        ),
        (
            TaxAmount,
            vec![
                "tax", "tax amount", "total tax", "vat", "vat amount", "iva", "cuota iva",
                "impuesto", "impuestos",
            ],
        ),
        (
            TotalAmount,
            vec![
                "total", "total amount", "amount", "grand total", "amount due", "importe",
                "importe total", "monto", "monto total", "valor total", "total a pagar",
            ],
        ),
        (Currency, vec!["currency", "moneda", "divisa", "ccy"]),
        (
            VendorName,
            vec![
                "vendor", "vendor name", "supplier", "supplier name", "merchant", "issuer",
                "seller", "proveedor", "razon social", "emisor",
            ],
        ),
        (
            VendorTaxId,
            vec![
                "tax id", "vendor tax id", "supplier tax id", "vat number", "vat id",
                "tax number", "ruc", "ruc emisor", "nif", "nif emisor", "cif", "cedula",
                "identificacion",
            ],
        ),
        (
            BuyerName,
            vec![
                "buyer", "buyer name", "customer", "customer name", "client", "cliente",
                "comprador", "razon social comprador",
            ],
        ),
        (
            BuyerTaxId,
            vec![
                "buyer tax id", "customer tax id", "client tax id", "ruc cliente", "nif cliente",
                "ruc comprador", "identificacion comprador",
            ],
        ),
        (Country, vec!["country", "country code", "pais"]),
        (
            PaymentMethod,
            vec!["payment method", "payment", "forma de pago", "metodo de pago", "pago"],
        ),
        (
            AccessKey,
            vec![
                "access key", "clave de acceso", "clave acceso", "authorization",
                "autorizacion", "numero de autorizacion",
            ],
        ),
        (
            Description,
            vec![
                "description", "descripcion", "concept", "concepto", "detail", "detalle",
                "memo", "narrative", "item", "item name", "product", "product name",
                "producto",
            ],
        ),
        (Quantity, vec!["quantity", "qty", "cantidad", "cant", "units"]),
        (
            UnitPrice,
            vec!["unit price", "price", "unit cost", "precio", "precio unitario", "pvp"],
        ),
        (
            LineTotal,
            vec!["line total", "line amount", "item total", "importe linea", "total linea"],
        ),
        (
            PackPrice,
            vec!["pack price", "price per pack", "case price", "precio caja", "precio pack"],
        ),
        (
            UnitsPerPack,
            vec!["units per pack", "units per case", "pack size", "case size", "unidades por caja"],
        ),
        (TaxCode, vec!["tax code", "vat code", "tax category", "codigo impuesto"]),
        (
            TaxRate,
            vec![
                "tax rate", "vat rate", "rate", "iva %", "tipo iva", "tarifa iva",
                "porcentaje iva", "tasa",
            ],
        ),
    ]
}

/// Who and what is being mapped
#[derive(Debug, Clone)]
pub struct MappingContext<'a> {
    pub tenant_id: &'a str,
    pub doc_type: DocType,
}

/// Output of one mapping run
#[derive(Debug, Clone, PartialEq)]
pub struct MappingResult {
    pub document: CanonicalDocument,
    pub mappings: Vec<FieldMapping>,
    /// Mean over all headers; unmapped headers count as zero
    pub confidence: f64,
    pub derived: Vec<String>,
    /// Values that mapped to a field but could not be parsed
    pub errors: Vec<FieldError>,
}

/// Capability: raw fields to canonical document
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Registry identifier
    fn id(&self) -> &'static str;

    async fn map(&self, raw: &RawRow, ctx: &MappingContext<'_>) -> Result<MappingResult>;
}

pub struct DictionaryMapper {
    dictionary: Vec<(CanonicalField, Vec<String>)>,
    insights: Option<LearningInsights>,
    learned_override_threshold: f64,
}

impl DictionaryMapper {
    pub fn new(learned_override_threshold: f64) -> Self {
        let dictionary = default_dictionary()
            .into_iter()
            .map(|(field, synonyms)| {
                (field, synonyms.into_iter().map(normalize_header).collect())
            })
            .collect();
        Self {
            dictionary,
            insights: None,
            learned_override_threshold,
        }
    }

    pub fn with_insights(mut self, insights: LearningInsights) -> Self {
        self.insights = Some(insights);
        self
    }

    /// Add synonyms for a field, e.g. from a tenant mapping template
    pub fn add_synonyms(&mut self, field: CanonicalField, synonyms: &[&str]) {
        let normalized = synonyms.iter().map(|s| normalize_header(s));
        match self.dictionary.iter_mut().find(|(f, _)| *f == field) {
            Some((_, existing)) => existing.extend(normalized),
            None => self.dictionary.push((field, normalized.collect())),
        }
    }

    /// Dictionary match for one header
    pub fn match_header(&self, header: &str) -> FieldMapping {
        let normalized = normalize_header(header);
        let mut best: Option<(CanonicalField, usize)> = None;

        for (field, synonyms) in &self.dictionary {
            for synonym in synonyms {
                let len = synonym.chars().count();
                if len > 0
                    && normalized.contains(synonym.as_str())
                    && best.map_or(true, |(_, score)| len > score)
                {
                    best = Some((*field, len));
                }
            }
        }

        let header_len = normalized.chars().count().max(3);
        match best {
            Some((field, score)) => FieldMapping {
                source_header: header.to_string(),
                field: Some(field),
                confidence: (score as f64 / header_len as f64).min(1.0),
                learned: false,
            },
            None => FieldMapping {
                source_header: header.to_string(),
                field: None,
                confidence: 0.0,
                learned: false,
            },
        }
    }

    fn resolve(&self, header: &str, learned: &HashMap<String, LearnedMapping>) -> FieldMapping {
        if let Some(learned) = learned.get(&normalize_header(header)) {
            if learned.confidence >= self.learned_override_threshold {
                return FieldMapping {
                    source_header: header.to_string(),
                    field: Some(learned.field),
                    confidence: learned.confidence,
                    learned: true,
                };
            }
        }
        self.match_header(header)
    }
}

#[async_trait]
impl Mapper for DictionaryMapper {
    fn id(&self) -> &'static str {
        "dictionary"
    }

    async fn map(&self, raw: &RawRow, ctx: &MappingContext<'_>) -> Result<MappingResult> {
        let learned = match self.insights {
            Some(ref insights) => insights.learned_mappings(ctx.tenant_id, ctx.doc_type).await?,
            None => HashMap::new(),
        };

        let mut mappings: Vec<FieldMapping> = raw
            .keys()
            .map(|header| self.resolve(header, &learned))
            .collect();

        // Two headers claiming one field: the more confident keeps it
        let mut owner: HashMap<CanonicalField, usize> = HashMap::new();
        for (idx, mapping) in mappings.iter().enumerate() {
            if let Some(field) = mapping.field {
                match owner.get(&field) {
                    Some(&other) if mappings[other].confidence >= mapping.confidence => {}
                    _ => {
                        owner.insert(field, idx);
                    }
                }
            }
        }
        for (idx, mapping) in mappings.iter_mut().enumerate() {
            if let Some(field) = mapping.field {
                if owner.get(&field) != Some(&idx) {
                    mapping.field = None;
                    mapping.confidence = 0.0;
                    mapping.learned = false;
                }
            }
        }

        let mut document = CanonicalDocument::new(ctx.doc_type);
        let mut errors = Vec::new();

        for mapping in &mappings {
            let value = match raw.get(&mapping.source_header) {
                Some(value) => value,
                None => continue,
            };
            match mapping.field {
                Some(CanonicalField::DocType) | None => {
                    document.extra.insert(mapping.source_header.clone(), value.clone());
                }
                Some(field) => {
                    if let Err(e) = document.set_field(field, value) {
                        warn!(header = %mapping.source_header, field = %field, "Unparseable value");
                        errors.push(FieldError::new(
                            Some(field.as_str()),
                            INVALID_VALUE,
                            e.to_string(),
                            Severity::Warning,
                        ));
                        document.extra.insert(mapping.source_header.clone(), value.clone());
                    }
                }
            }
        }

        let derived = derive_fields(&mut document);

        let confidence = if mappings.is_empty() {
            0.0
        } else {
            mappings.iter().map(|m| m.confidence).sum::<f64>() / mappings.len() as f64
        };

        debug!(
            headers = mappings.len(),
            mapped = mappings.iter().filter(|m| m.field.is_some()).count(),
            confidence,
            "Mapped raw fields"
        );

        Ok(MappingResult {
            document,
            mappings,
            confidence,
            derived,
            errors,
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Fill fields computable from others; returns a description of each derivation
pub fn derive_fields(doc: &mut CanonicalDocument) -> Vec<String> {
    let mut derived = Vec::new();

    let pack_price = doc
        .get_field(CanonicalField::PackPrice)
        .and_then(|v| v.as_f64());
    let units = doc
        .get_field(CanonicalField::UnitsPerPack)
        .and_then(|v| v.as_f64());
    let unit_price = doc.line_items.first().and_then(|l| l.unit_price);
    if let (None, Some(pack), Some(units)) = (unit_price, pack_price, units) {
        if units > 0.0 {
            let value = Value::from((pack / units * 10_000.0).round() / 10_000.0);
            if doc.set_field(CanonicalField::UnitPrice, &value).is_ok() {
                derived.push("unit_price = pack_price / units_per_pack".to_string());
            }
        }
    }

    let totals = &mut doc.totals;
    match (totals.subtotal, totals.tax, totals.total) {
        (None, Some(tax), Some(total)) => {
            totals.subtotal = Some(round2(total - tax));
            derived.push("subtotal = total_amount - tax_amount".to_string());
        }
        (Some(subtotal), None, Some(total)) => {
            totals.tax = Some(round2(total - subtotal));
            derived.push("tax_amount = total_amount - subtotal".to_string());
        }
        _ => {}
    }

    derived
}

/// Target and inputs of a recorded derivation such as
/// `subtotal = total_amount - tax_amount`
fn parse_derivation(entry: &str) -> Option<(CanonicalField, Vec<CanonicalField>)> {
    let (target, expr) = entry.split_once(" = ")?;
    let target = target.parse().ok()?;
    let inputs = expr
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect();
    Some((target, inputs))
}

/// Bring derived values up to date after a reviewer changed `patched`.
///
/// Derivations reading the patched field are cleared and computed again.
/// A derived field the reviewer set directly stops being derived.
pub fn rederive(doc: &mut CanonicalDocument, derived: &mut Vec<String>, patched: CanonicalField) {
    derived.retain(|entry| match parse_derivation(entry) {
        Some((target, _)) if target == patched => false,
        Some((target, inputs)) if inputs.contains(&patched) => {
            // Clearing with null never fails
            let _ = doc.set_field(target, &Value::Null);
            false
        }
        _ => true,
    });
    derived.extend(derive_fields(doc));
}
