//! Text extraction seam
//!
//! The OCR engine is an external black box reached over HTTP. PDFs with an
//! embedded text layer are read locally first so the engine only sees scans
//! and images.

use async_trait::async_trait;
use ledgerforge_common::config::OcrConfig;
use ledgerforge_common::errors::{AppError, Result};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::parser::{is_binary_document, MIME_PDF};
use crate::pdf::extract_text_from_pdf;

/// Confidence reported for text read from a PDF text layer
const EMBEDDED_TEXT_CONFIDENCE: f64 = 0.95;

/// Below this many non-whitespace characters a PDF counts as scanned
const MIN_EMBEDDED_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub text: String,
    /// Engine confidence in `[0, 1]`
    pub confidence: f64,
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn id(&self) -> &'static str;

    async fn extract_text(&self, bytes: &[u8], mime: &str) -> Result<ExtractedText>;
}

/// Embedded PDF text via lopdf
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    fn id(&self) -> &'static str {
        "pdf_text"
    }

    async fn extract_text(&self, bytes: &[u8], mime: &str) -> Result<ExtractedText> {
        if mime != MIME_PDF {
            return Err(AppError::Ocr {
                message: format!("{} has no embedded text layer", mime),
                retryable: false,
            });
        }
        let text = extract_text_from_pdf("document", bytes)?;
        Ok(ExtractedText {
            text,
            confidence: EMBEDDED_TEXT_CONFIDENCE,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Client for an OCR engine answering `{text, confidence}` to a raw-bytes POST
pub struct HttpOcrClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOcrClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to build OCR client: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// Client for the configured engine, if one is configured
    pub fn from_config(config: &OcrConfig) -> Result<Option<Self>> {
        match config.endpoint {
            Some(ref endpoint) => Ok(Some(Self::new(
                endpoint.clone(),
                config.api_key.clone(),
                Duration::from_secs(config.timeout_secs),
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TextExtractor for HttpOcrClient {
    fn id(&self) -> &'static str {
        "http_ocr"
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn extract_text(&self, bytes: &[u8], mime: &str) -> Result<ExtractedText> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, mime)
            .body(bytes.to_vec());
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?.error_for_status()?;
        let body: OcrResponse = response.json().await?;

        debug!(chars = body.text.len(), "OCR engine responded");
        Ok(ExtractedText {
            text: body.text,
            confidence: body.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        })
    }
}

/// Embedded PDF text first, OCR engine for scans and images
pub struct RoutingExtractor {
    pdf: PdfTextExtractor,
    ocr: Option<Arc<dyn TextExtractor>>,
}

impl RoutingExtractor {
    pub fn new(ocr: Option<Arc<dyn TextExtractor>>) -> Self {
        Self {
            pdf: PdfTextExtractor,
            ocr,
        }
    }
}

#[async_trait]
impl TextExtractor for RoutingExtractor {
    fn id(&self) -> &'static str {
        "routing"
    }

    async fn extract_text(&self, bytes: &[u8], mime: &str) -> Result<ExtractedText> {
        if !is_binary_document(mime) {
            return Err(AppError::UnsupportedMediaType {
                mime: mime.to_string(),
            });
        }

        if mime == MIME_PDF {
            match self.pdf.extract_text(bytes, mime).await {
                Ok(extracted)
                    if extracted.text.chars().filter(|c| !c.is_whitespace()).count()
                        >= MIN_EMBEDDED_CHARS =>
                {
                    return Ok(extracted);
                }
                Ok(_) => debug!("PDF has no usable text layer, falling back to OCR"),
                Err(e) if self.ocr.is_none() => return Err(e),
                Err(e) => debug!(error = %e, "PDF text extraction failed, falling back to OCR"),
            }
        }

        match self.ocr {
            Some(ref ocr) => ocr.extract_text(bytes, mime).await,
            None => Err(AppError::Ocr {
                message: "no OCR engine configured".into(),
                retryable: false,
            }),
        }
    }
}
