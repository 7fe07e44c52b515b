//! Component lookup by identifier
//!
//! Classifiers, mappers, validators and parsers are registered under their
//! `id()` and resolved per batch, so a tenant mapping template can select a
//! different mapper without touching the pipeline.

use ledgerforge_common::config::AppConfig;
use ledgerforge_common::errors::{AppError, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::classify::{Classifier, ScoringEngine};
use crate::insights::LearningInsights;
use crate::mapping::{DictionaryMapper, Mapper};
use crate::parser::{CsvParser, JsonParser, ParserAdapter, SpreadsheetParser};
use crate::validate::{DocumentValidator, Validator};

pub const DEFAULT_CLASSIFIER: &str = "scoring";
pub const DEFAULT_MAPPER: &str = "dictionary";
pub const DEFAULT_VALIDATOR: &str = "document";

#[derive(Default, Clone)]
pub struct ComponentRegistry {
    classifiers: HashMap<String, Arc<dyn Classifier>>,
    mappers: HashMap<String, Arc<dyn Mapper>>,
    validators: HashMap<String, Arc<dyn Validator>>,
    parsers: Vec<Arc<dyn ParserAdapter>>,
    insights: Option<LearningInsights>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in components, wired to the learning log when given
    pub fn with_defaults(config: &AppConfig, insights: Option<LearningInsights>) -> Self {
        let mut registry = Self::new();

        let mut engine = ScoringEngine::with_defaults(&config.classification);
        let mut mapper = DictionaryMapper::new(config.mapping.learned_override_threshold);
        if let Some(ref insights) = insights {
            engine = engine.with_insights(insights.clone());
            mapper = mapper.with_insights(insights.clone());
        }
        registry.insights = insights;

        registry.register_classifier(Arc::new(engine));
        registry.register_mapper(Arc::new(mapper));
        registry.register_validator(Arc::new(DocumentValidator::new(
            config.pipeline.default_country.clone(),
        )));
        registry.register_parser(Arc::new(CsvParser));
        registry.register_parser(Arc::new(JsonParser));
        registry.register_parser(Arc::new(SpreadsheetParser));
        registry
    }

    /// Learning log the built-in components read from, when wired
    pub fn insights(&self) -> Option<&LearningInsights> {
        self.insights.as_ref()
    }

    pub fn register_classifier(&mut self, classifier: Arc<dyn Classifier>) {
        self.classifiers.insert(classifier.id().to_string(), classifier);
    }

    /// Register a mapper under its own id
    pub fn register_mapper(&mut self, mapper: Arc<dyn Mapper>) {
        self.mappers.insert(mapper.id().to_string(), mapper);
    }

    /// Register a mapper under a template name
    pub fn register_mapper_as(&mut self, template: &str, mapper: Arc<dyn Mapper>) {
        self.mappers.insert(template.to_string(), mapper);
    }

    pub fn register_validator(&mut self, validator: Arc<dyn Validator>) {
        self.validators.insert(validator.id().to_string(), validator);
    }

    pub fn register_parser(&mut self, parser: Arc<dyn ParserAdapter>) {
        self.parsers.push(parser);
    }

    pub fn classifier(&self, id: &str) -> Result<Arc<dyn Classifier>> {
        self.classifiers.get(id).cloned().ok_or_else(|| missing("classifier", id))
    }

    pub fn validator(&self, id: &str) -> Result<Arc<dyn Validator>> {
        self.validators.get(id).cloned().ok_or_else(|| missing("validator", id))
    }

    /// Mapper for a batch: its template when registered, the default otherwise
    pub fn mapper_for(&self, template: Option<&str>) -> Result<Arc<dyn Mapper>> {
        if let Some(mapper) = template.and_then(|t| self.mappers.get(t)) {
            return Ok(mapper.clone());
        }
        self.mappers
            .get(DEFAULT_MAPPER)
            .cloned()
            .ok_or_else(|| missing("mapper", DEFAULT_MAPPER))
    }

    /// First registered parser accepting the MIME type
    pub fn parser_for(&self, mime: &str) -> Option<Arc<dyn ParserAdapter>> {
        self.parsers.iter().find(|p| p.supports(mime)).cloned()
    }
}

fn missing(kind: &str, id: &str) -> AppError {
    AppError::Configuration {
        message: format!("no {} registered as '{}'", kind, id),
    }
}
