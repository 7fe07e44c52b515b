//! SeaORM entity models
//!
//! Database entities for the LedgerForge pipeline

mod batch;
mod classification_event;
pub(crate) mod item;
mod mapping_feedback;
mod misclassification;
mod promoted_document;

pub use batch::{
    ActiveModel as BatchActiveModel,
    Column as BatchColumn,
    Entity as BatchEntity,
    Model as BatchRow,
};

pub use item::{
    ActiveModel as ItemActiveModel,
    Column as ItemColumn,
    Entity as ItemEntity,
    Model as ItemRow,
};

pub use mapping_feedback::{
    ActiveModel as MappingFeedbackActiveModel,
    Column as MappingFeedbackColumn,
    Entity as MappingFeedbackEntity,
};

pub use misclassification::{
    ActiveModel as MisclassificationActiveModel,
    Column as MisclassificationColumn,
    Entity as MisclassificationEntity,
};

pub use classification_event::{
    ActiveModel as ClassificationEventActiveModel,
    Column as ClassificationEventColumn,
    Entity as ClassificationEventEntity,
};

pub use promoted_document::{
    ActiveModel as PromotedDocumentActiveModel,
    Column as PromotedDocumentColumn,
    Entity as PromotedDocumentEntity,
    Model as PromotedDocument,
};
