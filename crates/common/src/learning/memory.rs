use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ClassificationEvent, LearningLog, MappingFeedback, Misclassification};
use crate::errors::Result;
use crate::schema::DocType;

/// Process-local learning log
#[derive(Default)]
pub struct MemoryLearningLog {
    feedback: RwLock<Vec<MappingFeedback>>,
    misclassifications: RwLock<Vec<Misclassification>>,
    events: RwLock<Vec<ClassificationEvent>>,
}

impl MemoryLearningLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LearningLog for MemoryLearningLog {
    async fn record_mapping_feedback(&self, feedback: MappingFeedback) -> Result<()> {
        self.feedback.write().await.push(feedback);
        Ok(())
    }

    async fn record_misclassification(&self, record: Misclassification) -> Result<()> {
        self.misclassifications.write().await.push(record);
        Ok(())
    }

    async fn record_classification(&self, event: ClassificationEvent) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn mapping_feedback(
        &self,
        tenant_id: &str,
        doc_type: Option<DocType>,
    ) -> Result<Vec<MappingFeedback>> {
        Ok(self
            .feedback
            .read()
            .await
            .iter()
            .filter(|f| f.tenant_id == tenant_id)
            .filter(|f| doc_type.map_or(true, |d| f.doc_type == d))
            .cloned()
            .collect())
    }

    async fn misclassifications(&self, tenant_id: &str) -> Result<Vec<Misclassification>> {
        Ok(self
            .misclassifications
            .read()
            .await
            .iter()
            .filter(|m| m.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn classification_events(&self, tenant_id: &str) -> Result<Vec<ClassificationEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
