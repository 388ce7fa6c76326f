use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use conveyor_core::{ConveyorError, WorkflowDefinition, WorkflowId, WorkflowRegistry};

/// In-memory workflow registry
///
/// Definitions are validated on registration and immutable afterwards;
/// re-registering an ID replaces the definition wholesale.
#[derive(Default)]
pub struct InMemoryWorkflowRegistry {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRegistry for InMemoryWorkflowRegistry {
    async fn register(&self, definition: WorkflowDefinition) -> Result<(), ConveyorError> {
        definition.validate()?;

        let mut definitions = self.definitions.write().await;
        let replaced = definitions
            .insert(definition.id.0.clone(), definition.clone())
            .is_some();
        if replaced {
            info!(workflow = %definition.id, "Workflow definition replaced");
        } else {
            info!(workflow = %definition.id, steps = definition.step_count(), "Workflow registered");
        }
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, ConveyorError> {
        Ok(self.definitions.read().await.get(&id.0).cloned())
    }

    async fn contains(&self, id: &WorkflowId) -> Result<bool, ConveyorError> {
        Ok(self.definitions.read().await.contains_key(&id.0))
    }

    async fn remove(&self, id: &WorkflowId) -> Result<(), ConveyorError> {
        let mut definitions = self.definitions.write().await;
        match definitions.remove(&id.0) {
            Some(_) => {
                debug!(workflow = %id, "Workflow removed");
                Ok(())
            }
            None => Err(ConveyorError::WorkflowNotFound(id.0.clone())),
        }
    }

    async fn list_ids(&self) -> Result<Vec<WorkflowId>, ConveyorError> {
        let mut ids: Vec<WorkflowId> = self
            .definitions
            .read()
            .await
            .keys()
            .cloned()
            .map(WorkflowId)
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }

    async fn count(&self) -> Result<usize, ConveyorError> {
        Ok(self.definitions.read().await.len())
    }

    async fn clear(&self) -> Result<(), ConveyorError> {
        self.definitions.write().await.clear();
        Ok(())
    }
}
