use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::IntegrationInstance;
use crate::entity::{Entity, Relationship};
use crate::logger::IntegrationLogger;
use crate::storage::GraphObjectStore;
use crate::{IntegrationError, Result};

/// Pluggable validation hook applied to every object a step produces.
pub trait SchemaValidator: Send + Sync {
    fn validate_entity(&self, entity: &Entity) -> Result<()>;
    fn validate_relationship(&self, relationship: &Relationship) -> Result<()>;
}

pub type DynSchemaValidator = Arc<dyn SchemaValidator>;

/// Structural checks only: envelope fields present, raw-data names unique,
/// relationship endpoints named one way or the other.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicSchemaValidator;

impl SchemaValidator for BasicSchemaValidator {
    fn validate_entity(&self, entity: &Entity) -> Result<()> {
        if entity.key.trim().is_empty() {
            return Err(IntegrationError::canonicalization("entity _key is empty"));
        }
        if entity.entity_type.trim().is_empty() {
            return Err(IntegrationError::canonicalization("entity _type is empty"));
        }
        if entity.class.is_empty() {
            return Err(IntegrationError::canonicalization(
                "entity _class must contain at least one class",
            ));
        }
        let mut names = std::collections::HashSet::new();
        for entry in &entity.raw_data {
            if !names.insert(entry.name.as_str()) {
                return Err(IntegrationError::canonicalization(format!(
                    "duplicate _rawData name: \"{}\"",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    fn validate_relationship(&self, relationship: &Relationship) -> Result<()> {
        if relationship.key.trim().is_empty() {
            return Err(IntegrationError::canonicalization(
                "relationship _key is empty",
            ));
        }
        if relationship.relationship_type.trim().is_empty() {
            return Err(IntegrationError::canonicalization(
                "relationship _type is empty",
            ));
        }
        if relationship.class.trim().is_empty() {
            return Err(IntegrationError::canonicalization(
                "relationship _class is empty",
            ));
        }
        if !relationship.has_endpoints() {
            return Err(IntegrationError::canonicalization(format!(
                "relationship \"{}\" names no endpoints",
                relationship.key
            )));
        }
        Ok(())
    }
}

/// What a step sees of the invocation's collection state: adds delegate to
/// the shared graph store under this step's bucket path.
pub struct StepJobState {
    step_id: String,
    store: Arc<GraphObjectStore>,
    validator: Option<DynSchemaValidator>,
}

impl StepJobState {
    pub fn new(
        step_id: impl Into<String>,
        store: Arc<GraphObjectStore>,
        validator: Option<DynSchemaValidator>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            store,
            validator,
        }
    }

    pub async fn add_entities(&self, entities: Vec<Entity>) -> Result<()> {
        if let Some(validator) = &self.validator {
            for entity in &entities {
                validator.validate_entity(entity)?;
            }
        }
        self.store.add_entities(&self.step_id, entities).await
    }

    pub async fn add_relationships(&self, relationships: Vec<Relationship>) -> Result<()> {
        if let Some(validator) = &self.validator {
            for relationship in &relationships {
                validator.validate_relationship(relationship)?;
            }
        }
        self.store
            .add_relationships(&self.step_id, relationships)
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationSummary {
    pub instance_id: String,
    pub started_on: DateTime<Utc>,
}

/// History visible to handlers. Only the current invocation is tracked;
/// persistent resumability across restarts is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHistory {
    pub current: InvocationSummary,
}

/// Everything a step handler is invoked with.
#[derive(Clone)]
pub struct StepExecutionContext {
    pub logger: IntegrationLogger,
    pub instance: Arc<IntegrationInstance>,
    pub job_state: Arc<StepJobState>,
    pub execution_history: Arc<ExecutionHistory>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn entity(key: &str) -> Entity {
        Entity {
            key: key.to_string(),
            entity_type: "acme_host".to_string(),
            class: vec!["Host".to_string()],
            raw_data: Vec::new(),
            properties: Map::new(),
        }
    }

    #[tokio::test]
    async fn job_state_buckets_by_step_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GraphObjectStore::with_flush_threshold(dir.path(), 10_000));
        let state = StepJobState::new("fetch-hosts", store.clone(), None);

        state.add_entities(vec![entity("h1")]).await.unwrap();
        store.flush().await.unwrap();

        assert!(dir.path().join("graph").join("fetch-hosts").exists());
    }

    #[tokio::test]
    async fn schema_validation_rejects_before_the_store_sees_anything() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GraphObjectStore::with_flush_threshold(dir.path(), 10_000));
        let state = StepJobState::new(
            "fetch-hosts",
            store.clone(),
            Some(Arc::new(BasicSchemaValidator)),
        );

        let err = state.add_entities(vec![entity("")]).await.unwrap_err();
        assert_eq!(err.code(), "ENTITY_CANONICALIZATION_ERROR");
        assert_eq!(store.buffered_entity_count().await, 0);
    }

    #[test]
    fn relationship_without_endpoints_is_invalid() {
        let relationship = Relationship {
            key: "r1".to_string(),
            relationship_type: "acme_network_has_host".to_string(),
            class: "HAS".to_string(),
            from_entity_key: None,
            to_entity_key: None,
            mapping: None,
            properties: Map::new(),
        };
        let err = BasicSchemaValidator
            .validate_relationship(&relationship)
            .unwrap_err();
        assert!(err.to_string().contains("endpoints"));
    }
}
