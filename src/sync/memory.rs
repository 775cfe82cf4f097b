use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::entity::{Entity, Relationship};
use crate::events::IntegrationEvent;
use crate::sync::{
    PartialDatasets, SynchronizationApi, SynchronizationJob, SynchronizationJobStatus,
};
use crate::{IntegrationError, Result};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, SynchronizationJob>,
    uploaded_entities: HashMap<String, Vec<Entity>>,
    uploaded_relationships: HashMap<String, Vec<Relationship>>,
    events: HashMap<String, Vec<IntegrationEvent>>,
    partial_datasets: HashMap<String, PartialDatasets>,
    abort_reasons: HashMap<String, String>,
}

/// In-memory SynchronizationApi for local development and unit tests.
///
/// Records everything an invocation would send to the persister so tests can
/// assert on uploads, event order, and the final job status.
#[derive(Clone, Default)]
pub struct MemorySynchronizationApi {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySynchronizationApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job(&self, job_id: &str) -> Option<SynchronizationJob> {
        self.state.lock().await.jobs.get(job_id).cloned()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn jobs(&self) -> Vec<SynchronizationJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn uploaded_entities(&self, job_id: &str) -> Vec<Entity> {
        self.state
            .lock()
            .await
            .uploaded_entities
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn uploaded_relationships(&self, job_id: &str) -> Vec<Relationship> {
        self.state
            .lock()
            .await
            .uploaded_relationships
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn events(&self, job_id: &str) -> Vec<IntegrationEvent> {
        self.state
            .lock()
            .await
            .events
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn partial_datasets(&self, job_id: &str) -> Option<PartialDatasets> {
        self.state
            .lock()
            .await
            .partial_datasets
            .get(job_id)
            .cloned()
    }

    pub async fn abort_reason(&self, job_id: &str) -> Option<String> {
        self.state.lock().await.abort_reasons.get(job_id).cloned()
    }
}

fn unknown_job(job_id: &str) -> IntegrationError {
    IntegrationError::sync_api(
        format!("/persister/synchronization/jobs/{job_id}"),
        Some(404),
        "job not found",
    )
}

#[async_trait]
impl SynchronizationApi for MemorySynchronizationApi {
    async fn initiate_job(&self, _integration_instance_id: &str) -> Result<SynchronizationJob> {
        let job = SynchronizationJob {
            id: uuid::Uuid::new_v4().to_string(),
            status: SynchronizationJobStatus::AwaitingUploads,
        };
        self.state
            .lock()
            .await
            .jobs
            .insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn upload_entities(&self, job_id: &str, entities: Vec<Entity>) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get(job_id).ok_or_else(|| unknown_job(job_id))?;
        if job.status != SynchronizationJobStatus::AwaitingUploads {
            return Err(IntegrationError::sync_api(
                format!("/persister/synchronization/jobs/{job_id}/entities"),
                Some(400),
                "job is not awaiting uploads",
            ));
        }
        state
            .uploaded_entities
            .entry(job_id.to_string())
            .or_default()
            .extend(entities);
        Ok(())
    }

    async fn upload_relationships(
        &self,
        job_id: &str,
        relationships: Vec<Relationship>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get(job_id).ok_or_else(|| unknown_job(job_id))?;
        if job.status != SynchronizationJobStatus::AwaitingUploads {
            return Err(IntegrationError::sync_api(
                format!("/persister/synchronization/jobs/{job_id}/relationships"),
                Some(400),
                "job is not awaiting uploads",
            ));
        }
        state
            .uploaded_relationships
            .entry(job_id.to_string())
            .or_default()
            .extend(relationships);
        Ok(())
    }

    async fn finalize_job(
        &self,
        job_id: &str,
        partial_datasets: &PartialDatasets,
    ) -> Result<SynchronizationJob> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| unknown_job(job_id))?;
        if job.status != SynchronizationJobStatus::AwaitingUploads {
            return Err(IntegrationError::sync_api(
                format!("/persister/synchronization/jobs/{job_id}/finalize"),
                Some(400),
                "job cannot be finalized",
            ));
        }
        job.status = SynchronizationJobStatus::Finalized;
        let job = job.clone();
        state
            .partial_datasets
            .insert(job_id.to_string(), partial_datasets.clone());
        Ok(job)
    }

    async fn abort_job(&self, job_id: &str, reason: &str) -> Result<SynchronizationJob> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| unknown_job(job_id))?;
        if matches!(
            job.status,
            SynchronizationJobStatus::Finalized | SynchronizationJobStatus::Aborted
        ) {
            return Err(IntegrationError::sync_api(
                format!("/persister/synchronization/jobs/{job_id}/abort"),
                Some(400),
                "job already terminal",
            ));
        }
        job.status = SynchronizationJobStatus::Aborted;
        let job = job.clone();
        state
            .abort_reasons
            .insert(job_id.to_string(), reason.to_string());
        Ok(job)
    }

    async fn publish_event(&self, job_id: &str, event: &IntegrationEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(job_id) {
            return Err(unknown_job(job_id));
        }
        state
            .events
            .entry(job_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_lifecycle_finalize() {
        let api = MemorySynchronizationApi::new();
        let job = api.initiate_job("instance-1").await.unwrap();
        assert_eq!(job.status, SynchronizationJobStatus::AwaitingUploads);

        let finalized = api
            .finalize_job(
                &job.id,
                &PartialDatasets {
                    types: vec!["acme_host".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(finalized.status, SynchronizationJobStatus::Finalized);
        assert_eq!(
            api.partial_datasets(&job.id).await.unwrap().types,
            vec!["acme_host"]
        );

        // Terminal jobs reject further transitions and uploads.
        assert!(api.abort_job(&job.id, "late").await.is_err());
        assert!(api.upload_entities(&job.id, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn abort_records_the_reason() {
        let api = MemorySynchronizationApi::new();
        let job = api.initiate_job("instance-1").await.unwrap();
        let aborted = api.abort_job(&job.id, "validation failed").await.unwrap();
        assert_eq!(aborted.status, SynchronizationJobStatus::Aborted);
        assert_eq!(
            api.abort_reason(&job.id).await.as_deref(),
            Some("validation failed")
        );
    }
}
