pub mod http;
pub mod memory;
pub mod uploader;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Relationship};
use crate::events::IntegrationEvent;
use crate::Result;

pub use http::{HttpSynchronizationApi, SyncApiConfig};
pub use memory::MemorySynchronizationApi;
pub use uploader::{upload_collected_data, UploadConfig};

/// Remote job lifecycle. `AWAITING_UPLOADS → FINALIZE_PENDING → FINALIZED`
/// on success; either pre-terminal state can move to `ABORTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SynchronizationJobStatus {
    AwaitingUploads,
    FinalizePending,
    Finalized,
    Aborted,
}

/// Remote job handle; opaque beyond `id` and the lifecycle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizationJob {
    pub id: String,
    pub status: SynchronizationJobStatus,
}

/// Declared types whose owning step did not complete successfully.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialDatasets {
    pub types: Vec<String>,
}

/// Shared retry policy for the event queue and the upload driver.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff: base * 2^attempt, capped.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.min(63);
        let exp = 1u128 << shift;
        let ms = (self.backoff_base_ms as u128).saturating_mul(exp);
        (ms.min(self.backoff_max_ms as u128)) as u64
    }
}

/// The persister synchronization service, seen from one invocation.
#[async_trait]
pub trait SynchronizationApi: Send + Sync {
    async fn initiate_job(&self, integration_instance_id: &str) -> Result<SynchronizationJob>;

    async fn upload_entities(&self, job_id: &str, entities: Vec<Entity>) -> Result<()>;

    async fn upload_relationships(
        &self,
        job_id: &str,
        relationships: Vec<Relationship>,
    ) -> Result<()>;

    async fn finalize_job(
        &self,
        job_id: &str,
        partial_datasets: &PartialDatasets,
    ) -> Result<SynchronizationJob>;

    async fn abort_job(&self, job_id: &str, reason: &str) -> Result<SynchronizationJob>;

    async fn publish_event(&self, job_id: &str, event: &IntegrationEvent) -> Result<()>;
}

pub type DynSynchronizationApi = Arc<dyn SynchronizationApi>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 1_500,
        };
        assert_eq!(retry.backoff_ms(0), 100);
        assert_eq!(retry.backoff_ms(1), 200);
        assert_eq!(retry.backoff_ms(3), 800);
        assert_eq!(retry.backoff_ms(4), 1_500);
        assert_eq!(retry.backoff_ms(60), 1_500);
    }

    #[test]
    fn job_status_uses_screaming_snake_case_on_the_wire() {
        let status = serde_json::to_value(SynchronizationJobStatus::AwaitingUploads).unwrap();
        assert_eq!(status, serde_json::json!("AWAITING_UPLOADS"));
        let finalized: SynchronizationJobStatus =
            serde_json::from_value(serde_json::json!("FINALIZED")).unwrap();
        assert_eq!(finalized, SynchronizationJobStatus::Finalized);
    }
}
