use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::entity::{Entity, Relationship};
use crate::events::IntegrationEvent;
use crate::sync::{
    PartialDatasets, SynchronizationApi, SynchronizationJob, SynchronizationJobStatus,
};
use crate::{IntegrationError, Result};

#[derive(Debug, Clone)]
pub struct SyncApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

impl SyncApiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout_ms: 30_000,
        }
    }
}

/// reqwest-backed client for the persister synchronization endpoints.
///
/// Timeouts and 5xx/429 responses surface as retriable synchronization
/// errors; 401/403 map to provider-auth errors carrying the endpoint.
#[derive(Debug, Clone)]
pub struct HttpSynchronizationApi {
    client: reqwest::Client,
    cfg: SyncApiConfig,
}

impl HttpSynchronizationApi {
    pub fn new(cfg: SyncApiConfig) -> Result<Self> {
        if cfg.base_url.trim().is_empty() {
            return Err(IntegrationError::config_validation(
                "sync api base_url is required",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|err| IntegrationError::sync_api("<client>", None, err.to_string()))?;
        Ok(Self { client, cfg })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.base_url.trim_end_matches('/'))
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| IntegrationError::sync_api(path, None, err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(IntegrationError::ProviderAuthentication {
                endpoint: url,
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("Unauthorized").to_string(),
            });
        }
        if status.as_u16() == 403 {
            return Err(IntegrationError::ProviderAuthorization {
                endpoint: url,
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("Forbidden").to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::sync_api(
                path,
                Some(status.as_u16()),
                truncate(&body, 512),
            ));
        }

        // Some endpoints respond with an empty body; treat that as null.
        let text = response
            .text()
            .await
            .map_err(|err| IntegrationError::sync_api(path, None, err.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|err| IntegrationError::sync_api(path, None, format!("invalid json: {err}")))
    }

    fn decode_job(body: Value, fallback_id: &str, fallback: SynchronizationJobStatus) -> SynchronizationJob {
        body.get("job")
            .cloned()
            .and_then(|job| serde_json::from_value(job).ok())
            .unwrap_or_else(|| SynchronizationJob {
                id: fallback_id.to_string(),
                status: fallback,
            })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(idx, _)| idx);
    format!("{}…", &text[..cut])
}

#[async_trait]
impl SynchronizationApi for HttpSynchronizationApi {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn initiate_job(&self, integration_instance_id: &str) -> Result<SynchronizationJob> {
        let path = "/persister/synchronization/jobs";
        let body = self
            .post(
                path,
                &serde_json::json!({ "integrationInstanceId": integration_instance_id }),
            )
            .await?;
        let job = body
            .get("job")
            .cloned()
            .ok_or_else(|| IntegrationError::sync_api(path, None, "response missing job"))?;
        serde_json::from_value(job)
            .map_err(|err| IntegrationError::sync_api(path, None, format!("invalid job: {err}")))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = entities.len()))]
    async fn upload_entities(&self, job_id: &str, entities: Vec<Entity>) -> Result<()> {
        let path = format!("/persister/synchronization/jobs/{job_id}/entities");
        self.post(&path, &serde_json::json!({ "entities": entities }))
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = relationships.len()))]
    async fn upload_relationships(
        &self,
        job_id: &str,
        relationships: Vec<Relationship>,
    ) -> Result<()> {
        let path = format!("/persister/synchronization/jobs/{job_id}/relationships");
        self.post(&path, &serde_json::json!({ "relationships": relationships }))
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn finalize_job(
        &self,
        job_id: &str,
        partial_datasets: &PartialDatasets,
    ) -> Result<SynchronizationJob> {
        let path = format!("/persister/synchronization/jobs/{job_id}/finalize");
        let body = self
            .post(&path, &serde_json::json!({ "partialDatasets": partial_datasets }))
            .await?;
        Ok(Self::decode_job(
            body,
            job_id,
            SynchronizationJobStatus::Finalized,
        ))
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn abort_job(&self, job_id: &str, reason: &str) -> Result<SynchronizationJob> {
        let path = format!("/persister/synchronization/jobs/{job_id}/abort");
        let body = self
            .post(&path, &serde_json::json!({ "reason": reason }))
            .await?;
        Ok(Self::decode_job(
            body,
            job_id,
            SynchronizationJobStatus::Aborted,
        ))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(event = %event.name))]
    async fn publish_event(&self, job_id: &str, event: &IntegrationEvent) -> Result<()> {
        let path = format!("/persister/synchronization/jobs/{job_id}/events");
        self.post(&path, event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_against_a_trailing_slash_base() {
        let api = HttpSynchronizationApi::new(SyncApiConfig::new(
            "https://api.lattice.dev/",
            "key",
        ))
        .unwrap();
        assert_eq!(
            api.url("/persister/synchronization/jobs"),
            "https://api.lattice.dev/persister/synchronization/jobs"
        );
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let err = HttpSynchronizationApi::new(SyncApiConfig::new("  ", "key")).unwrap_err();
        assert_eq!(err.code(), "CONFIG_VALIDATION_ERROR");
    }

    #[test]
    fn decode_job_falls_back_when_the_body_is_empty() {
        let job = HttpSynchronizationApi::decode_job(
            Value::Null,
            "job-1",
            SynchronizationJobStatus::Aborted,
        );
        assert_eq!(job.id, "job-1");
        assert_eq!(job.status, SynchronizationJobStatus::Aborted);

        let parsed = HttpSynchronizationApi::decode_job(
            serde_json::json!({"job": {"id": "job-2", "status": "FINALIZED"}}),
            "job-1",
            SynchronizationJobStatus::Aborted,
        );
        assert_eq!(parsed.id, "job-2");
        assert_eq!(parsed.status, SynchronizationJobStatus::Finalized);
    }
}
