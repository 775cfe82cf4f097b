use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entity::{Entity, Relationship};
use crate::logger::IntegrationLogger;
use crate::storage::GraphObjectStore;
use crate::sync::{DynSynchronizationApi, RetryConfig, SynchronizationJob};
use crate::{IntegrationError, Result};

/// Items per upload batch, per kind.
pub const DEFAULT_UPLOAD_BATCH_SIZE: usize = 250;

/// Outstanding batch posts at any moment.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_UPLOAD_BATCH_SIZE,
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            retry: RetryConfig::default(),
        }
    }
}

/// Walks the store's on-disk type indices and uploads everything to the
/// synchronization job in bounded-parallel batches.
///
/// Emits `sync_upload_start` at the beginning and `sync_upload_end` once all
/// batches have landed. A batch that keeps failing after retries propagates
/// its error; the orchestrator aborts the job in response.
#[tracing::instrument(level = "debug", skip_all, fields(job = %job.id))]
pub async fn upload_collected_data(
    store: Arc<GraphObjectStore>,
    api: DynSynchronizationApi,
    job: &SynchronizationJob,
    logger: &IntegrationLogger,
    config: &UploadConfig,
) -> Result<()> {
    logger.synchronization_upload_start(job);
    store.flush().await?;

    for entity_type in store.flushed_entity_types().await? {
        upload_entity_type(&store, &api, &job.id, &entity_type, config).await?;
    }
    for relationship_type in store.flushed_relationship_types().await? {
        upload_relationship_type(&store, &api, &job.id, &relationship_type, config).await?;
    }

    logger.synchronization_upload_end(job);
    Ok(())
}

async fn upload_entity_type(
    store: &Arc<GraphObjectStore>,
    api: &DynSynchronizationApi,
    job_id: &str,
    entity_type: &str,
    config: &UploadConfig,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<Entity>(config.batch_size.max(1) * 2);
    let producer = tokio::spawn({
        let store = store.clone();
        let entity_type = entity_type.to_string();
        async move {
            store
                .iterate_entities(&entity_type, |entity| {
                    let tx = tx.clone();
                    async move {
                        tx.send(entity).await.map_err(|_| {
                            IntegrationError::sync_api("<upload>", None, "upload consumer stopped")
                        })
                    }
                })
                .await
        }
    });

    let api = api.clone();
    let job_id = job_id.to_string();
    let retry = config.retry.clone();
    let result = drain_batches(rx, config, move |items| {
        let api = api.clone();
        let job_id = job_id.clone();
        let retry = retry.clone();
        tokio::spawn(async move {
            post_with_retry(&retry, || {
                let api = api.clone();
                let job_id = job_id.clone();
                let items = items.clone();
                async move { api.upload_entities(&job_id, items).await }
            })
            .await
        })
    })
    .await;

    finish_producer(producer, result).await
}

async fn upload_relationship_type(
    store: &Arc<GraphObjectStore>,
    api: &DynSynchronizationApi,
    job_id: &str,
    relationship_type: &str,
    config: &UploadConfig,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<Relationship>(config.batch_size.max(1) * 2);
    let producer = tokio::spawn({
        let store = store.clone();
        let relationship_type = relationship_type.to_string();
        async move {
            store
                .iterate_relationships(&relationship_type, |relationship| {
                    let tx = tx.clone();
                    async move {
                        tx.send(relationship).await.map_err(|_| {
                            IntegrationError::sync_api("<upload>", None, "upload consumer stopped")
                        })
                    }
                })
                .await
        }
    });

    let api = api.clone();
    let job_id = job_id.to_string();
    let retry = config.retry.clone();
    let result = drain_batches(rx, config, move |items| {
        let api = api.clone();
        let job_id = job_id.clone();
        let retry = retry.clone();
        tokio::spawn(async move {
            post_with_retry(&retry, || {
                let api = api.clone();
                let job_id = job_id.clone();
                let items = items.clone();
                async move { api.upload_relationships(&job_id, items).await }
            })
            .await
        })
    })
    .await;

    finish_producer(producer, result).await
}

/// Packs received items into batches and keeps at most `concurrency` batch
/// posts outstanding.
async fn drain_batches<T, Spawn>(
    mut rx: mpsc::Receiver<T>,
    config: &UploadConfig,
    mut spawn_post: Spawn,
) -> Result<()>
where
    Spawn: FnMut(Vec<T>) -> JoinHandle<Result<()>>,
{
    let batch_size = config.batch_size.max(1);
    let concurrency = config.concurrency.max(1);
    let mut posts = FuturesUnordered::new();
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(item) = rx.recv().await {
        batch.push(item);
        if batch.len() >= batch_size {
            posts.push(spawn_post(std::mem::take(&mut batch)));
            while posts.len() >= concurrency {
                if let Some(joined) = posts.next().await {
                    joined.map_err(IntegrationError::unexpected)??;
                }
            }
        }
    }
    if !batch.is_empty() {
        posts.push(spawn_post(batch));
    }
    while let Some(joined) = posts.next().await {
        joined.map_err(IntegrationError::unexpected)??;
    }
    Ok(())
}

async fn finish_producer(producer: JoinHandle<Result<()>>, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => producer.await.map_err(IntegrationError::unexpected)?,
        Err(err) => {
            // The consumer failed; the producer's pending sends fail with it.
            producer.abort();
            Err(err)
        }
    }
}

async fn post_with_retry<F, Fut>(retry: &RetryConfig, mut post: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match post().await {
            Ok(()) => return Ok(()),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, attempt, "batch upload failed; backing off");
                last_err = Some(err);
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(retry.backoff_ms(attempt))).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        IntegrationError::sync_api("<upload>", None, "upload failed without an error")
    }))
}
