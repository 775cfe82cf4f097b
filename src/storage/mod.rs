pub mod bucket;

use std::future::Future;
use std::path::{Path, PathBuf};

use dashmap::DashSet;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use crate::entity::{Entity, Relationship};
use crate::{IntegrationError, Result};

pub use bucket::BucketMap;

/// Buffered items per store before a flush is forced.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 500;

/// Bounded parallelism for shard writes within one flush.
const SHARD_WRITE_CONCURRENCY: usize = 4;

const ENTITIES: &str = "entities";
const RELATIONSHIPS: &str = "relationships";

/// Disk-backed buffer for collected graph objects.
///
/// Producers append under a bucket path (typically the step id); once the
/// in-memory total crosses the flush threshold the producer awaits a flush of
/// that map, which bounds the buffer under a fast producer. Flushed items are
/// reachable through the per-type index; a `graph/<bucket>/` mirror exists
/// for human inspection only.
pub struct GraphObjectStore {
    cache_directory: PathBuf,
    entities: Mutex<BucketMap<Entity>>,
    relationships: Mutex<BucketMap<Relationship>>,
    // Single permit: exactly one flush runs at a time per store.
    flush_permit: Semaphore,
    flush_threshold: usize,
    seen_entity_keys: DashSet<String>,
}

impl GraphObjectStore {
    pub fn new(cache_directory: impl Into<PathBuf>) -> Self {
        Self::with_flush_threshold(cache_directory, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn with_flush_threshold(
        cache_directory: impl Into<PathBuf>,
        flush_threshold: usize,
    ) -> Self {
        Self {
            cache_directory: cache_directory.into(),
            entities: Mutex::new(BucketMap::new()),
            relationships: Mutex::new(BucketMap::new()),
            flush_permit: Semaphore::new(1),
            flush_threshold: flush_threshold.max(1),
            seen_entity_keys: DashSet::new(),
        }
    }

    pub fn cache_directory(&self) -> &Path {
        &self.cache_directory
    }

    /// Appends entities under `bucket_path`, enforcing `_key` uniqueness
    /// across the invocation. Awaits a flush when the buffer crosses the
    /// threshold.
    pub async fn add_entities(&self, bucket_path: &str, items: Vec<Entity>) -> Result<()> {
        let total = {
            let mut map = self.entities.lock().await;
            let mut batch_keys = std::collections::HashSet::new();
            for item in &items {
                if self.seen_entity_keys.contains(&item.key) || !batch_keys.insert(&item.key) {
                    return Err(IntegrationError::DuplicateKey {
                        key: item.key.clone(),
                    });
                }
            }
            for item in &items {
                self.seen_entity_keys.insert(item.key.clone());
            }
            map.add(bucket_path, items);
            map.total_item_count()
        };
        if total >= self.flush_threshold {
            self.flush_entities().await?;
        }
        Ok(())
    }

    /// Appends relationships under `bucket_path`; flushes past the threshold.
    pub async fn add_relationships(
        &self,
        bucket_path: &str,
        items: Vec<Relationship>,
    ) -> Result<()> {
        let total = {
            let mut map = self.relationships.lock().await;
            map.add(bucket_path, items);
            map.total_item_count()
        };
        if total >= self.flush_threshold {
            self.flush_relationships().await?;
        }
        Ok(())
    }

    pub async fn flush_entities(&self) -> Result<()> {
        let _permit = self.acquire_flush_permit().await?;
        let drained = { self.entities.lock().await.drain() };
        self.write_buckets(ENTITIES, encode_buckets(drained)?).await
    }

    pub async fn flush_relationships(&self) -> Result<()> {
        let _permit = self.acquire_flush_permit().await?;
        let drained = { self.relationships.lock().await.drain() };
        self.write_buckets(RELATIONSHIPS, encode_buckets(drained)?)
            .await
    }

    /// Flushes both maps. The single permit serializes the actual disk work.
    pub async fn flush(&self) -> Result<()> {
        tokio::try_join!(self.flush_entities(), self.flush_relationships())?;
        Ok(())
    }

    /// Invokes `iteratee` once per flushed entity of `entity_type`, in shard
    /// discovery order and insertion order within a shard. Buffered items are
    /// flushed first so every stored entity is observed.
    pub async fn iterate_entities<F, Fut>(&self, entity_type: &str, iteratee: F) -> Result<()>
    where
        F: FnMut(Entity) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.flush_entities().await?;
        self.iterate_kind(ENTITIES, entity_type, iteratee).await
    }

    pub async fn iterate_relationships<F, Fut>(
        &self,
        relationship_type: &str,
        iteratee: F,
    ) -> Result<()>
    where
        F: FnMut(Relationship) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.flush_relationships().await?;
        self.iterate_kind(RELATIONSHIPS, relationship_type, iteratee)
            .await
    }

    /// Types present in the on-disk entity index.
    pub async fn flushed_entity_types(&self) -> Result<Vec<String>> {
        self.list_index_types(ENTITIES).await
    }

    pub async fn flushed_relationship_types(&self) -> Result<Vec<String>> {
        self.list_index_types(RELATIONSHIPS).await
    }

    /// Buffered (not yet flushed) entity count. Primarily for tests.
    pub async fn buffered_entity_count(&self) -> usize {
        self.entities.lock().await.total_item_count()
    }

    /// Buffered (not yet flushed) relationship count. Primarily for tests.
    pub async fn buffered_relationship_count(&self) -> usize {
        self.relationships.lock().await.total_item_count()
    }

    async fn acquire_flush_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.flush_permit
            .acquire()
            .await
            .map_err(IntegrationError::unexpected)
    }

    async fn write_buckets(&self, kind: &str, buckets: Vec<(String, Vec<Value>)>) -> Result<()> {
        if buckets.is_empty() {
            return Ok(());
        }

        let write_permits = Semaphore::new(SHARD_WRITE_CONCURRENCY);
        let mut writes = FuturesUnordered::new();
        for (bucket_path, items) in buckets {
            let permits = &write_permits;
            writes.push(async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(IntegrationError::unexpected)?;
                self.write_bucket(kind, &bucket_path, items).await
            });
        }
        while let Some(result) = writes.next().await {
            result?;
        }
        Ok(())
    }

    async fn write_bucket(&self, kind: &str, bucket_path: &str, items: Vec<Value>) -> Result<()> {
        // One shard per `_type` present in the bucket, first-seen order.
        let mut by_type: Vec<(String, Vec<Value>)> = Vec::new();
        for item in &items {
            let object_type = item
                .get("_type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            match by_type.iter_mut().find(|(t, _)| *t == object_type) {
                Some((_, bucket)) => bucket.push(item.clone()),
                None => by_type.push((object_type, vec![item.clone()])),
            }
        }

        for (object_type, shard) in by_type {
            let shard_path = self
                .index_dir(kind)
                .join(&object_type)
                .join(format!("{}.json", uuid::Uuid::new_v4()));
            write_json(&shard_path, &serde_json::json!({ kind: shard })).await?;
        }

        let mirror_path = self
            .cache_directory
            .join("graph")
            .join(bucket_path)
            .join(format!("{}.json", uuid::Uuid::new_v4()));
        write_json(&mirror_path, &serde_json::json!({ kind: items })).await
    }

    async fn iterate_kind<T, F, Fut>(&self, kind: &str, object_type: &str, mut iteratee: F) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let type_dir = self.index_dir(kind).join(object_type);
        let mut entries = match tokio::fs::read_dir(&type_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(IntegrationError::unexpected(err)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(IntegrationError::unexpected)?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path)
                .await
                .map_err(IntegrationError::unexpected)?;
            let payload: Value =
                serde_json::from_slice(&raw).map_err(IntegrationError::unexpected)?;
            let Some(items) = payload.get(kind).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let object: T =
                    serde_json::from_value(item.clone()).map_err(IntegrationError::unexpected)?;
                iteratee(object).await?;
            }
        }
        Ok(())
    }

    async fn list_index_types(&self, kind: &str) -> Result<Vec<String>> {
        let dir = self.index_dir(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(IntegrationError::unexpected(err)),
        };
        let mut types = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(IntegrationError::unexpected)?
        {
            if entry
                .file_type()
                .await
                .map_err(IntegrationError::unexpected)?
                .is_dir()
            {
                types.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        types.sort();
        Ok(types)
    }

    fn index_dir(&self, kind: &str) -> PathBuf {
        self.cache_directory.join("index").join(kind)
    }
}

fn encode_buckets<T: Serialize>(buckets: Vec<(String, Vec<T>)>) -> Result<Vec<(String, Vec<Value>)>> {
    buckets
        .into_iter()
        .map(|(path, items)| {
            let values = items
                .into_iter()
                .map(|item| serde_json::to_value(item).map_err(IntegrationError::unexpected))
                .collect::<Result<Vec<Value>>>()?;
            Ok((path, values))
        })
        .collect()
}

async fn write_json(path: &Path, payload: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(IntegrationError::unexpected)?;
    }
    let bytes = serde_json::to_vec(payload).map_err(IntegrationError::unexpected)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(IntegrationError::unexpected)
}
