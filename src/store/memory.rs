//! In-process object store.
//!
//! Buckets are ordered maps from key to content, so prefix listings come out
//! in key order like they do from a real store. Faults and latency can be
//! injected to exercise partial-failure and timeout paths.

use super::{
    ListParams, Listing, ObjectStore, StoreError, StoreResult, WriteMode, clamp_range,
    ensure_bucket_name_safe, ensure_key_safe,
};
use crate::models::{bucket::Bucket, object::ObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    ops::Range,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::debug;

struct StoredObject {
    info: ObjectInfo,
    data: Bytes,
}

struct MemoryBucket {
    record: Bucket,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Default)]
struct Faults {
    failing_keys: HashSet<String>,
    latency: Option<Duration>,
}

/// Thread-safe in-memory [`ObjectStore`]. Clones share the same contents.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    buckets: Arc<RwLock<HashMap<String, MemoryBucket>>>,
    faults: Arc<RwLock<Faults>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write or delete of `key` fail with an I/O error.
    pub fn fail_key(&self, key: impl Into<String>) {
        write_lock(&self.faults).failing_keys.insert(key.into());
    }

    pub fn clear_faults(&self) {
        *write_lock(&self.faults) = Faults::default();
    }

    /// Delay every write and delete by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        write_lock(&self.faults).latency = Some(latency);
    }

    /// Number of objects in `bucket`, markers included.
    pub fn object_count(&self, bucket: &str) -> usize {
        read_lock(&self.buckets)
            .get(bucket)
            .map(|b| b.objects.len())
            .unwrap_or(0)
    }

    async fn before_mutation(&self, key: &str) -> StoreResult<()> {
        let (fail, latency) = {
            let faults = read_lock(&self.faults);
            (faults.failing_keys.contains(key), faults.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if fail {
            debug!("injected fault for key {}", key);
            return Err(StoreError::Io(io::Error::other(format!(
                "injected fault for `{}`",
                key
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn create_bucket(&self, name: &str) -> StoreResult<Bucket> {
        ensure_bucket_name_safe(name)?;
        let mut buckets = write_lock(&self.buckets);
        if buckets.contains_key(name) {
            return Err(StoreError::BucketAlreadyExists(name.to_string()));
        }
        let record = Bucket::new(name);
        buckets.insert(
            name.to_string(),
            MemoryBucket {
                record: record.clone(),
                objects: BTreeMap::new(),
            },
        );
        Ok(record)
    }

    async fn delete_bucket(&self, name: &str) -> StoreResult<()> {
        match write_lock(&self.buckets).remove(name) {
            Some(bucket) => {
                debug!(
                    "dropped bucket {} with {} objects",
                    name,
                    bucket.objects.len()
                );
                Ok(())
            }
            None => Err(StoreError::BucketNotFound(name.to_string())),
        }
    }

    async fn bucket_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(read_lock(&self.buckets).contains_key(name))
    }

    async fn list_buckets(&self) -> StoreResult<Vec<Bucket>> {
        let mut buckets: Vec<Bucket> = read_lock(&self.buckets)
            .values()
            .map(|b| b.record.clone())
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        mode: WriteMode,
    ) -> StoreResult<ObjectInfo> {
        ensure_key_safe(key)?;
        self.before_mutation(key).await?;

        let mut buckets = write_lock(&self.buckets);
        let entry = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;

        if mode == WriteMode::CreateNew && entry.objects.contains_key(key) {
            return Err(StoreError::ObjectAlreadyExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let info = ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: data.len() as u64,
            etag: Some(format!("{:x}", md5::compute(&data))),
            last_modified: Utc::now(),
        };
        entry.objects.insert(
            key.to_string(),
            StoredObject {
                info: info.clone(),
                data,
            },
        );
        Ok(info)
    }

    async fn get(&self, bucket: &str, key: &str, range: Option<Range<u64>>) -> StoreResult<Bytes> {
        let buckets = read_lock(&self.buckets);
        let entry = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        let object = entry
            .objects
            .get(key)
            .ok_or_else(|| StoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        let range = clamp_range(range, object.data.len() as u64);
        Ok(object.data.slice(range.start as usize..range.end as usize))
    }

    async fn head(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectInfo>> {
        let buckets = read_lock(&self.buckets);
        let entry = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        Ok(entry.objects.get(key).map(|o| o.info.clone()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.before_mutation(key).await?;
        let mut buckets = write_lock(&self.buckets);
        let entry = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        entry.objects.remove(key);
        Ok(())
    }

    async fn list(&self, bucket: &str, params: &ListParams) -> StoreResult<Listing> {
        let buckets = read_lock(&self.buckets);
        let entry = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;

        let prefix = params.prefix.as_deref().unwrap_or("");
        let start = match &params.start_after {
            Some(after) if after.as_str() >= prefix => after.clone(),
            _ => prefix.to_string(),
        };
        let limit = params.max_keys.unwrap_or(usize::MAX);

        let matched = entry
            .objects
            .range(start.clone()..)
            .filter(|(key, _)| params.start_after.as_deref() != Some(key.as_str()))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(_, object)| object.info.clone());

        Ok(Listing::fold(matched, params))
    }
}

// Poisoning is ignored: no writer leaves a map half-updated.
fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
