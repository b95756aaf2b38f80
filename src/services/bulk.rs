//! Bulk operations: many independent object operations run concurrently,
//! joined under one deadline, with every failure reported together.
//!
//! Nothing is rolled back. Items that completed before a failure or a
//! timeout stay in the store, and a reader may see the tree half-populated
//! while a batch is in flight.

use crate::{
    errors::{FsError, FsResult, ItemFailure},
    models::path::{ObjectPath, PATH_DELIMITER, ancestor_prefixes},
    services::{channels::CreateOptions, filesystem::BlobFileSystem},
};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Runs one task per item with a concurrency cap and a join deadline.
#[derive(Clone, Debug)]
pub struct BulkExecutor {
    max_concurrency: usize,
    join_timeout: Duration,
}

impl BulkExecutor {
    pub fn new(max_concurrency: usize, join_timeout: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            join_timeout,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    /// Run `task` once for every name and wait for all of them.
    ///
    /// Every task runs to completion regardless of the others. Failed items
    /// are collected into `PartialFailure`; a task that panics counts as a
    /// failed item. If the join phase outlives `join_timeout`, the remaining
    /// tasks are aborted and `Timeout` is returned instead.
    ///
    /// Returns the number of items processed.
    pub async fn run<F, Fut>(
        &self,
        operation: &'static str,
        names: Vec<String>,
        task: F,
    ) -> FsResult<usize>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FsResult<()>> + Send + 'static,
    {
        let total = names.len();
        if total == 0 {
            return Ok(0);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let task = Arc::new(task);
        let mut set = JoinSet::new();
        let mut names_by_task = HashMap::with_capacity(total);

        for name in names {
            let semaphore = semaphore.clone();
            let task = task.clone();
            let item = name.clone();
            let handle = set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = task(item.clone()).await;
                (item, result)
            });
            names_by_task.insert(handle.id(), name);
        }
        debug!("{}: dispatched {} items", operation, total);

        let deadline = Instant::now() + self.join_timeout;
        let mut failures = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next_with_id()).await {
                Ok(None) => break,
                Ok(Some(Ok((_, (_, Ok(())))))) => {}
                Ok(Some(Ok((_, (name, Err(error)))))) => {
                    failures.push(ItemFailure { name, error });
                }
                Ok(Some(Err(join_err))) => {
                    let name = names_by_task
                        .remove(&join_err.id())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    warn!("{}: task for {} failed: {}", operation, name, join_err);
                    failures.push(ItemFailure {
                        error: FsError::TaskFailed(name.clone()),
                        name,
                    });
                }
                Err(_) => {
                    let pending = set.len();
                    set.abort_all();
                    warn!(
                        "{}: {} of {} items still running after {:?}; aborted",
                        operation, pending, total, self.join_timeout
                    );
                    return Err(FsError::Timeout {
                        operation,
                        limit: self.join_timeout,
                        pending,
                    });
                }
            }
        }

        if failures.is_empty() {
            return Ok(total);
        }

        failures.sort_by(|a, b| a.name.cmp(&b.name));
        warn!(
            "{}: {} of {} items failed",
            operation,
            failures.len(),
            total
        );
        Err(FsError::PartialFailure {
            operation,
            total,
            failures,
        })
    }
}

/// Create every name in `bucket` concurrently.
///
/// Names ending with the delimiter become directory markers; any other name
/// becomes a file whose content is the name itself, created with
/// `CreateNew`. Nothing is rolled back when some creations fail.
pub async fn bulk_create<S: AsRef<str>>(
    fs: &BlobFileSystem,
    bucket: &str,
    names: &[S],
) -> FsResult<usize> {
    let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
    let task_fs = fs.clone();
    let bucket = bucket.to_string();

    fs.bulk()
        .run("create", names, move |name| {
            let fs = task_fs.clone();
            let bucket = bucket.clone();
            async move {
                let path = ObjectPath::new(bucket, name.clone(), false)?;
                if name.ends_with(PATH_DELIMITER) {
                    fs.mkdir(&path).await
                } else {
                    let mut writer = fs.create(&path, CreateOptions::create_new()).await?;
                    writer.write(name.as_bytes());
                    writer.close().await.map(|_| ())
                }
            }
        })
        .await
}

/// Names plus every implied ancestor prefix, each at most once.
///
/// Ancestors come right before the first name that needs them, so
/// `["a/b/c", "x"]` becomes `["a/", "a/b/", "a/b/c", "x"]`.
pub fn expand_subdirs<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut all = Vec::new();
    let mut seen = HashSet::new();
    for name in names {
        let name = name.as_ref();
        for subdir in ancestor_prefixes(name) {
            if seen.insert(subdir.clone()) {
                all.push(subdir);
            }
        }
        if seen.insert(name.to_string()) {
            all.push(name.to_string());
        }
    }
    all
}

/// [`bulk_create`] of `names` and all of their ancestor directories.
pub async fn create_objects_with_subdirs<S: AsRef<str>>(
    fs: &BlobFileSystem,
    bucket: &str,
    names: &[S],
) -> FsResult<usize> {
    bulk_create(fs, bucket, &expand_subdirs(names)).await
}

/// `prefix` followed by `-` and eight random hex characters.
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, short_id())
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

const MAX_BUCKET_NAME_LEN: usize = 63;

/// Naming convention for throwaway buckets.
///
/// Every bucket named here starts with `{prefix}-`, so a sweep can find and
/// delete them without touching anything else.
#[derive(Clone, Debug)]
pub struct TestBuckets {
    prefix: String,
}

impl TestBuckets {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().to_ascii_lowercase(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}-{random}[-{suffix}]`, lowercased and cut to 63 characters.
    pub fn unique_bucket_name(&self, suffix: &str) -> String {
        let mut name = unique_name(&self.prefix);
        if !suffix.is_empty() {
            name.push('-');
            name.push_str(suffix);
        }
        let mut name: String = name
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
            .take(MAX_BUCKET_NAME_LEN)
            .collect();
        while name.ends_with('-') || name.ends_with('.') {
            name.pop();
        }
        name
    }

    pub fn is_test_bucket(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-", self.prefix))
    }

    /// Delete every bucket carrying the prefix, with all of its objects.
    pub async fn cleanup(&self, fs: &BlobFileSystem) -> FsResult<usize> {
        let names: Vec<String> = fs
            .store()
            .list_buckets()
            .await?
            .into_iter()
            .map(|b| b.name)
            .filter(|name| self.is_test_bucket(name))
            .collect();
        debug!("sweeping {} test buckets", names.len());

        let task_fs = fs.clone();
        fs.bulk()
            .run("cleanup", names, move |name| {
                let fs = task_fs.clone();
                async move { fs.delete_bucket(&name).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn expands_ancestors_once_in_order() {
        assert_eq!(
            expand_subdirs(&["a/b/c", "x"]),
            vec!["a/", "a/b/", "a/b/c", "x"]
        );
        assert_eq!(
            expand_subdirs(&["foo/bar/zoo", "foo/bar/baz", "foo/"]),
            vec!["foo/", "foo/bar/", "foo/bar/zoo", "foo/bar/baz"]
        );
        assert_eq!(expand_subdirs(&["x", "x"]), vec!["x"]);
    }

    #[test]
    fn unique_names_carry_prefix() {
        let name = unique_name("run");
        assert!(name.starts_with("run-"));
        assert_eq!(name.len(), "run-".len() + 8);
        assert_ne!(unique_name("run"), unique_name("run"));
    }

    #[test]
    fn test_bucket_names_are_valid_and_tagged() {
        let buckets = TestBuckets::new("blobfs-test");
        let name = buckets.unique_bucket_name("Shared_1");
        assert!(name.starts_with("blobfs-test-"));
        assert!(name.ends_with("-shared-1"));
        assert!(crate::store::ensure_bucket_name_safe(&name).is_ok());
        assert!(buckets.is_test_bucket(&name));
        assert!(!buckets.is_test_bucket("production"));

        let long = buckets.unique_bucket_name(&"s".repeat(100));
        assert_eq!(long.len(), 63);
    }

    #[tokio::test]
    async fn runs_every_item_and_aggregates_failures() {
        let executor = BulkExecutor::new(4, Duration::from_secs(5));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();

        let names: Vec<String> = (0..20).map(|i| format!("item-{:02}", i)).collect();
        let err = executor
            .run("test", names, move |name| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if name.ends_with('3') {
                        Err(FsError::NotFound(name))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(ran.load(Ordering::SeqCst), 20);
        assert_eq!(err.failed_items(), vec!["item-03", "item-13"]);
        assert!(matches!(err, FsError::PartialFailure { total: 20, .. }));
    }

    #[tokio::test]
    async fn caps_concurrency() {
        let executor = BulkExecutor::new(3, Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());

        let names: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        let done = executor
            .run("cap", names, move |_| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(done, 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn join_deadline_reports_timeout() {
        let executor = BulkExecutor::new(8, Duration::from_millis(50));
        let names = vec!["fast".to_string(), "slow".to_string()];
        let err = executor
            .run("deadline", names, |name| async move {
                if name == "slow" {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FsError::Timeout {
                operation: "deadline",
                pending: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn panicking_task_is_a_failed_item() {
        let executor = BulkExecutor::new(2, Duration::from_secs(5));
        let names = vec!["ok".to_string(), "boom".to_string()];
        let err = executor
            .run("panic", names, |name| async move {
                if name == "boom" {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.failed_items(), vec!["boom"]);
    }
}
