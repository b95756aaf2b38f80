use crate::{
    TestBuckets,
    services::{channels::DEFAULT_READ_BUFFER_SIZE, filesystem::FsOptions},
};
use anyhow::{Context, Result};
use clap::Args;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage_dir: String,
    pub database_url: String,
    pub test_bucket_prefix: String,
    pub max_concurrency: usize,
    pub join_timeout: Duration,
    pub read_buffer_size: usize,
}

/// Command-line overrides; each one wins over its environment variable.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// Directory where object payloads are stored (overrides BLOBFS_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (overrides BLOBFS_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Name prefix marking sweepable test buckets (overrides BLOBFS_TEST_BUCKET_PREFIX)
    #[arg(long, global = true)]
    pub test_bucket_prefix: Option<String>,

    /// Concurrent items per bulk operation (overrides BLOBFS_MAX_CONCURRENCY)
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Seconds to wait for a bulk operation to finish (overrides BLOBFS_JOIN_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub join_timeout_secs: Option<u64>,

    /// Read-ahead buffer in bytes (overrides BLOBFS_READ_BUFFER_SIZE)
    #[arg(long, global = true)]
    pub read_buffer_size: Option<usize>,
}

impl AppConfig {
    /// Merge CLI args over environment variables over defaults.
    pub fn from_env_and_args(args: &ConfigArgs) -> Result<Self> {
        Self::from_sources(args, |name| env::var(name))
    }

    /// Same as [`AppConfig::from_env_and_args`] with an explicit variable lookup.
    pub fn from_sources<F>(args: &ConfigArgs, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let env_string = |name: &str, default: &str| -> Result<String> {
            match lookup(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let storage_dir = match &args.storage_dir {
            Some(dir) => dir.clone(),
            None => env_string("BLOBFS_STORAGE_DIR", "./data/objects")?,
        };
        let database_url = match &args.database_url {
            Some(url) => url.clone(),
            None => env_string("BLOBFS_DATABASE_URL", "sqlite://./data/meta/blobfs.db")?,
        };
        let test_bucket_prefix = match &args.test_bucket_prefix {
            Some(prefix) => prefix.clone(),
            None => env_string("BLOBFS_TEST_BUCKET_PREFIX", "blobfs-test")?,
        };
        let max_concurrency = match args.max_concurrency {
            Some(n) => n,
            None => parse_var(&lookup, "BLOBFS_MAX_CONCURRENCY", 32)?,
        };
        let join_timeout_secs = match args.join_timeout_secs {
            Some(secs) => secs,
            None => parse_var(&lookup, "BLOBFS_JOIN_TIMEOUT_SECS", 10)?,
        };
        let read_buffer_size = match args.read_buffer_size {
            Some(size) => size,
            None => parse_var(&lookup, "BLOBFS_READ_BUFFER_SIZE", DEFAULT_READ_BUFFER_SIZE)?,
        };

        anyhow::ensure!(max_concurrency > 0, "max concurrency must be at least 1");
        anyhow::ensure!(read_buffer_size > 0, "read buffer size must be at least 1 byte");

        Ok(Self {
            storage_dir,
            database_url,
            test_bucket_prefix,
            max_concurrency,
            join_timeout: Duration::from_secs(join_timeout_secs),
            read_buffer_size,
        })
    }

    pub fn fs_options(&self) -> FsOptions {
        FsOptions {
            max_concurrency: self.max_concurrency,
            join_timeout: self.join_timeout,
            read_buffer_size: self.read_buffer_size,
        }
    }

    pub fn test_buckets(&self) -> TestBuckets {
        TestBuckets::new(self.test_bucket_prefix.clone())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_without_env() {
        let cfg = AppConfig::from_sources(&ConfigArgs::default(), lookup_in(&[])).unwrap();
        assert_eq!(cfg.storage_dir, "./data/objects");
        assert_eq!(cfg.test_bucket_prefix, "blobfs-test");
        assert_eq!(cfg.max_concurrency, 32);
        assert_eq!(cfg.join_timeout, Duration::from_secs(10));
        assert_eq!(cfg.read_buffer_size, 64 * 1024);
    }

    #[test]
    fn args_override_env() {
        let args = ConfigArgs {
            max_concurrency: Some(4),
            ..ConfigArgs::default()
        };
        let cfg = AppConfig::from_sources(
            &args,
            lookup_in(&[
                ("BLOBFS_MAX_CONCURRENCY", "16"),
                ("BLOBFS_JOIN_TIMEOUT_SECS", "3"),
                ("BLOBFS_TEST_BUCKET_PREFIX", "ci-run"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.max_concurrency, 4);
        assert_eq!(cfg.join_timeout, Duration::from_secs(3));
        assert_eq!(cfg.test_buckets().prefix(), "ci-run");
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = AppConfig::from_sources(
            &ConfigArgs::default(),
            lookup_in(&[("BLOBFS_READ_BUFFER_SIZE", "lots")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("BLOBFS_READ_BUFFER_SIZE"));
    }
}
