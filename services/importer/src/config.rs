//! Environment configuration shared by the importer binary and worker

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::job::JobConfig;
use crate::orchestrator::ImporterConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub raw_fs_dir: PathBuf,
    /// Empty disables the catalog; uploads must then name a financial year
    pub catalog_url: String,
    pub national_government: String,
    pub job_max_attempts: u32,
    pub job_timeout: Duration,
    pub progress_interval: Duration,
    pub retry_backoff: Duration,
    pub worker_poll: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            raw_fs_dir: PathBuf::from(
                std::env::var("RAW_FS_DIR").unwrap_or_else(|_| "./data/uploads".to_string()),
            ),
            catalog_url: std::env::var("CATALOG_URL")
                .unwrap_or_else(|_| "https://data.vulekamali.gov.za".to_string()),
            national_government: std::env::var("NATIONAL_GOVERNMENT")
                .unwrap_or_else(|_| "South Africa".to_string()),
            job_max_attempts: env_or("JOB_MAX_ATTEMPTS", 3)?,
            job_timeout: Duration::from_secs(env_or("JOB_TIMEOUT_SECS", 900)?),
            progress_interval: Duration::from_millis(env_or("PROGRESS_INTERVAL_MS", 500)?),
            retry_backoff: Duration::from_secs(env_or("RETRY_BACKOFF_SECS", 5)?),
            worker_poll: Duration::from_secs(env_or("WORKER_POLL_SECS", 5)?),
        })
    }

    pub fn importer(&self) -> ImporterConfig {
        ImporterConfig {
            national_government: self.national_government.clone(),
        }
    }

    pub fn job(&self) -> JobConfig {
        JobConfig {
            max_attempts: self.job_max_attempts,
            attempt_timeout: self.job_timeout,
            progress_interval: self.progress_interval,
            retry_backoff: self.retry_backoff,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_or(key, std::env::var(key).ok(), default)
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(v) => v.parse().with_context(|| format!("{key} has an invalid value \"{v}\"")),
    }
}
