//! Background import jobs
//!
//! `JobRunner::submit` returns at once with a handle; the import runs on a
//! tokio task. Every attempt starts from a clean report, and while it runs a
//! ticker appends a timestamped line whenever the import's progress changes.
//! Transient failures and timeouts are retried with a linear backoff; the
//! import itself is idempotent, so a retry converges on the same state.
//!
//! Jobs targeting the same kind and resolved scope run one after the other
//! within a process: the importer locks the scope once the financial year is
//! known, so an upload that names its year and one that takes it from the
//! catalog still queue behind each other.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::catalog::CatalogClient;
use crate::orchestrator::{progress_channel, Importer, Progress};
use crate::store::{Store, UploadStatus};

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub max_attempts: u32,
    /// Wall-clock budget of one attempt
    pub attempt_timeout: Duration,
    pub progress_interval: Duration,
    /// Multiplied by the attempt number
    pub retry_backoff: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(900),
            progress_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl JobConfig {
    /// Longest a live job can go without touching its upload record: every
    /// attempt runs out its timeout and every retry sleeps its full backoff.
    /// A `running` upload quieter than this was left behind by a dead worker.
    pub fn stale_after(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff_steps: u32 = (1..attempts).sum();
        self.attempt_timeout * attempts + self.retry_backoff * backoff_steps
    }
}

pub struct JobHandle {
    upload_id: Uuid,
    join: JoinHandle<UploadStatus>,
}

impl JobHandle {
    pub fn upload_id(&self) -> Uuid {
        self.upload_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the terminal status of the job.
    pub async fn wait(self) -> UploadStatus {
        match self.join.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(upload_id = %self.upload_id, error = %e, "Import task aborted");
                UploadStatus::Fail
            }
        }
    }
}

enum AttemptOutcome {
    Done,
    Failed { retryable: bool },
}

pub struct JobRunner<S, C> {
    importer: Arc<Importer<S, C>>,
    config: JobConfig,
}

impl<S, C> Clone for JobRunner<S, C> {
    fn clone(&self) -> Self {
        Self {
            importer: self.importer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, C> JobRunner<S, C>
where
    S: Store + 'static,
    C: CatalogClient + 'static,
{
    pub fn new(importer: Arc<Importer<S, C>>, config: JobConfig) -> Self {
        Self { importer, config }
    }

    /// Schedule an import of `upload_id` and return without waiting.
    pub fn submit(&self, upload_id: Uuid) -> JobHandle {
        let runner = self.clone();
        let join = tokio::spawn(async move { runner.execute(upload_id).await });
        JobHandle { upload_id, join }
    }

    async fn execute(&self, upload_id: Uuid) -> UploadStatus {
        let store = self.importer.store();
        match store.get_upload(upload_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(upload_id = %upload_id, "Upload not found, nothing to import");
                return UploadStatus::Fail;
            }
            Err(e) => {
                tracing::error!(upload_id = %upload_id, error = %e, "Could not load upload");
                return UploadStatus::Fail;
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.attempt(upload_id, attempt).await {
                AttemptOutcome::Done => return UploadStatus::Done,
                AttemptOutcome::Failed { retryable: true } if attempt < max_attempts => {
                    let backoff = self.config.retry_backoff * attempt;
                    tracing::warn!(upload_id = %upload_id, attempt, ?backoff, "Import attempt failed, retrying");
                    let line = format!(
                        "Attempt {attempt} of {max_attempts} failed, retrying in {}s",
                        backoff.as_secs()
                    );
                    if let Err(e) = store.append_report(upload_id, &line).await {
                        tracing::debug!(error = %e, "Could not append retry line");
                    }
                    tokio::time::sleep(backoff).await;
                }
                AttemptOutcome::Failed { .. } => return UploadStatus::Fail,
            }
        }

        UploadStatus::Fail
    }

    async fn attempt(&self, upload_id: Uuid, attempt: u32) -> AttemptOutcome {
        let store = self.importer.store();
        if let Err(e) = store.begin_attempt(upload_id).await {
            tracing::error!(upload_id = %upload_id, error = %e, "Could not start attempt");
            return AttemptOutcome::Failed { retryable: true };
        }

        let (tx, rx) = progress_channel();
        let import = self.importer.run(upload_id, &tx);
        tokio::pin!(import);

        let deadline = tokio::time::sleep(self.config.attempt_timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_reported: Option<Progress> = None;

        let result = loop {
            tokio::select! {
                biased;
                result = &mut import => break Some(result),
                _ = &mut deadline => break None,
                _ = ticker.tick() => {
                    let current = rx.borrow().clone();
                    if last_reported.as_ref() != Some(&current) {
                        let line = format!("[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), current);
                        if let Err(e) = store.append_report(upload_id, &line).await {
                            tracing::debug!(error = %e, "Could not append progress line");
                        }
                        last_reported = Some(current);
                    }
                }
            }
        };

        match result {
            Some(Ok(_)) => AttemptOutcome::Done,
            Some(Err(e)) => AttemptOutcome::Failed {
                retryable: e.is_retryable(),
            },
            None => {
                let timeout = self.config.attempt_timeout;
                tracing::warn!(upload_id = %upload_id, attempt, ?timeout, "Import attempt timed out");
                let mut report = match store.get_upload(upload_id).await {
                    Ok(Some(upload)) => upload.import_report,
                    _ => String::new(),
                };
                report.push_str(&format!(
                    "Import timed out after {}s (attempt {attempt})\n",
                    timeout.as_secs_f64()
                ));
                if let Err(e) = store
                    .finish_upload(upload_id, UploadStatus::Fail, &report, 0, 0)
                    .await
                {
                    tracing::error!(upload_id = %upload_id, error = %e, "Could not record timeout");
                }
                AttemptOutcome::Failed { retryable: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogError, CatalogQuery, Cell, StaticCatalog};
    use crate::formats::irm::IRM_HEADERS;
    use crate::orchestrator::ImporterConfig;
    use crate::scope::{FinancialYear, ImportScope, Period, Sphere};
    use crate::store::{
        EntityStore, ImportKind, MemoryStore, NewEntity, NewUpload, UploadRecord, UploadStore,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FY: FinancialYear = FinancialYear::new(2023);

    /// Catalog that answers late and fails a set number of times first.
    struct ScriptedCatalog {
        failures_left: AtomicUsize,
        delay: Duration,
        inner: StaticCatalog,
    }

    impl ScriptedCatalog {
        fn new(failures: usize, delay: Duration) -> Self {
            let cell: Cell = serde_json::from_value(serde_json::json!({
                "id": "fy", "vocab_spheres": ["national"], "financial_year": "2023-24"
            }))
            .unwrap();
            Self {
                failures_left: AtomicUsize::new(failures),
                delay,
                inner: StaticCatalog::new(vec![cell]),
            }
        }
    }

    #[async_trait]
    impl CatalogClient for ScriptedCatalog {
        async fn search(&self, query: &CatalogQuery) -> Result<Vec<Cell>, CatalogError> {
            tokio::time::sleep(self.delay).await;
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(CatalogError::Api {
                    action: "package_search",
                    message: "service unavailable".to_string(),
                });
            }
            self.inner.search(query).await
        }

        async fn get(&self, id: &str) -> Result<Option<Cell>, CatalogError> {
            self.inner.get(id).await
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        runner: JobRunner<MemoryStore, ScriptedCatalog>,
        dir: tempfile::TempDir,
    }

    fn fast_config() -> JobConfig {
        JobConfig {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(10),
        }
    }

    async fn fixture(catalog: ScriptedCatalog, config: JobConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sa = store
            .create_entity(NewEntity::government(Sphere::National, FY, "South Africa"))
            .await
            .unwrap();
        store
            .create_entity(NewEntity::department(sa.id, "Public Works"))
            .await
            .unwrap();
        let importer = Importer::new(store.clone(), Arc::new(catalog), ImporterConfig::default());
        Fixture {
            store,
            runner: JobRunner::new(Arc::new(importer), config),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        async fn upload(&self, header_ok: bool, fy: Option<FinancialYear>) -> Uuid {
            let mut header = IRM_HEADERS.join(",");
            if !header_ok {
                header = header.replacen("Department", "Dept", 1);
            }
            let mut row = vec![String::new(); IRM_HEADERS.len()];
            row[0] = "42".to_string();
            row[2] = "Public Works".to_string();
            let path = self.dir.path().join(format!("{}.csv", Uuid::new_v4()));
            std::fs::write(&path, format!("{header}\n{}\n", row.join(","))).unwrap();

            self.store
                .create_upload(NewUpload {
                    kind: ImportKind::IrmSnapshot,
                    file_name: "upload.csv".to_string(),
                    file_path: path.to_string_lossy().to_string(),
                    content_hash: String::new(),
                    submitted_by: "tester".to_string(),
                    sphere: Sphere::National,
                    financial_year: fy,
                    period: Period::Quarter(2),
                })
                .await
                .unwrap()
                .id
        }

        async fn record(&self, id: Uuid) -> UploadRecord {
            self.store.get_upload(id).await.unwrap().unwrap()
        }
    }

    // -------------------------------------------------------------------------
    // OUTCOMES
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_successful_job_leaves_final_report() {
        let fx = fixture(ScriptedCatalog::new(0, Duration::ZERO), fast_config()).await;
        let id = fx.upload(true, Some(FY)).await;

        let handle = fx.runner.submit(id);
        assert_eq!(handle.upload_id(), id);
        assert_eq!(handle.wait().await, UploadStatus::Done);

        let record = fx.record(id).await;
        assert_eq!(record.status, UploadStatus::Done);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.num_imported, 1);
        assert_eq!(record.import_report, "1 of 1 rows imported, 0 not imported\n");
    }

    #[tokio::test]
    async fn test_header_error_is_not_retried() {
        let fx = fixture(ScriptedCatalog::new(0, Duration::ZERO), fast_config()).await;
        let id = fx.upload(false, Some(FY)).await;

        assert_eq!(fx.runner.submit(id).wait().await, UploadStatus::Fail);
        let record = fx.record(id).await;
        assert_eq!(record.attempts, 1);
        assert!(record.import_report.contains("header error"));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let fx = fixture(ScriptedCatalog::new(1, Duration::ZERO), fast_config()).await;
        let id = fx.upload(true, None).await;

        assert_eq!(fx.runner.submit(id).wait().await, UploadStatus::Done);
        let record = fx.record(id).await;
        assert_eq!(record.attempts, 2);
        // each attempt starts from a clean report
        assert!(!record.import_report.contains("service unavailable"));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let fx = fixture(ScriptedCatalog::new(100, Duration::ZERO), fast_config()).await;
        let id = fx.upload(true, None).await;

        assert_eq!(fx.runner.submit(id).wait().await, UploadStatus::Fail);
        let record = fx.record(id).await;
        assert_eq!(record.attempts, 3);
        assert!(record.import_report.contains("service unavailable"));
    }

    #[tokio::test]
    async fn test_attempt_timeout_fails_the_upload() {
        let config = JobConfig {
            max_attempts: 1,
            attempt_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let fx = fixture(ScriptedCatalog::new(0, Duration::from_secs(5)), config).await;
        let id = fx.upload(true, None).await;

        assert_eq!(fx.runner.submit(id).wait().await, UploadStatus::Fail);
        let record = fx.record(id).await;
        assert_eq!(record.status, UploadStatus::Fail);
        assert!(record.import_report.contains("timed out"));
    }

    // -------------------------------------------------------------------------
    // PROGRESS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_progress_lines_appear_while_running() {
        let fx = fixture(ScriptedCatalog::new(0, Duration::from_millis(400)), fast_config()).await;
        let id = fx.upload(true, None).await;

        let handle = fx.runner.submit(id);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let running = fx.record(id).await;
        assert_eq!(running.status, UploadStatus::Running);
        assert!(running.import_report.contains("transforming: 1/1 rows"));
        assert!(running.import_report.starts_with('['));

        assert_eq!(handle.wait().await, UploadStatus::Done);
        let done = fx.record(id).await;
        assert!(!done.import_report.contains("transforming"));
    }

    // -------------------------------------------------------------------------
    // SINGLE FLIGHT
    // -------------------------------------------------------------------------

    fn scope(fy: FinancialYear) -> ImportScope {
        ImportScope::new(Sphere::National, fy, Period::Quarter(2))
    }

    #[tokio::test]
    async fn test_jobs_wait_for_their_resolved_scope() {
        let fx = fixture(ScriptedCatalog::new(0, Duration::ZERO), fast_config()).await;
        let locks = fx.runner.importer.scope_locks().clone();
        let held = locks.acquire(ImportKind::IrmSnapshot, scope(FY)).await;

        // one upload names the year, the other gets the same year from the catalog
        let explicit = fx.runner.submit(fx.upload(true, Some(FY)).await);
        let from_catalog = fx.runner.submit(fx.upload(true, None).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!explicit.is_finished());
        assert!(!from_catalog.is_finished());
        assert_eq!(fx.store.snapshot_count().await, 0);

        drop(held);
        assert_eq!(explicit.wait().await, UploadStatus::Done);
        assert_eq!(from_catalog.wait().await, UploadStatus::Done);
        assert_eq!(fx.store.snapshot_count().await, 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_other_scopes_are_not_blocked() {
        let fx = fixture(ScriptedCatalog::new(0, Duration::ZERO), fast_config()).await;
        let locks = fx.runner.importer.scope_locks().clone();
        let _held = locks.acquire(ImportKind::IrmSnapshot, scope(FinancialYear::new(2022))).await;
        let _indicators = locks.acquire(ImportKind::Indicators, scope(FY)).await;

        let id = fx.upload(true, Some(FY)).await;
        assert_eq!(fx.runner.submit(id).wait().await, UploadStatus::Done);
        assert_eq!(locks.active(), 2);
    }

    // -------------------------------------------------------------------------
    // STALE CLAIMS
    // -------------------------------------------------------------------------

    #[test]
    fn test_stale_after_covers_every_attempt_and_backoff() {
        let config = JobConfig {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(900),
            progress_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(5),
        };
        // 3 x 900s of attempts plus 5s and 10s of backoff
        assert_eq!(config.stale_after(), Duration::from_secs(2715));

        let single = JobConfig {
            max_attempts: 0,
            ..config
        };
        assert_eq!(single.stale_after(), Duration::from_secs(900));
    }
}
