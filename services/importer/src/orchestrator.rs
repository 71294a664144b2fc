//! Snapshot import orchestration
//!
//! Runs one upload through the pipeline:
//!
//! ```text
//! Received -> Validating -> Transforming -> Reconciling -> Upserting -> Done
//!                  \______________\_______________\_____________\____-> Failed
//! ```
//!
//! - Validating: read the first sheet, check the header contract
//! - Transforming: drop empty rows, collapse party columns, type the row
//! - Reconciling: resolve the scope, lock it, then resolve government,
//!   department (or public entity) and category group for every row
//! - Upserting: put one snapshot per (project, scope) together with its
//!   parent project, drop snapshots this file no longer carries, collect the
//!   projects that lost their last snapshot
//!
//! The report written to the upload is rebuilt from scratch on every run and
//! contains no timestamps, so re-running an import yields the same text.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::catalog::{latest_financial_year, CatalogClient, CatalogError};
use crate::formats::eqprs::EqprsFormat;
use crate::formats::irm::IrmFormat;
use crate::formats::SnapshotFormat;
use crate::header::{validate_headers, InputFormatError};
use crate::reconcile::{Reconciler, Resolution};
use crate::rows::{filter_empty_rows, read_sheet};
use crate::scope::ImportScope;
use crate::store::{
    EntityKind, EntityScope, ImportKind, NewSnapshot, Store, StoreError, UploadRecord,
    UploadStatus,
};

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Validating,
    Transforming,
    Reconciling,
    Upserting,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validating => "validating",
            Stage::Transforming => "transforming",
            Stage::Reconciling => "reconciling",
            Stage::Upserting => "upserting",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub rows_done: usize,
    pub rows_total: usize,
}

impl Progress {
    pub fn at(stage: Stage) -> Self {
        Self {
            stage,
            rows_done: 0,
            rows_total: 0,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::at(Stage::Received)
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rows_total == 0 {
            f.write_str(self.stage.as_str())
        } else {
            write!(f, "{}: {}/{} rows", self.stage.as_str(), self.rows_done, self.rows_total)
        }
    }
}

pub fn progress_channel() -> (watch::Sender<Progress>, watch::Receiver<Progress>) {
    watch::channel(Progress::default())
}

fn publish(progress: &watch::Sender<Progress>, stage: Stage, rows_done: usize, rows_total: usize) {
    progress.send_replace(Progress {
        stage,
        rows_done,
        rows_total,
    });
}

// =============================================================================
// Errors and results
// =============================================================================

/// File-level failures. Row-level problems never show up here.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("upload {0} not found")]
    UploadNotFound(Uuid),

    #[error("cannot read {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("header error: {0}")]
    InputFormat(#[from] InputFormatError),

    #[error("scope conflict: {0}")]
    ScopeConflict(String),

    #[error("{expected} non-empty rows read but {transformed} transformed and {rejected} rejected")]
    RowLoss {
        expected: usize,
        transformed: usize,
        rejected: usize,
    },

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ImportError {
    /// Whether running the same upload again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ImportError::Transient(_))
    }
}

impl From<StoreError> for ImportError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(_) => ImportError::Transient(err.to_string()),
            other => ImportError::Internal(other.to_string()),
        }
    }
}

impl From<CatalogError> for ImportError {
    fn from(err: CatalogError) -> Self {
        if err.is_transient() {
            ImportError::Transient(err.to_string())
        } else {
            ImportError::Internal(err.to_string())
        }
    }
}

/// Line-oriented report, one concern per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    lines: Vec<String>,
}

impl ImportReport {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub upload_id: Uuid,
    pub kind: ImportKind,
    pub scope: ImportScope,
    pub imported: usize,
    pub not_imported: usize,
    pub unresolved_names: usize,
    pub projects_created: usize,
    pub superseded_removed: u64,
    pub orphans_removed: u64,
}

#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Government every national-sphere row belongs to
    pub national_government: String,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            national_government: "South Africa".to_string(),
        }
    }
}

/// Name that failed to reconcile, with where we looked for it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MissKey {
    kind: EntityKind,
    within: String,
    name: String,
}

impl MissKey {
    fn line(&self, rows: usize) -> String {
        let noun = if rows == 1 { "row" } else { "rows" };
        format!(
            "{} \"{}\" not found in {} ({} {})",
            self.kind.label(),
            self.name,
            self.within,
            rows,
            noun
        )
    }
}

struct ResolvedRow<R> {
    line: usize,
    row: R,
    government_id: Uuid,
    department_id: Uuid,
    category_id: Option<Uuid>,
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

// =============================================================================
// Scope locks
// =============================================================================

type ScopeKey = (ImportKind, ImportScope);

/// One async mutex per kind and resolved scope.
///
/// An entry lives only while a guard for it is held or awaited, so a
/// long-running worker does not accumulate one per scope it ever saw.
#[derive(Clone, Default)]
pub struct ScopeLocks {
    entries: Arc<std::sync::Mutex<HashMap<ScopeKey, Arc<Mutex<()>>>>>,
}

impl ScopeLocks {
    /// Wait until no other import of this kind and scope holds the lock.
    pub async fn acquire(&self, kind: ImportKind, scope: ImportScope) -> ScopeGuard {
        let key = (kind, scope);
        let lock = {
            let mut entries = self.entries();
            entries.entry(key).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        ScopeGuard {
            locks: self.clone(),
            key,
            guard: Some(guard),
        }
    }

    /// Scopes currently locked or waited on.
    pub fn active(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ScopeKey, Arc<Mutex<()>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ScopeGuard {
    locks: ScopeLocks,
    key: ScopeKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut entries = self.locks.entries();
        // the map's own reference is the last one: nobody holds or waits
        if entries.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            entries.remove(&self.key);
        }
    }
}

// =============================================================================
// Importer
// =============================================================================

/// Imports uploads into the snapshot tables.
///
/// Store and catalog are injected; nothing here reads process-wide state.
pub struct Importer<S, C> {
    store: Arc<S>,
    catalog: Arc<C>,
    config: ImporterConfig,
    scope_locks: ScopeLocks,
}

impl<S: Store, C: CatalogClient> Importer<S, C> {
    pub fn new(store: Arc<S>, catalog: Arc<C>, config: ImporterConfig) -> Self {
        Self {
            store,
            catalog,
            config,
            scope_locks: ScopeLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn scope_locks(&self) -> &ScopeLocks {
        &self.scope_locks
    }

    /// Import one upload and write the outcome onto its record.
    ///
    /// The record ends up `done` or `fail` either way; the error is returned
    /// so the caller can decide whether to retry.
    pub async fn run(
        &self,
        upload_id: Uuid,
        progress: &watch::Sender<Progress>,
    ) -> Result<ImportSummary, ImportError> {
        publish(progress, Stage::Received, 0, 0);
        let upload = self
            .store
            .get_upload(upload_id)
            .await?
            .ok_or(ImportError::UploadNotFound(upload_id))?;

        tracing::info!(
            upload_id = %upload.id,
            kind = %upload.kind,
            file = %upload.file_name,
            "Starting import"
        );

        let mut report = ImportReport::default();
        let outcome = match upload.kind {
            ImportKind::IrmSnapshot => self.import(&IrmFormat, &upload, progress, &mut report).await,
            ImportKind::Indicators => self.import(&EqprsFormat, &upload, progress, &mut report).await,
        };

        match outcome {
            Ok(summary) => {
                self.store
                    .finish_upload(
                        upload_id,
                        UploadStatus::Done,
                        &report.render(),
                        count(summary.imported),
                        count(summary.not_imported),
                    )
                    .await?;
                publish(progress, Stage::Done, summary.imported, summary.imported + summary.not_imported);
                tracing::info!(
                    upload_id = %upload_id,
                    scope = %summary.scope,
                    imported = summary.imported,
                    not_imported = summary.not_imported,
                    "Import done"
                );
                Ok(summary)
            }
            Err(err) => {
                report.push(format!("Import failed: {err}"));
                tracing::warn!(upload_id = %upload_id, error = %err, "Import failed");
                if let Err(store_err) = self
                    .store
                    .finish_upload(upload_id, UploadStatus::Fail, &report.render(), 0, 0)
                    .await
                {
                    tracing::error!(upload_id = %upload_id, error = %store_err, "Could not record failed import");
                }
                publish(progress, Stage::Failed, 0, 0);
                Err(err)
            }
        }
    }

    async fn import<F: SnapshotFormat>(
        &self,
        format: &F,
        upload: &UploadRecord,
        progress: &watch::Sender<Progress>,
        report: &mut ImportReport,
    ) -> Result<ImportSummary, ImportError> {
        // ===== VALIDATING =====
        publish(progress, Stage::Validating, 0, 0);
        let path = PathBuf::from(&upload.file_path);
        let sheet = tokio::task::spawn_blocking(move || read_sheet(&path))
            .await
            .map_err(|e| ImportError::Internal(e.to_string()))?
            .map_err(|e| ImportError::Unreadable {
                path: upload.file_path.clone(),
                reason: format!("{e:#}"),
            })?;

        let layout = validate_headers(&sheet.headers, format.header_spec())?;
        tracing::debug!(
            columns = layout.width(),
            repeated = layout.repeated.len(),
            rows = sheet.rows.len(),
            "Header validated"
        );

        // ===== TRANSFORMING =====
        let non_empty = filter_empty_rows(&sheet.rows);
        let total = non_empty.len();
        let expected = sheet.rows.iter().filter(|r| !r.is_empty()).count();
        publish(progress, Stage::Transforming, 0, total);

        let mut parsed = Vec::with_capacity(total);
        let mut rejected = 0usize;
        for (idx, raw) in non_empty.iter().enumerate() {
            match format.parse_row(raw, &layout) {
                Ok(row) => parsed.push((raw.line, row)),
                Err(e) => {
                    report.push(format!("Row {}: {}", raw.line, e));
                    rejected += 1;
                }
            }
            publish(progress, Stage::Transforming, idx + 1, total);
        }

        check_row_accounting(expected, parsed.len(), rejected)?;
        let mut not_imported = rejected;

        // ===== RECONCILING =====
        let scope = self.resolve_scope(upload, report).await?;
        // held until the summary is built; imports of one scope never interleave
        let _scope_guard = self.scope_locks.acquire(upload.kind, scope).await;
        publish(progress, Stage::Reconciling, 0, total);

        let government_scope = EntityScope::Sphere {
            sphere: scope.sphere,
            financial_year: scope.financial_year,
        };
        let mut reconciler = Reconciler::new(self.store.as_ref());
        let mut misses: BTreeMap<MissKey, usize> = BTreeMap::new();
        let mut resolved = Vec::with_capacity(parsed.len());

        for (idx, (line, row)) in parsed.into_iter().enumerate() {
            publish(progress, Stage::Reconciling, rejected + idx, total);

            let refs = match format.entity_refs(&row, scope.sphere, &self.config.national_government) {
                Ok(refs) => refs,
                Err(e) => {
                    report.push(format!("Row {line}: {e}"));
                    not_imported += 1;
                    continue;
                }
            };

            let government = match reconciler
                .resolve(EntityKind::Government, &government_scope, &refs.government)
                .await?
            {
                Resolution::Found { entity, .. } => entity,
                Resolution::Missing(miss) => {
                    let key = MissKey {
                        kind: miss.kind,
                        within: format!("{} {}", scope.sphere, scope.financial_year),
                        name: miss.name,
                    };
                    *misses.entry(key).or_default() += 1;
                    not_imported += 1;
                    continue;
                }
            };

            // a public entity may stand where the department column expects a department
            let department_scope = EntityScope::Government(government.id);
            let department = match reconciler
                .resolve(EntityKind::Department, &department_scope, &refs.department)
                .await?
            {
                Resolution::Found { entity, .. } => entity,
                Resolution::Missing(miss) => match reconciler
                    .resolve(EntityKind::PublicEntity, &department_scope, &refs.department)
                    .await?
                {
                    Resolution::Found { entity, .. } => entity,
                    Resolution::Missing(_) => {
                        let key = MissKey {
                            kind: miss.kind,
                            within: format!("government \"{}\"", government.name),
                            name: miss.name,
                        };
                        *misses.entry(key).or_default() += 1;
                        not_imported += 1;
                        continue;
                    }
                },
            };

            let category_id = match &refs.category {
                None => None,
                Some(name) => match reconciler
                    .resolve(EntityKind::CategoryGroup, &government_scope, name)
                    .await?
                {
                    Resolution::Found { entity, .. } => Some(entity.id),
                    Resolution::Missing(miss) => {
                        let key = MissKey {
                            kind: miss.kind,
                            within: format!("{} {}", scope.sphere, scope.financial_year),
                            name: miss.name,
                        };
                        *misses.entry(key).or_default() += 1;
                        not_imported += 1;
                        continue;
                    }
                },
            };

            resolved.push(ResolvedRow {
                line,
                row,
                government_id: government.id,
                department_id: department.id,
                category_id,
            });
        }

        for (miss, rows) in &misses {
            report.push(miss.line(*rows));
        }
        if !misses.is_empty() {
            tracing::info!(unresolved = misses.len(), "Unresolved entity names");
        }

        // ===== UPSERTING =====
        // Duplicate parent keys: the last row in the file wins
        let mut slots: Vec<(String, ResolvedRow<F::Row>)> = Vec::with_capacity(resolved.len());
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for row in resolved {
            let key = format.parent_key(&row.row, row.department_id);
            match by_key.get(&key) {
                Some(&slot) => {
                    let earlier = &slots[slot].1;
                    report.push(format!(
                        "Row {}: \"{}\" appears again on row {}; the later row is imported",
                        earlier.line,
                        format.display_name(&earlier.row),
                        row.line
                    ));
                    not_imported += 1;
                    slots[slot].1 = row;
                }
                None => {
                    by_key.insert(key.clone(), slots.len());
                    slots.push((key, row));
                }
            }
        }

        let kind = format.kind();
        let upserts = slots.len();
        publish(progress, Stage::Upserting, 0, upserts);

        // Each put creates its project and snapshot together, so no project of
        // ours is ever childless while another scope's sweep runs
        let mut keep = Vec::with_capacity(upserts);
        let mut projects_created = 0usize;
        for (idx, (key, entry)) in slots.iter().enumerate() {
            let payload = serde_json::to_value(&entry.row)
                .map_err(|e| ImportError::Internal(format!("row {}: {e}", entry.line)))?;
            let stored = self
                .store
                .put_snapshot(
                    kind,
                    key,
                    NewSnapshot {
                        scope,
                        upload_id: upload.id,
                        government_id: Some(entry.government_id),
                        department_id: Some(entry.department_id),
                        category_id: entry.category_id,
                        name: format.display_name(&entry.row),
                        payload,
                    },
                )
                .await?;
            if stored.project_created {
                projects_created += 1;
                tracing::debug!(external_id = %key, "Created project");
            }
            keep.push(stored.project_id);
            publish(progress, Stage::Upserting, idx + 1, upserts);
        }

        let superseded = self.store.delete_superseded(kind, &scope, &keep).await?;
        let superseded_removed = superseded.len() as u64;
        let orphans_removed = self.store.delete_orphan_projects(kind, &superseded).await?;
        tracing::info!(
            scope = %scope,
            projects_created,
            superseded_removed,
            orphans_removed,
            "Snapshots replaced"
        );

        report.push(format!(
            "{upserts} of {total} rows imported, {not_imported} not imported"
        ));

        Ok(ImportSummary {
            upload_id: upload.id,
            kind,
            scope,
            imported: upserts,
            not_imported,
            unresolved_names: misses.len(),
            projects_created,
            superseded_removed,
            orphans_removed,
        })
    }

    /// Scope of an upload; a missing financial year comes from the catalog.
    async fn resolve_scope(
        &self,
        upload: &UploadRecord,
        report: &mut ImportReport,
    ) -> Result<ImportScope, ImportError> {
        let financial_year = match upload.financial_year {
            Some(fy) => fy,
            None => {
                let fy = latest_financial_year(self.catalog.as_ref(), upload.sphere)
                    .await?
                    .ok_or_else(|| {
                        ImportError::ScopeConflict(format!(
                            "no financial year given and the catalog lists none for the {} sphere",
                            upload.sphere
                        ))
                    })?;
                report.push(format!("Financial year {fy} taken from the catalog"));
                fy
            }
        };
        Ok(ImportScope::new(upload.sphere, financial_year, upload.period))
    }
}

/// Every non-empty row of the sheet must come out of the transform either as
/// a typed row or as a reported row error.
fn check_row_accounting(
    expected: usize,
    transformed: usize,
    rejected: usize,
) -> Result<(), ImportError> {
    if transformed + rejected == expected {
        Ok(())
    } else {
        Err(ImportError::RowLoss {
            expected,
            transformed,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Cell, StaticCatalog};
    use crate::formats::eqprs::EQPRS_HEADERS;
    use crate::formats::irm::{CONTRACTOR_MARKER, IRM_HEADERS};
    use crate::scope::{FinancialYear, Period, Sphere};
    use crate::store::{EntityStore, MemoryStore, NewEntity, NewUpload, SnapshotStore, UploadStore};
    use std::path::Path;

    const FY: FinancialYear = FinancialYear::new(2023);

    struct Fixture {
        store: Arc<MemoryStore>,
        importer: Importer<MemoryStore, StaticCatalog>,
        dir: tempfile::TempDir,
        national: Uuid,
        department_x: Uuid,
    }

    async fn fixture_with(catalog: StaticCatalog) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sa = store
            .create_entity(NewEntity::government(Sphere::National, FY, "South Africa"))
            .await
            .unwrap();
        let ec = store
            .create_entity(NewEntity::government(Sphere::Provincial, FY, "Eastern Cape"))
            .await
            .unwrap();
        store
            .create_entity(NewEntity::department(ec.id, "Health"))
            .await
            .unwrap();
        store
            .create_entity(NewEntity::department(sa.id, "Public Works").with_vote(13, true))
            .await
            .unwrap();
        let department_x = store
            .create_entity(NewEntity::department(sa.id, "Department X"))
            .await
            .unwrap()
            .id;

        let importer = Importer::new(store.clone(), Arc::new(catalog), ImporterConfig::default());
        Fixture {
            store,
            importer,
            dir: tempfile::tempdir().unwrap(),
            national: sa.id,
            department_x,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(StaticCatalog::empty()).await
    }

    fn irm_row(id: &str, department: &str, parties: &[&str]) -> String {
        let mut cells = vec![String::new(); IRM_HEADERS.len()];
        cells[0] = id.to_string();
        cells[1] = format!("Project {id}");
        cells[2] = department.to_string();
        cells[4] = "Gauteng".to_string();
        cells.extend(parties.iter().map(|p| p.to_string()));
        cells.join(",")
    }

    fn irm_row_in_sector(id: &str, department: &str, sector: &str) -> String {
        let mut cells: Vec<String> = irm_row(id, department, &[]).split(',').map(String::from).collect();
        cells[3] = sector.to_string();
        cells.join(",")
    }

    fn blank_row(width: usize) -> String {
        ",".repeat(width - 1)
    }

    fn irm_file(parties: usize, rows: &[String]) -> String {
        let mut header: Vec<&str> = IRM_HEADERS.to_vec();
        header.extend(std::iter::repeat(CONTRACTOR_MARKER).take(parties));
        let mut out = header.join(",");
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out.push('\n');
        out
    }

    impl Fixture {
        async fn upload(&self, name: &str, kind: ImportKind, content: &str, fy: Option<FinancialYear>) -> Uuid {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            self.store
                .create_upload(NewUpload {
                    kind,
                    file_name: name.to_string(),
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

        async fn run(&self, upload_id: Uuid) -> Result<ImportSummary, ImportError> {
            let (tx, _rx) = progress_channel();
            self.importer.run(upload_id, &tx).await
        }

        async fn record(&self, upload_id: Uuid) -> UploadRecord {
            self.store.get_upload(upload_id).await.unwrap().unwrap()
        }

        async fn latest(&self, external_id: &str) -> crate::store::Snapshot {
            let project = self
                .store
                .find_project(ImportKind::IrmSnapshot, external_id)
                .await
                .unwrap()
                .unwrap();
            self.store.latest_snapshot(project.id).await.unwrap().unwrap()
        }

        async fn payloads(&self) -> Vec<serde_json::Value> {
            let scope = ImportScope::new(Sphere::National, FY, Period::Quarter(2));
            self.store
                .snapshots_in_scope(ImportKind::IrmSnapshot, &scope)
                .await
                .unwrap()
                .into_iter()
                .map(|s| s.payload)
                .collect()
        }
    }

    // -------------------------------------------------------------------------
    // HAPPY PATH
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_import_collapses_parties_and_records_counts() {
        let fx = fixture().await;
        let file = irm_file(
            2,
            &[
                irm_row("42", "Public Works", &["Main Contractor: X", "Weird Label: Y"]),
                irm_row("43", "Vote 13", &[]),
            ],
        );
        let id = fx.upload("irm.csv", ImportKind::IrmSnapshot, &file, Some(FY)).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.not_imported, 0);
        assert_eq!(summary.projects_created, 2);

        let record = fx.record(id).await;
        assert_eq!(record.status, UploadStatus::Done);
        assert_eq!(record.num_imported, 2);
        assert_eq!(record.import_report, "2 of 2 rows imported, 0 not imported\n");

        let payloads = fx.payloads().await;
        assert_eq!(payloads[0]["project_id"], "42");
        assert_eq!(payloads[0]["main_contractor"], "X");
        assert_eq!(payloads[0]["other_parties"], "Weird Label: Y");
    }

    // -------------------------------------------------------------------------
    // EMPTY ROWS AND ROW ERRORS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_empty_rows_do_not_change_the_result() {
        let width = IRM_HEADERS.len() + 1;
        let plain = irm_file(1, &[irm_row("1", "Public Works", &[]), irm_row("2", "Public Works", &[])]);
        let padded = irm_file(
            1,
            &[
                blank_row(width),
                irm_row("1", "Public Works", &[]),
                blank_row(width),
                blank_row(width),
                irm_row("2", "Public Works", &[]),
                blank_row(width),
            ],
        );

        let a = fixture().await;
        let id = a.upload("plain.csv", ImportKind::IrmSnapshot, &plain, Some(FY)).await;
        let plain_summary = a.run(id).await.unwrap();

        let b = fixture().await;
        let id = b.upload("padded.csv", ImportKind::IrmSnapshot, &padded, Some(FY)).await;
        let padded_summary = b.run(id).await.unwrap();

        assert_eq!(plain_summary.imported, padded_summary.imported);
        assert_eq!(padded_summary.not_imported, 0);
        assert_eq!(a.payloads().await, b.payloads().await);
    }

    #[tokio::test]
    async fn test_bad_cell_excludes_only_that_row() {
        let fx = fixture().await;
        let mut bad = irm_row("2", "Public Works", &[]);
        bad = bad.replacen(",,,,,", ",,,not-a-number,,", 1);
        let file = irm_file(0, &[irm_row("1", "Public Works", &[]), bad]);
        let id = fx.upload("bad.csv", ImportKind::IrmSnapshot, &file, Some(FY)).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.not_imported, 1);
        let record = fx.record(id).await;
        assert!(record.import_report.starts_with("Row 3: "));
    }

    // -------------------------------------------------------------------------
    // RECONCILIATION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_department_of_other_government_is_reported_once() {
        let fx = fixture().await;
        let rows: Vec<String> = (1..=5).map(|i| irm_row(&i.to_string(), "Health", &[])).collect();
        let id = fx.upload("health.csv", ImportKind::IrmSnapshot, &irm_file(0, &rows), Some(FY)).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!(summary.imported, 0);
        assert_eq!(summary.not_imported, 5);
        assert_eq!(summary.unresolved_names, 1);

        let record = fx.record(id).await;
        let health_lines: Vec<&str> = record
            .import_report
            .lines()
            .filter(|l| l.contains("\"Health\""))
            .collect();
        assert_eq!(
            health_lines,
            vec!["Department \"Health\" not found in government \"South Africa\" (5 rows)"]
        );
        assert_eq!(fx.store.project_count(ImportKind::IrmSnapshot).await, 0);
    }

    #[tokio::test]
    async fn test_alias_resolves_department() {
        let fx = fixture().await;
        fx.store.create_alias(fx.department_x, "Health").await.unwrap();
        let rows = vec![irm_row("7", "Health", &[]), irm_row("8", "Health", &[])];
        let id = fx.upload("alias.csv", ImportKind::IrmSnapshot, &irm_file(0, &rows), Some(FY)).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!(summary.imported, 2);

        let scope = ImportScope::new(Sphere::National, FY, Period::Quarter(2));
        let snapshots = fx
            .store
            .snapshots_in_scope(ImportKind::IrmSnapshot, &scope)
            .await
            .unwrap();
        assert!(snapshots.iter().all(|s| s.department_id == Some(fx.department_x)));
    }

    #[tokio::test]
    async fn test_public_entity_stands_in_for_department() {
        let fx = fixture().await;
        let agency = fx
            .store
            .create_entity(NewEntity::public_entity(fx.national, "SANRAL"))
            .await
            .unwrap();
        let rows = vec![irm_row("9", "Sanral", &[]), irm_row("10", "Roads Agency", &[])];
        let id = fx.upload("agency.csv", ImportKind::IrmSnapshot, &irm_file(0, &rows), Some(FY)).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!((summary.imported, summary.not_imported), (1, 1));
        assert_eq!(fx.latest("9").await.department_id, Some(agency.id));
        // the miss is still reported against the department column
        assert!(fx
            .record(id)
            .await
            .import_report
            .contains("Department \"Roads Agency\" not found in government \"South Africa\" (1 row)"));
    }

    #[tokio::test]
    async fn test_sector_resolves_to_category_group() {
        let fx = fixture().await;
        let transport = fx
            .store
            .create_entity(NewEntity::category_group(Sphere::National, FY, "Transport"))
            .await
            .unwrap();
        let rows = vec![
            irm_row_in_sector("11", "Public Works", "transport"),
            irm_row_in_sector("12", "Public Works", "Water"),
            irm_row_in_sector("13", "Public Works", ""),
        ];
        let id = fx.upload("sector.csv", ImportKind::IrmSnapshot, &irm_file(0, &rows), Some(FY)).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!((summary.imported, summary.not_imported), (2, 1));
        assert_eq!(fx.latest("11").await.category_id, Some(transport.id));
        assert_eq!(fx.latest("13").await.category_id, None);
        assert!(fx
            .store
            .find_project(ImportKind::IrmSnapshot, "12")
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .record(id)
            .await
            .import_report
            .contains("Category group \"Water\" not found in national 2023-24 (1 row)"));
    }

    // -------------------------------------------------------------------------
    // IDEMPOTENCE AND REPLACEMENT
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_reimport_is_idempotent() {
        let fx = fixture().await;
        let rows = vec![
            irm_row("42", "Public Works", &["Principal Agent: PA"]),
            irm_row("43", "Health", &[]),
        ];
        let file = irm_file(1, &rows);
        let first = fx.upload("a.csv", ImportKind::IrmSnapshot, &file, Some(FY)).await;
        let second = fx.upload("b.csv", ImportKind::IrmSnapshot, &file, Some(FY)).await;

        let s1 = fx.run(first).await.unwrap();
        let payloads = fx.payloads().await;
        let s2 = fx.run(second).await.unwrap();

        assert_eq!((s1.imported, s1.not_imported), (s2.imported, s2.not_imported));
        assert_eq!(fx.store.snapshot_count().await, 1);
        assert_eq!(fx.payloads().await, payloads);
        assert_eq!(fx.record(first).await.import_report, fx.record(second).await.import_report);

        // running the very same upload again converges too
        fx.run(second).await.unwrap();
        assert_eq!(fx.store.snapshot_count().await, 1);
        let project = fx
            .store
            .find_project(ImportKind::IrmSnapshot, "42")
            .await
            .unwrap()
            .unwrap();
        let latest = fx.store.latest_snapshot(project.id).await.unwrap().unwrap();
        assert_eq!(latest.upload_id, second);
    }

    #[tokio::test]
    async fn test_reimport_drops_projects_missing_from_new_file() {
        let fx = fixture().await;
        let full = irm_file(0, &[irm_row("1", "Public Works", &[]), irm_row("2", "Public Works", &[])]);
        let partial = irm_file(0, &[irm_row("1", "Public Works", &[])]);

        let id = fx.upload("full.csv", ImportKind::IrmSnapshot, &full, Some(FY)).await;
        fx.run(id).await.unwrap();
        let id = fx.upload("partial.csv", ImportKind::IrmSnapshot, &partial, Some(FY)).await;
        let summary = fx.run(id).await.unwrap();

        assert_eq!(summary.superseded_removed, 1);
        assert_eq!(summary.orphans_removed, 1);
        assert_eq!(fx.store.project_count(ImportKind::IrmSnapshot).await, 1);
        assert!(fx
            .store
            .find_project(ImportKind::IrmSnapshot, "2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_project_id_keeps_last_row() {
        let fx = fixture().await;
        let mut later = irm_row("42", "Public Works", &[]);
        later = later.replacen("Project 42", "Renamed", 1);
        let file = irm_file(0, &[irm_row("42", "Public Works", &[]), later]);
        let id = fx.upload("dup.csv", ImportKind::IrmSnapshot, &file, Some(FY)).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.not_imported, 1);
        assert_eq!(fx.payloads().await[0]["project_name"], "Renamed");
        assert!(fx
            .record(id)
            .await
            .import_report
            .contains("Row 2: \"Project 42\" appears again on row 3"));
    }

    // -------------------------------------------------------------------------
    // FILE-LEVEL FAILURES
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_header_mismatch_fails_without_touching_rows() {
        let fx = fixture().await;
        let file = irm_file(0, &[irm_row("1", "Public Works", &[])]).replacen("Project Name", "Name", 1);
        let id = fx.upload("header.csv", ImportKind::IrmSnapshot, &file, Some(FY)).await;

        let err = fx.run(id).await.unwrap_err();
        assert!(matches!(err, ImportError::InputFormat(_)));
        assert!(!err.is_retryable());

        let record = fx.record(id).await;
        assert_eq!(record.status, UploadStatus::Fail);
        assert_eq!(record.import_report.lines().count(), 1);
        assert!(record.import_report.contains("column 2"));
        assert_eq!(fx.store.project_count(ImportKind::IrmSnapshot).await, 0);
    }

    #[tokio::test]
    async fn test_missing_financial_year_is_a_scope_conflict() {
        let fx = fixture().await;
        let file = irm_file(0, &[irm_row("1", "Public Works", &[])]);
        let id = fx.upload("nofy.csv", ImportKind::IrmSnapshot, &file, None).await;

        let err = fx.run(id).await.unwrap_err();
        assert!(matches!(err, ImportError::ScopeConflict(_)));
        assert_eq!(fx.record(id).await.status, UploadStatus::Fail);
    }

    #[tokio::test]
    async fn test_financial_year_from_catalog() {
        let cell: Cell = serde_json::from_value(serde_json::json!({
            "id": "national-2023",
            "vocab_spheres": ["national"],
            "financial_year": "2023-24"
        }))
        .unwrap();
        let fx = fixture_with(StaticCatalog::new(vec![cell])).await;
        let file = irm_file(0, &[irm_row("1", "Public Works", &[])]);
        let id = fx.upload("catalog.csv", ImportKind::IrmSnapshot, &file, None).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!(summary.scope.financial_year, FY);
        assert!(fx
            .record(id)
            .await
            .import_report
            .starts_with("Financial year 2023-24 taken from the catalog"));
    }

    #[tokio::test]
    async fn test_unknown_upload() {
        let fx = fixture().await;
        let err = fx.run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ImportError::UploadNotFound(_)));
    }

    #[tokio::test]
    async fn test_unreadable_file() {
        let fx = fixture().await;
        let id = fx.upload("gone.csv", ImportKind::IrmSnapshot, "", Some(FY)).await;
        let path = fx.record(id).await.file_path;
        std::fs::remove_file(Path::new(&path)).unwrap();

        let err = fx.run(id).await.unwrap_err();
        assert!(matches!(err, ImportError::Unreadable { .. }));
    }

    #[test]
    fn test_row_accounting_detects_lost_rows() {
        assert!(check_row_accounting(3, 2, 1).is_ok());
        assert!(check_row_accounting(0, 0, 0).is_ok());
        assert!(matches!(
            check_row_accounting(3, 1, 1),
            Err(ImportError::RowLoss {
                expected: 3,
                transformed: 1,
                rejected: 1
            })
        ));
    }

    // -------------------------------------------------------------------------
    // INDICATORS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_indicator_import() {
        let fx = fixture().await;
        let row = |department: &str, indicator: &str| {
            let mut cells = vec![String::new(); EQPRS_HEADERS.len()];
            cells[0] = "National".to_string();
            cells[1] = department.to_string();
            cells[4] = indicator.to_string();
            cells[15] = "10".to_string();
            cells.join(",")
        };
        let file = format!(
            "{}\n{}\n{}\n",
            EQPRS_HEADERS.join(","),
            row("Public Works", "Kilometres of road built"),
            row("Department X", "Kilometres of road built"),
        );
        let id = fx.upload("eqprs.csv", ImportKind::Indicators, &file, Some(FY)).await;

        let summary = fx.run(id).await.unwrap();
        assert_eq!(summary.kind, ImportKind::Indicators);
        // same indicator name under two departments is two parents
        assert_eq!(summary.imported, 2);
        assert_eq!(fx.store.project_count(ImportKind::Indicators).await, 2);

        let scope = ImportScope::new(Sphere::National, FY, Period::Quarter(2));
        let snapshots = fx
            .store
            .snapshots_in_scope(ImportKind::Indicators, &scope)
            .await
            .unwrap();
        assert_eq!(snapshots[0].payload["quarters"][1]["target"], "10");
    }
}
