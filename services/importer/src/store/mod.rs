//! Persistence seams of the import pipeline
//!
//! Three traits split the store by concern: canonical entities (read by the
//! reconciler), projects and their snapshots (written by the orchestrator),
//! and upload records (written by the orchestrator and the job runner).
//! `PgStore` backs all three with Postgres, `MemoryStore` keeps them in memory.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::scope::{FinancialYear, ImportScope, Period, Sphere};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Store failures. These are I/O problems, never "no such row".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Government,
    Department,
    /// Grouping such as a sector; lives beside governments
    CategoryGroup,
    /// Agency reporting under a government in place of a department
    PublicEntity,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Government => "government",
            EntityKind::Department => "department",
            EntityKind::CategoryGroup => "category_group",
            EntityKind::PublicEntity => "public_entity",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Government => "Government",
            EntityKind::Department => "Department",
            EntityKind::CategoryGroup => "Category group",
            EntityKind::PublicEntity => "Public entity",
        }
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "government" => Ok(EntityKind::Government),
            "department" => Ok(EntityKind::Department),
            "category_group" => Ok(EntityKind::CategoryGroup),
            "public_entity" => Ok(EntityKind::PublicEntity),
            other => Err(StoreError::Corrupt(format!("entity kind '{other}'"))),
        }
    }
}

/// Parent context an entity's name is unique within.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityScope {
    /// Governments and category groups live in a sphere of one financial year
    Sphere {
        sphere: Sphere,
        financial_year: FinancialYear,
    },
    /// Departments and public entities live in a government
    Government(Uuid),
}

impl EntityScope {
    /// Stable text form used as the scope column in storage.
    pub fn key(&self) -> String {
        match self {
            EntityScope::Sphere {
                sphere,
                financial_year,
            } => format!("sphere:{sphere}:{financial_year}"),
            EntityScope::Government(id) => format!("government:{id}"),
        }
    }

    pub fn parse_key(key: &str) -> Result<Self, StoreError> {
        let corrupt = || StoreError::Corrupt(format!("entity scope '{key}'"));
        match key.split(':').collect::<Vec<_>>().as_slice() {
            ["sphere", sphere, fy] => Ok(EntityScope::Sphere {
                sphere: sphere.parse().map_err(|_| corrupt())?,
                financial_year: fy.parse().map_err(|_| corrupt())?,
            }),
            ["government", id] => Ok(EntityScope::Government(id.parse().map_err(|_| corrupt())?)),
            _ => Err(corrupt()),
        }
    }
}

impl fmt::Display for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Canonical government, department, category group or public entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: Uuid,
    pub kind: EntityKind,
    pub scope: EntityScope,
    pub name: String,
    pub slug: String,
    pub vote_number: Option<i32>,
    pub is_vote_primary: bool,
}

#[derive(Debug, Clone)]
pub struct NewEntity {
    pub kind: EntityKind,
    pub scope: EntityScope,
    pub name: String,
    pub vote_number: Option<i32>,
    pub is_vote_primary: bool,
}

impl NewEntity {
    pub fn government(sphere: Sphere, financial_year: FinancialYear, name: &str) -> Self {
        Self {
            kind: EntityKind::Government,
            scope: EntityScope::Sphere {
                sphere,
                financial_year,
            },
            name: name.to_string(),
            vote_number: None,
            is_vote_primary: false,
        }
    }

    pub fn department(government_id: Uuid, name: &str) -> Self {
        Self {
            kind: EntityKind::Department,
            scope: EntityScope::Government(government_id),
            name: name.to_string(),
            vote_number: None,
            is_vote_primary: false,
        }
    }

    pub fn category_group(sphere: Sphere, financial_year: FinancialYear, name: &str) -> Self {
        Self {
            kind: EntityKind::CategoryGroup,
            ..Self::government(sphere, financial_year, name)
        }
    }

    pub fn public_entity(government_id: Uuid, name: &str) -> Self {
        Self {
            kind: EntityKind::PublicEntity,
            ..Self::department(government_id, name)
        }
    }

    pub fn with_vote(mut self, vote_number: i32, is_vote_primary: bool) -> Self {
        self.vote_number = Some(vote_number);
        self.is_vote_primary = is_vote_primary;
        self
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_by_exact_name(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        name: &str,
    ) -> Result<Option<Entity>, StoreError>;

    async fn find_by_slug(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        slug: &str,
    ) -> Result<Option<Entity>, StoreError>;

    /// The department flagged as primary for a vote number.
    async fn find_primary_by_vote(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        vote_number: i32,
    ) -> Result<Option<Entity>, StoreError>;

    async fn find_by_alias(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        alias: &str,
    ) -> Result<Option<Entity>, StoreError>;

    /// Administrative creation; the pipeline never calls this.
    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError>;

    async fn create_alias(&self, entity_id: Uuid, alias: &str) -> Result<(), StoreError>;
}

// =============================================================================
// Projects and snapshots
// =============================================================================

/// Which pipeline an upload feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImportKind {
    /// Infrastructure Reporting Model project snapshot
    #[serde(rename = "irm_snapshot")]
    IrmSnapshot,
    /// EQPRS performance indicator report
    #[serde(rename = "eqprs_indicators")]
    Indicators,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::IrmSnapshot => "irm_snapshot",
            ImportKind::Indicators => "eqprs_indicators",
        }
    }
}

impl fmt::Display for ImportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "irm_snapshot" | "irm" => Ok(ImportKind::IrmSnapshot),
            "eqprs_indicators" | "eqprs" | "indicators" => Ok(ImportKind::Indicators),
            other => Err(format!("unknown import kind '{other}'")),
        }
    }
}

/// Parent container keyed by an external, immutable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub kind: ImportKind,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

/// State of one project as reported in one scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub project_id: Uuid,
    pub scope: ImportScope,
    pub upload_id: Uuid,
    pub government_id: Option<Uuid>,
    /// Owning department, or the public entity reporting in its place
    pub department_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub name: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub scope: ImportScope,
    pub upload_id: Uuid,
    pub government_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub name: String,
    pub payload: serde_json::Value,
}

/// Outcome of `put_snapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub project_id: Uuid,
    pub snapshot_id: Uuid,
    pub project_created: bool,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Get or create the project `(kind, external_id)` and insert or replace
    /// its snapshot at `snapshot.scope`, as one atomic step. A project is
    /// never visible without a snapshot to a concurrent orphan sweep.
    async fn put_snapshot(
        &self,
        kind: ImportKind,
        external_id: &str,
        snapshot: NewSnapshot,
    ) -> Result<StoredSnapshot, StoreError>;

    /// Delete snapshots of `kind` in `scope` whose project is not in `keep`.
    /// Returns the projects that lost a snapshot.
    async fn delete_superseded(
        &self,
        kind: ImportKind,
        scope: &ImportScope,
        keep: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Delete those `candidates` of `kind` that have no snapshots left.
    /// Childless projects outside `candidates` are left alone.
    async fn delete_orphan_projects(
        &self,
        kind: ImportKind,
        candidates: &[Uuid],
    ) -> Result<u64, StoreError>;

    async fn snapshots_in_scope(
        &self,
        kind: ImportKind,
        scope: &ImportScope,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Chronologically latest snapshot of a project.
    async fn latest_snapshot(&self, project_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    async fn find_project(
        &self,
        kind: ImportKind,
        external_id: &str,
    ) -> Result<Option<Project>, StoreError>;
}

// =============================================================================
// Upload records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Running,
    Done,
    Fail,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Running => "running",
            UploadStatus::Done => "done",
            UploadStatus::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Done | UploadStatus::Fail)
    }
}

impl FromStr for UploadStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(UploadStatus::Queued),
            "running" => Ok(UploadStatus::Running),
            "done" => Ok(UploadStatus::Done),
            "fail" => Ok(UploadStatus::Fail),
            other => Err(StoreError::Corrupt(format!("upload status '{other}'"))),
        }
    }
}

/// One import attempt of an uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub kind: ImportKind,
    pub file_name: String,
    pub file_path: String,
    pub content_hash: String,
    pub submitted_by: String,
    pub sphere: Sphere,
    /// `None` means "current financial year", resolved through the catalog
    pub financial_year: Option<FinancialYear>,
    pub period: Period,
    pub status: UploadStatus,
    pub import_report: String,
    pub num_imported: i32,
    pub num_not_imported: i32,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub kind: ImportKind,
    pub file_name: String,
    pub file_path: String,
    pub content_hash: String,
    pub submitted_by: String,
    pub sphere: Sphere,
    pub financial_year: Option<FinancialYear>,
    pub period: Period,
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn create_upload(&self, upload: NewUpload) -> Result<UploadRecord, StoreError>;

    async fn get_upload(&self, id: Uuid) -> Result<Option<UploadRecord>, StoreError>;

    /// Mark running, clear the report and bump the attempt counter.
    async fn begin_attempt(&self, id: Uuid) -> Result<(), StoreError>;

    async fn append_report(&self, id: Uuid, line: &str) -> Result<(), StoreError>;

    /// Write the terminal status, the full report and the row counts.
    async fn finish_upload(
        &self,
        id: Uuid,
        status: UploadStatus,
        report: &str,
        num_imported: i32,
        num_not_imported: i32,
    ) -> Result<(), StoreError>;

    /// Atomically move the oldest claimable upload to running. Claimable is
    /// `queued`, or `running` without an update for at least `stale_after`
    /// (its worker died).
    async fn claim_next_queued(&self, stale_after: Duration) -> Result<Option<Uuid>, StoreError>;
}

/// Everything the pipeline needs from persistence.
pub trait Store: EntityStore + SnapshotStore + UploadStore {}

impl<T: EntityStore + SnapshotStore + UploadStore> Store for T {}
