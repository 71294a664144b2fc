//! Import pipeline for IRM project snapshots and EQPRS indicator reports
//!
//! Uploaded spreadsheets go through header validation (`header`), row
//! normalisation (`rows`, `collapse`, `formats`), entity reconciliation
//! (`reconcile`) and a replace-by-scope upsert (`orchestrator`). `job` wraps
//! the orchestrator in retried background tasks that report progress onto the
//! upload record.
//!
//! CRITICAL: imports must be DETERMINISTIC and IDEMPOTENT.
//! Same file + same scope + same entity table = same snapshots and report.

pub mod catalog;
pub mod collapse;
pub mod config;
pub mod formats;
pub mod header;
pub mod job;
pub mod orchestrator;
pub mod reconcile;
pub mod rows;
pub mod scope;
pub mod store;

pub use catalog::{CatalogClient, CkanCatalog, StaticCatalog};
pub use job::{JobConfig, JobHandle, JobRunner};
pub use orchestrator::{ImportError, ImportSummary, Importer, ImporterConfig, Progress, Stage};
pub use scope::{FinancialYear, ImportScope, Period, Sphere};
pub use store::{ImportKind, MemoryStore, PgStore, UploadStatus};
