//! Postgres-backed store
//!
//! Plain runtime queries against the schema in `migrations/`. Every write is
//! its own statement, except the orphan sweep which locks before deleting;
//! the pipeline never holds a transaction across rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::{
    Entity, EntityKind, EntityScope, EntityStore, ImportKind, NewEntity, NewSnapshot, NewUpload,
    Project, Snapshot, SnapshotStore, StoreError, StoredSnapshot, UploadRecord, UploadStatus,
    UploadStore,
};
use crate::reconcile::slugify;
use crate::scope::{ImportScope, Period};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))
    }
}

/// Sort key of a period inside its financial year
fn period_rank(period: &Period) -> i16 {
    match period {
        Period::Quarter(q) => i16::from(*q),
        Period::Annual => 5,
    }
}

fn corrupt<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> StoreError {
    move |e| StoreError::Corrupt(format!("{what}: {e}"))
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    entity_id: Uuid,
    kind: String,
    scope_key: String,
    name: String,
    slug: String,
    vote_number: Option<i32>,
    is_vote_primary: bool,
}

impl TryFrom<EntityRow> for Entity {
    type Error = StoreError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        Ok(Entity {
            id: row.entity_id,
            kind: row.kind.parse()?,
            scope: EntityScope::parse_key(&row.scope_key)?,
            name: row.name,
            slug: row.slug,
            vote_number: row.vote_number,
            is_vote_primary: row.is_vote_primary,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectRow {
    project_id: Uuid,
    kind: String,
    external_id: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ProjectRow> for Project {
    type Error = StoreError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(Project {
            id: row.project_id,
            kind: row.kind.parse().map_err(corrupt::<String>("project kind"))?,
            external_id: row.external_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    snapshot_id: Uuid,
    project_id: Uuid,
    sphere: String,
    financial_year: String,
    period: String,
    upload_id: Uuid,
    government_id: Option<Uuid>,
    department_id: Option<Uuid>,
    category_id: Option<Uuid>,
    name: String,
    payload: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let scope = ImportScope::new(
            row.sphere.parse().map_err(corrupt("snapshot sphere"))?,
            row.financial_year.parse().map_err(corrupt("snapshot financial year"))?,
            row.period.parse().map_err(corrupt("snapshot period"))?,
        );
        Ok(Snapshot {
            id: row.snapshot_id,
            project_id: row.project_id,
            scope,
            upload_id: row.upload_id,
            government_id: row.government_id,
            department_id: row.department_id,
            category_id: row.category_id,
            name: row.name,
            payload: row.payload,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UploadRow {
    upload_id: Uuid,
    kind: String,
    file_name: String,
    file_path: String,
    content_hash: String,
    submitted_by: String,
    sphere: String,
    financial_year: Option<String>,
    period: String,
    status: String,
    import_report: String,
    num_imported: i32,
    num_not_imported: i32,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UploadRow> for UploadRecord {
    type Error = StoreError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        Ok(UploadRecord {
            id: row.upload_id,
            kind: row.kind.parse().map_err(corrupt::<String>("upload kind"))?,
            file_name: row.file_name,
            file_path: row.file_path,
            content_hash: row.content_hash,
            submitted_by: row.submitted_by,
            sphere: row.sphere.parse().map_err(corrupt("upload sphere"))?,
            financial_year: row
                .financial_year
                .map(|fy| fy.parse())
                .transpose()
                .map_err(corrupt("upload financial year"))?,
            period: row.period.parse().map_err(corrupt("upload period"))?,
            status: row.status.parse()?,
            import_report: row.import_report,
            num_imported: row.num_imported,
            num_not_imported: row.num_not_imported,
            attempts: row.attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ENTITY_COLUMNS: &str =
    "e.entity_id, e.kind, e.scope_key, e.name, e.slug, e.vote_number, e.is_vote_primary";

const SNAPSHOT_COLUMNS: &str = "s.snapshot_id, s.project_id, s.sphere, s.financial_year, s.period, \
     s.upload_id, s.government_id, s.department_id, s.category_id, s.name, s.payload, s.updated_at";

const UPLOAD_COLUMNS: &str = "upload_id, kind, file_name, file_path, content_hash, submitted_by, \
     sphere, financial_year, period, status, import_report, num_imported, num_not_imported, \
     attempts, created_at, updated_at";

impl PgStore {
    async fn find_entity_where(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        condition: &str,
        value: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e \
             WHERE e.kind = $1 AND e.scope_key = $2 AND {condition} \
             ORDER BY e.created_at, e.entity_id LIMIT 1"
        );
        let row: Option<EntityRow> = sqlx::query_as(&sql)
            .bind(kind.as_str())
            .bind(scope.key())
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Entity::try_from).transpose()
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn find_by_exact_name(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        name: &str,
    ) -> Result<Option<Entity>, StoreError> {
        self.find_entity_where(kind, scope, "e.name = $3", name).await
    }

    async fn find_by_slug(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        slug: &str,
    ) -> Result<Option<Entity>, StoreError> {
        self.find_entity_where(kind, scope, "e.slug = $3", slug).await
    }

    async fn find_primary_by_vote(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        vote_number: i32,
    ) -> Result<Option<Entity>, StoreError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e \
             WHERE e.kind = $1 AND e.scope_key = $2 AND e.is_vote_primary AND e.vote_number = $3 \
             ORDER BY e.created_at, e.entity_id LIMIT 1"
        );
        let row: Option<EntityRow> = sqlx::query_as(&sql)
            .bind(kind.as_str())
            .bind(scope.key())
            .bind(vote_number)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Entity::try_from).transpose()
    }

    async fn find_by_alias(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        alias: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e \
             JOIN entity_aliases a ON a.entity_id = e.entity_id \
             WHERE e.kind = $1 AND e.scope_key = $2 AND a.alias = $3 \
             ORDER BY e.created_at, e.entity_id LIMIT 1"
        );
        let row: Option<EntityRow> = sqlx::query_as(&sql)
            .bind(kind.as_str())
            .bind(scope.key())
            .bind(alias)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Entity::try_from).transpose()
    }

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError> {
        let slug = slugify(&entity.name);
        sqlx::query(
            r#"
            INSERT INTO entities (entity_id, kind, scope_key, name, slug, vote_number, is_vote_primary)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity.kind.as_str())
        .bind(entity.scope.key())
        .bind(&entity.name)
        .bind(&slug)
        .bind(entity.vote_number)
        .bind(entity.is_vote_primary)
        .execute(&self.pool)
        .await?;

        // Either unique key may have been hit: same name, or a spelling that
        // slugs the same ("health" for "Health"). Both mean the same entity.
        if let Some(existing) = self
            .find_by_exact_name(entity.kind, &entity.scope, &entity.name)
            .await?
        {
            return Ok(existing);
        }
        self.find_by_slug(entity.kind, &entity.scope, &slug)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("entity '{}'", entity.name)))
    }

    async fn create_alias(&self, entity_id: Uuid, alias: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO entity_aliases (alias_id, entity_id, alias) VALUES ($1, $2, $3) \
             ON CONFLICT (entity_id, alias) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(entity_id)
        .bind(alias.trim())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn put_snapshot(
        &self,
        kind: ImportKind,
        external_id: &str,
        snapshot: NewSnapshot,
    ) -> Result<StoredSnapshot, StoreError> {
        // DO UPDATE (not DO NOTHING) so the project row is locked and returned
        // even when it already exists; a concurrent orphan sweep waits for us.
        // xmax = 0 only on a freshly inserted row.
        let (project_id, snapshot_id, project_created): (Uuid, Uuid, bool) = sqlx::query_as(
            r#"
            WITH p AS (
                INSERT INTO projects (project_id, kind, external_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (kind, external_id) DO UPDATE SET kind = EXCLUDED.kind
                RETURNING project_id, (xmax = 0) AS created
            ), s AS (
                INSERT INTO snapshots
                    (snapshot_id, project_id, sphere, financial_year, fy_start, period, period_rank,
                     upload_id, government_id, department_id, category_id, name, payload)
                SELECT $4, p.project_id, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15 FROM p
                ON CONFLICT (project_id, sphere, financial_year, period) DO UPDATE SET
                    upload_id = EXCLUDED.upload_id,
                    government_id = EXCLUDED.government_id,
                    department_id = EXCLUDED.department_id,
                    category_id = EXCLUDED.category_id,
                    name = EXCLUDED.name,
                    payload = EXCLUDED.payload,
                    updated_at = now()
                RETURNING snapshot_id
            )
            SELECT p.project_id, s.snapshot_id, p.created FROM p, s
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(external_id)
        .bind(Uuid::new_v4())
        .bind(snapshot.scope.sphere.as_str())
        .bind(snapshot.scope.financial_year.to_string())
        .bind(snapshot.scope.financial_year.start_year())
        .bind(snapshot.scope.period.to_string())
        .bind(period_rank(&snapshot.scope.period))
        .bind(snapshot.upload_id)
        .bind(snapshot.government_id)
        .bind(snapshot.department_id)
        .bind(snapshot.category_id)
        .bind(&snapshot.name)
        .bind(&snapshot.payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredSnapshot {
            project_id,
            snapshot_id,
            project_created,
        })
    }

    async fn delete_superseded(
        &self,
        kind: ImportKind,
        scope: &ImportScope,
        keep: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        let removed: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            DELETE FROM snapshots s
            USING projects p
            WHERE s.project_id = p.project_id
              AND p.kind = $1
              AND s.sphere = $2
              AND s.financial_year = $3
              AND s.period = $4
              AND NOT (s.project_id = ANY($5))
            RETURNING s.project_id
            "#,
        )
        .bind(kind.as_str())
        .bind(scope.sphere.as_str())
        .bind(scope.financial_year.to_string())
        .bind(scope.period.to_string())
        .bind(keep)
        .fetch_all(&self.pool)
        .await?;
        Ok(removed.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_orphan_projects(
        &self,
        kind: ImportKind,
        candidates: &[Uuid],
    ) -> Result<u64, StoreError> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        // Lock first: the DELETE below then runs on a fresh snapshot and sees
        // any snapshot a concurrent `put_snapshot` committed meanwhile.
        sqlx::query(
            "SELECT project_id FROM projects WHERE kind = $1 AND project_id = ANY($2) \
             ORDER BY project_id FOR UPDATE",
        )
        .bind(kind.as_str())
        .bind(candidates)
        .fetch_all(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM projects p
            WHERE p.kind = $1
              AND p.project_id = ANY($2)
              AND NOT EXISTS (SELECT 1 FROM snapshots s WHERE s.project_id = p.project_id)
            "#,
        )
        .bind(kind.as_str())
        .bind(candidates)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn snapshots_in_scope(
        &self,
        kind: ImportKind,
        scope: &ImportScope,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots s \
             JOIN projects p ON p.project_id = s.project_id \
             WHERE p.kind = $1 AND s.sphere = $2 AND s.financial_year = $3 AND s.period = $4 \
             ORDER BY p.external_id"
        );
        let rows: Vec<SnapshotRow> = sqlx::query_as(&sql)
            .bind(kind.as_str())
            .bind(scope.sphere.as_str())
            .bind(scope.financial_year.to_string())
            .bind(scope.period.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Snapshot::try_from).collect()
    }

    async fn latest_snapshot(&self, project_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots s \
             WHERE s.project_id = $1 \
             ORDER BY s.fy_start DESC, s.period_rank DESC, s.sphere DESC \
             LIMIT 1"
        );
        let row: Option<SnapshotRow> = sqlx::query_as(&sql)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Snapshot::try_from).transpose()
    }

    async fn find_project(
        &self,
        kind: ImportKind,
        external_id: &str,
    ) -> Result<Option<Project>, StoreError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT project_id, kind, external_id, created_at FROM projects \
             WHERE kind = $1 AND external_id = $2",
        )
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Project::try_from).transpose()
    }
}

#[async_trait]
impl UploadStore for PgStore {
    async fn create_upload(&self, upload: NewUpload) -> Result<UploadRecord, StoreError> {
        let sql = format!(
            "INSERT INTO upload_records \
             (upload_id, kind, file_name, file_path, content_hash, submitted_by, sphere, financial_year, period) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {UPLOAD_COLUMNS}"
        );
        let row: UploadRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(upload.kind.as_str())
            .bind(&upload.file_name)
            .bind(&upload.file_path)
            .bind(&upload.content_hash)
            .bind(&upload.submitted_by)
            .bind(upload.sphere.as_str())
            .bind(upload.financial_year.map(|fy| fy.to_string()))
            .bind(upload.period.to_string())
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_upload(&self, id: Uuid) -> Result<Option<UploadRecord>, StoreError> {
        let sql = format!("SELECT {UPLOAD_COLUMNS} FROM upload_records WHERE upload_id = $1");
        let row: Option<UploadRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(UploadRecord::try_from).transpose()
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_records
            SET status = 'running', import_report = '', attempts = attempts + 1, updated_at = now()
            WHERE upload_id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("upload {id}")));
        }
        Ok(())
    }

    async fn append_report(&self, id: Uuid, line: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE upload_records SET import_report = import_report || $2 || E'\\n', updated_at = now() \
             WHERE upload_id = $1",
        )
        .bind(id)
        .bind(line)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_upload(
        &self,
        id: Uuid,
        status: UploadStatus,
        report: &str,
        num_imported: i32,
        num_not_imported: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE upload_records
            SET status = $2, import_report = $3, num_imported = $4, num_not_imported = $5, updated_at = now()
            WHERE upload_id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(report)
        .bind(num_imported)
        .bind(num_not_imported)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_next_queued(&self, stale_after: Duration) -> Result<Option<Uuid>, StoreError> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE upload_records
            SET status = 'running', updated_at = now()
            WHERE upload_id = (
                SELECT upload_id FROM upload_records
                WHERE status = 'queued'
                   OR (status = 'running' AND updated_at <= now() - $1 * INTERVAL '1 second')
                ORDER BY created_at, upload_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING upload_id
            "#,
        )
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.map(|(id,)| id))
    }
}
