//! In-memory store for tests and local dry runs
//!
//! Mirrors the uniqueness rules of the Postgres schema: one entity per
//! `(kind, scope, name)`, one project per `(kind, external_id)`, one snapshot
//! per `(project, scope)`. Ordered maps keep iteration deterministic.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Entity, EntityKind, EntityScope, EntityStore, ImportKind, NewEntity, NewSnapshot, NewUpload,
    Project, Snapshot, SnapshotStore, StoreError, StoredSnapshot, UploadRecord, UploadStatus,
    UploadStore,
};
use crate::reconcile::slugify;
use crate::scope::ImportScope;

#[derive(Default)]
struct State {
    /// insertion order is creation order
    entities: Vec<Entity>,
    aliases: Vec<(Uuid, String)>,
    projects: BTreeMap<(ImportKind, String), Project>,
    snapshots: BTreeMap<(Uuid, ImportScope), Snapshot>,
    uploads: HashMap<Uuid, UploadRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn project_count(&self, kind: ImportKind) -> usize {
        self.state
            .read()
            .await
            .projects
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.state.read().await.snapshots.len()
    }

    /// Force a status, e.g. to simulate a worker dying mid-run.
    pub async fn set_status(&self, id: Uuid, status: UploadStatus) {
        if let Some(upload) = self.state.write().await.uploads.get_mut(&id) {
            upload.status = status;
        }
    }
}

fn find_entity<'a>(
    state: &'a State,
    kind: EntityKind,
    scope: &EntityScope,
    pred: impl Fn(&Entity) -> bool,
) -> Option<&'a Entity> {
    state
        .entities
        .iter()
        .find(|e| e.kind == kind && &e.scope == scope && pred(e))
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_by_exact_name(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        name: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let state = self.state.read().await;
        Ok(find_entity(&state, kind, scope, |e| e.name == name).cloned())
    }

    async fn find_by_slug(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        slug: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let state = self.state.read().await;
        Ok(find_entity(&state, kind, scope, |e| e.slug == slug).cloned())
    }

    async fn find_primary_by_vote(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        vote_number: i32,
    ) -> Result<Option<Entity>, StoreError> {
        let state = self.state.read().await;
        Ok(find_entity(&state, kind, scope, |e| {
            e.is_vote_primary && e.vote_number == Some(vote_number)
        })
        .cloned())
    }

    async fn find_by_alias(
        &self,
        kind: EntityKind,
        scope: &EntityScope,
        alias: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let state = self.state.read().await;
        let hit = state
            .aliases
            .iter()
            .filter(|(_, a)| a == alias)
            .find_map(|(id, _)| find_entity(&state, kind, scope, |e| e.id == *id));
        Ok(hit.cloned())
    }

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError> {
        let mut state = self.state.write().await;
        let slug = slugify(&entity.name);
        // same name, or a spelling that slugs the same, is the same entity
        if let Some(existing) = find_entity(&state, entity.kind, &entity.scope, |e| {
            e.name == entity.name || e.slug == slug
        }) {
            return Ok(existing.clone());
        }
        let created = Entity {
            id: Uuid::new_v4(),
            kind: entity.kind,
            scope: entity.scope,
            slug,
            name: entity.name,
            vote_number: entity.vote_number,
            is_vote_primary: entity.is_vote_primary,
        };
        state.entities.push(created.clone());
        Ok(created)
    }

    async fn create_alias(&self, entity_id: Uuid, alias: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.entities.iter().any(|e| e.id == entity_id) {
            return Err(StoreError::NotFound(format!("entity {entity_id}")));
        }
        state.aliases.push((entity_id, alias.trim().to_string()));
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn put_snapshot(
        &self,
        kind: ImportKind,
        external_id: &str,
        snapshot: NewSnapshot,
    ) -> Result<StoredSnapshot, StoreError> {
        let mut state = self.state.write().await;
        let project_key = (kind, external_id.to_string());
        let (project_id, project_created) = match state.projects.get(&project_key) {
            Some(project) => (project.id, false),
            None => {
                let project = Project {
                    id: Uuid::new_v4(),
                    kind,
                    external_id: external_id.to_string(),
                    created_at: Utc::now(),
                };
                let id = project.id;
                state.projects.insert(project_key, project);
                (id, true)
            }
        };

        let key = (project_id, snapshot.scope);
        let snapshot_id = state.snapshots.get(&key).map_or_else(Uuid::new_v4, |s| s.id);
        state.snapshots.insert(
            key,
            Snapshot {
                id: snapshot_id,
                project_id,
                scope: snapshot.scope,
                upload_id: snapshot.upload_id,
                government_id: snapshot.government_id,
                department_id: snapshot.department_id,
                category_id: snapshot.category_id,
                name: snapshot.name,
                payload: snapshot.payload,
                updated_at: Utc::now(),
            },
        );
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
        let mut state = self.state.write().await;
        let of_kind: Vec<Uuid> = state
            .projects
            .values()
            .filter(|p| p.kind == kind)
            .map(|p| p.id)
            .collect();

        let mut removed = Vec::new();
        state.snapshots.retain(|(project_id, s), _| {
            let superseded = s == scope && of_kind.contains(project_id) && !keep.contains(project_id);
            if superseded {
                removed.push(*project_id);
            }
            !superseded
        });
        Ok(removed)
    }

    async fn delete_orphan_projects(
        &self,
        kind: ImportKind,
        candidates: &[Uuid],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let State {
            projects, snapshots, ..
        } = &mut *state;

        let before = projects.len();
        projects.retain(|(k, _), p| {
            *k != kind
                || !candidates.contains(&p.id)
                || snapshots.keys().any(|(pid, _)| *pid == p.id)
        });
        Ok((before - projects.len()) as u64)
    }

    async fn snapshots_in_scope(
        &self,
        kind: ImportKind,
        scope: &ImportScope,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.state.read().await;
        let mut out: Vec<(String, Snapshot)> = state
            .snapshots
            .values()
            .filter(|s| &s.scope == scope)
            .filter_map(|s| {
                state
                    .projects
                    .values()
                    .find(|p| p.id == s.project_id && p.kind == kind)
                    .map(|p| (p.external_id.clone(), s.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, s)| s).collect())
    }

    async fn latest_snapshot(&self, project_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .values()
            .filter(|s| s.project_id == project_id)
            .max_by_key(|s| s.scope)
            .cloned())
    }

    async fn find_project(
        &self,
        kind: ImportKind,
        external_id: &str,
    ) -> Result<Option<Project>, StoreError> {
        let state = self.state.read().await;
        Ok(state.projects.get(&(kind, external_id.to_string())).cloned())
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn create_upload(&self, upload: NewUpload) -> Result<UploadRecord, StoreError> {
        let now = Utc::now();
        let record = UploadRecord {
            id: Uuid::new_v4(),
            kind: upload.kind,
            file_name: upload.file_name,
            file_path: upload.file_path,
            content_hash: upload.content_hash,
            submitted_by: upload.submitted_by,
            sphere: upload.sphere,
            financial_year: upload.financial_year,
            period: upload.period,
            status: UploadStatus::Queued,
            import_report: String::new(),
            num_imported: 0,
            num_not_imported: 0,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        self.state
            .write()
            .await
            .uploads
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_upload(&self, id: Uuid) -> Result<Option<UploadRecord>, StoreError> {
        Ok(self.state.read().await.uploads.get(&id).cloned())
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let upload = state
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        upload.status = UploadStatus::Running;
        upload.import_report.clear();
        upload.attempts += 1;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn append_report(&self, id: Uuid, line: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let upload = state
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        upload.import_report.push_str(line);
        upload.import_report.push('\n');
        upload.updated_at = Utc::now();
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
        let mut state = self.state.write().await;
        let upload = state
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        upload.status = status;
        upload.import_report = report.to_string();
        upload.num_imported = num_imported;
        upload.num_not_imported = num_not_imported;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_next_queued(&self, stale_after: Duration) -> Result<Option<Uuid>, StoreError> {
        let mut state = self.state.write().await;
        let stale_before = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        let next = state
            .uploads
            .values()
            .filter(|u| match u.status {
                UploadStatus::Queued => true,
                UploadStatus::Running => stale_before.is_some_and(|t| u.updated_at <= t),
                _ => false,
            })
            .min_by_key(|u| (u.created_at, u.id))
            .map(|u| u.id);
        if let Some(id) = next {
            if let Some(upload) = state.uploads.get_mut(&id) {
                upload.status = UploadStatus::Running;
                upload.updated_at = Utc::now();
            }
        }
        Ok(next)
    }
}
