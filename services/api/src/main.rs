//! API Service - Read API for imported snapshots and upload records
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /uploads - List upload records
//! - GET /uploads/:id - One upload with its import report
//! - POST /uploads/:id/reimport - Queue an upload for another import
//! - GET /projects/:kind/:external_id - Project with its latest snapshot
//! - GET /projects/:kind/:external_id/snapshots - Snapshot history, latest first
//! - GET /snapshots - All snapshots of one kind in one scope

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use importer::store::{PgStore, SnapshotStore, UploadStore};
use importer::{FinancialYear, ImportKind, ImportScope, Period, Sphere, UploadStatus};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    store: PgStore,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct UploadSummary {
    upload_id: Uuid,
    kind: String,
    file_name: String,
    submitted_by: String,
    sphere: String,
    financial_year: Option<String>,
    period: String,
    status: String,
    num_imported: i32,
    num_not_imported: i32,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize, sqlx::FromRow)]
struct SnapshotResponse {
    snapshot_id: Uuid,
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

#[derive(Serialize)]
struct ReimportResponse {
    upload_id: Uuid,
    status: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct UploadsQuery {
    status: Option<String>,
    kind: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct ScopeQuery {
    kind: String,
    sphere: Sphere,
    financial_year: FinancialYear,
    period: Period,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(100).clamp(1, 1000)
}

fn parse_kind(kind: &str) -> Result<ImportKind, Response> {
    ImportKind::from_str(kind).map_err(|e| error_response(StatusCode::BAD_REQUEST, e))
}

/// What a reimport request gets when the conditional requeue matched nothing.
fn requeue_refused(current: Option<UploadStatus>) -> Response {
    match current {
        None => error_response(StatusCode::NOT_FOUND, "Upload not found"),
        Some(UploadStatus::Running) => {
            error_response(StatusCode::CONFLICT, "Upload is being imported")
        }
        Some(status) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Upload could not be queued from status {}", status.as_str()),
        ),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn uploads_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadsQuery>,
) -> impl IntoResponse {
    let status = match params.status.as_deref().map(UploadStatus::from_str).transpose() {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let kind = match params.kind.as_deref().map(parse_kind).transpose() {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    let mut query = String::from(
        r#"
        SELECT upload_id, kind, file_name, submitted_by, sphere, financial_year, period,
               status, num_imported, num_not_imported, attempts, created_at, updated_at
        FROM upload_records
        WHERE 1=1
        "#,
    );

    let mut idx = 1;
    if status.is_some() {
        query.push_str(&format!(" AND status = ${}", idx));
        idx += 1;
    }
    if kind.is_some() {
        query.push_str(&format!(" AND kind = ${}", idx));
        idx += 1;
    }
    query.push_str(&format!(" ORDER BY created_at DESC LIMIT ${}", idx));

    let mut q = sqlx::query_as::<_, UploadSummary>(&query);
    if let Some(status) = status {
        q = q.bind(status.as_str());
    }
    if let Some(kind) = kind {
        q = q.bind(kind.as_str());
    }
    q = q.bind(clamp_limit(params.limit));

    match q.fetch_all(state.store.pool()).await {
        Ok(uploads) => Json(serde_json::json!({ "uploads": uploads })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.get_upload(upload_id).await {
        Ok(Some(upload)) => Json(upload).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Upload not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn reimport_handler(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<Uuid>,
) -> impl IntoResponse {
    // Conditional so a worker claiming the row in between is never overwritten
    let requeued: Result<Option<(Uuid,)>, _> = sqlx::query_as(
        r#"
        UPDATE upload_records
        SET status = 'queued', updated_at = now()
        WHERE upload_id = $1 AND status <> 'running'
        RETURNING upload_id
        "#,
    )
    .bind(upload_id)
    .fetch_optional(state.store.pool())
    .await;

    match requeued {
        Ok(Some(_)) => {
            tracing::info!(upload_id = %upload_id, "upload queued for reimport");
            (
                StatusCode::ACCEPTED,
                Json(ReimportResponse {
                    upload_id,
                    status: UploadStatus::Queued.as_str(),
                }),
            )
                .into_response()
        }
        Ok(None) => match state.store.get_upload(upload_id).await {
            Ok(current) => requeue_refused(current.map(|u| u.status)),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        },
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn project_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, external_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    let project = match state.store.find_project(kind, &external_id).await {
        Ok(Some(p)) => p,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Project not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    match state.store.latest_snapshot(project.id).await {
        Ok(latest) => Json(serde_json::json!({
            "project": project,
            "latest": latest,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn project_snapshots_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, external_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    let snapshots: Result<Vec<SnapshotResponse>, _> = sqlx::query_as(
        r#"
        SELECT s.snapshot_id, s.sphere, s.financial_year, s.period, s.upload_id,
               s.government_id, s.department_id, s.category_id, s.name, s.payload, s.updated_at
        FROM snapshots s
        JOIN projects p ON p.project_id = s.project_id
        WHERE p.kind = $1 AND p.external_id = $2
        ORDER BY s.fy_start DESC, s.period_rank DESC, s.sphere DESC
        "#,
    )
    .bind(kind.as_str())
    .bind(&external_id)
    .fetch_all(state.store.pool())
    .await;

    match snapshots {
        Ok(s) if s.is_empty() => error_response(StatusCode::NOT_FOUND, "Project not found"),
        Ok(s) => Json(serde_json::json!({
            "kind": kind,
            "external_id": external_id,
            "snapshots": s,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn scope_snapshots_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ScopeQuery>,
) -> impl IntoResponse {
    let kind = match parse_kind(&params.kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let scope = ImportScope::new(params.sphere, params.financial_year, params.period);

    match state.store.snapshots_in_scope(kind, &scope).await {
        Ok(snapshots) => Json(serde_json::json!({
            "kind": kind,
            "scope": scope,
            "snapshots": snapshots,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("api=info,info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Budget Portal API ===");
    println!("Connecting to database...");

    let store = PgStore::connect(&db_url, 10)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { store });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/uploads", get(uploads_handler))
        .route("/uploads/:id", get(upload_handler))
        .route("/uploads/:id/reimport", post(reimport_handler))
        .route("/projects/:kind/:external_id", get(project_handler))
        .route("/projects/:kind/:external_id/snapshots", get(project_snapshots_handler))
        .route("/snapshots", get(scope_snapshots_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET  /health");
    println!("  GET  /uploads?status=&kind=&limit=");
    println!("  GET  /uploads/:id");
    println!("  POST /uploads/:id/reimport");
    println!("  GET  /projects/:kind/:external_id");
    println!("  GET  /projects/:kind/:external_id/snapshots");
    println!("  GET  /snapshots?kind=&sphere=&financial_year=&period=");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
