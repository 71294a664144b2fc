//! Uploader Service - Registers IRM / EQPRS spreadsheets for import
//!
//! Responsibilities:
//! - Read a spreadsheet from disk or download it from a URL
//! - Hash the content and store the raw file under RAW_FS_DIR
//! - Skip files already waiting for import in the same scope
//! - Register a queued upload record for the importer worker
//!
//! Usage:
//!   # Local file:
//!   cargo run --bin uploader -- --file irm_q2.xlsx --kind irm --sphere provincial --financial-year 2023-24 --period Q2 --user analyst
//!
//!   # Download first:
//!   cargo run --bin uploader -- --url https://.../eqprs.csv --kind eqprs --sphere national --period annual --user analyst

use anyhow::{Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use importer::config::Config;
use importer::rows::is_workbook;
use importer::store::{NewUpload, PgStore, UploadStore};
use importer::{FinancialYear, ImportKind, Period, Sphere};

#[derive(Parser, Debug)]
#[command(name = "uploader", about = "Registers spreadsheet uploads for import")]
struct Args {
    /// Spreadsheet on disk (.xlsx, .xls, .ods or .csv)
    #[arg(long, conflicts_with = "url", required_unless_present = "url")]
    file: Option<PathBuf>,

    /// Spreadsheet to download
    #[arg(long)]
    url: Option<String>,

    /// Pipeline the file feeds (irm or eqprs)
    #[arg(long)]
    kind: ImportKind,

    /// national or provincial
    #[arg(long)]
    sphere: Sphere,

    /// Financial year, e.g. 2023-24. Omit for the current year.
    #[arg(long)]
    financial_year: Option<FinancialYear>,

    /// Q1..Q4 or annual
    #[arg(long)]
    period: Period,

    /// Who submitted the file
    #[arg(long, env = "UPLOAD_USER")]
    user: String,

    /// Register even if the same file is already waiting
    #[arg(long, default_value = "false")]
    force: bool,

    /// Dry run - don't save anything
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

/// Spreadsheet bytes plus the name they were submitted under.
struct Submitted {
    file_name: String,
    bytes: Vec<u8>,
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

fn is_supported(file_name: &str) -> bool {
    let path = Path::new(file_name);
    is_workbook(path)
        || path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

/// Name of the stored copy: hash prefix plus the submitted name with
/// anything outside [A-Za-z0-9._-] replaced.
fn stored_file_name(content_hash: &str, file_name: &str) -> String {
    let hex = content_hash.trim_start_matches("sha256:");
    let prefix = &hex[..hex.len().min(16)];
    let safe: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", prefix, safe)
}

/// Last path segment of a URL, without query string.
fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.trim_end_matches('/').rsplit('/').next()?;
    (!name.is_empty() && name.contains('.')).then(|| name.to_string())
}

async fn read_file(path: &Path) -> Result<Submitted> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("File has no name")?
        .to_string();
    Ok(Submitted { file_name, bytes })
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Submitted> {
    println!("  Fetching: {}", url);
    let resp = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .context("HTTP request failed")?;
    let bytes = resp.bytes().await?.to_vec();
    let file_name = file_name_from_url(url).context("URL does not end in a file name")?;
    Ok(Submitted { file_name, bytes })
}

/// Upload already queued or running for the same file and scope
async fn check_existing_upload(pool: &PgPool, hash: &str, args: &Args) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT upload_id FROM upload_records
        WHERE content_hash = $1 AND kind = $2 AND sphere = $3
          AND financial_year IS NOT DISTINCT FROM $4 AND period = $5
          AND status IN ('queued', 'running')
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(hash)
    .bind(args.kind.as_str())
    .bind(args.sphere.as_str())
    .bind(args.financial_year.map(|fy| fy.to_string()))
    .bind(args.period.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.0))
}

/// Save the raw file to the filesystem
async fn save_to_fs(dir: &Path, stored_name: &str, bytes: &[u8]) -> Result<String> {
    fs::create_dir_all(dir).await?;

    let path = dir.join(stored_name);
    fs::write(&path, bytes).await?;

    Ok(path.to_string_lossy().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uploader=info,info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Budget Portal Uploader ===");

    let submitted = match (&args.file, &args.url) {
        (Some(path), _) => read_file(path).await?,
        (None, Some(url)) => {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .user_agent("BudgetPortalUploader/1.0")
                .build()?;
            download(&client, url).await?
        }
        (None, None) => anyhow::bail!("Either --file or --url is required"),
    };

    if !is_supported(&submitted.file_name) {
        anyhow::bail!(
            "Unsupported file type: {} (expected .xlsx, .xls, .xlsm, .xlsb, .ods or .csv)",
            submitted.file_name
        );
    }

    let hash = content_hash(&submitted.bytes);
    println!("  File: {} ({} bytes)", submitted.file_name, submitted.bytes.len());
    println!("  Hash: {}", hash);
    println!(
        "  Scope: {} {} {} {}",
        args.kind,
        args.sphere,
        args.financial_year
            .map(|fy| fy.to_string())
            .unwrap_or_else(|| "(current)".to_string()),
        args.period
    );

    let store = PgStore::connect(&config.db_url, 2)
        .await
        .context("Failed to connect to database")?;

    if !args.force {
        if let Some(existing_id) = check_existing_upload(store.pool(), &hash, &args).await? {
            println!("  Upload already waiting for import: {}", existing_id);
            return Ok(());
        }
    }

    let stored_name = stored_file_name(&hash, &submitted.file_name);
    if args.dry_run {
        println!("  Dry run - would store {} and queue an upload", stored_name);
        return Ok(());
    }

    let file_path = save_to_fs(&config.raw_fs_dir, &stored_name, &submitted.bytes).await?;
    println!("  Saved to: {}", file_path);

    let upload = store
        .create_upload(NewUpload {
            kind: args.kind,
            file_name: submitted.file_name,
            file_path,
            content_hash: hash,
            submitted_by: args.user.clone(),
            sphere: args.sphere,
            financial_year: args.financial_year,
            period: args.period,
        })
        .await
        .context("Failed to register upload")?;

    tracing::info!(upload_id = %upload.id, kind = %upload.kind, "upload queued");
    println!("  ✓ Upload queued: {}", upload.id);
    println!("\nImport now with: cargo run --bin importer -- run --upload-id {}", upload.id);

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_format() {
        let hash = content_hash(b"abc");
        assert_eq!(
            hash,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported("irm.xlsx"));
        assert!(is_supported("IRM.XLS"));
        assert!(is_supported("eqprs.csv"));
        assert!(!is_supported("report.pdf"));
        assert!(!is_supported("noext"));
    }

    #[test]
    fn test_stored_file_name_is_safe() {
        let name = stored_file_name("sha256:0123456789abcdef0123", "Q2 report (final).xlsx");
        assert_eq!(name, "0123456789abcdef-Q2_report__final_.xlsx");
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://example.org/files/irm_q1.xlsx?download=1"),
            Some("irm_q1.xlsx".to_string())
        );
        assert_eq!(file_name_from_url("https://example.org/files/"), None);
    }

    #[tokio::test]
    async fn test_read_file_keeps_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eqprs.csv");
        std::fs::write(&path, "Government,Department\n").unwrap();

        let submitted = read_file(&path).await.unwrap();
        assert_eq!(submitted.file_name, "eqprs.csv");
        assert_eq!(submitted.bytes, b"Government,Department\n");
    }

    #[tokio::test]
    async fn test_save_to_fs_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_to_fs(&dir.path().join("raw"), "abc-irm.xlsx", b"data")
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"data");
    }
}
