//! Importer Service - Imports queued spreadsheet uploads into snapshot tables
//!
//! Responsibilities:
//! - Validate IRM / EQPRS headers and normalise rows
//! - Reconcile government and department names against canonical entities
//! - Replace project snapshots for the upload's scope
//! - Record progress, counts and a report on the upload record
//!
//! Usage:
//!   # Import one upload now:
//!   cargo run --bin importer -- run --upload-id <uuid>
//!
//!   # Poll for queued uploads:
//!   cargo run --bin importer -- worker --concurrency 2
//!
//!   # Maintain canonical entities:
//!   cargo run --bin importer -- entity add-government --sphere national --financial-year 2023-24 --name "South Africa"

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use importer::catalog::{CatalogClient, CatalogError, CatalogQuery, Cell, CkanCatalog, StaticCatalog};
use importer::config::Config;
use importer::store::{EntityStore, NewEntity, PgStore, UploadStatus, UploadStore};
use importer::{FinancialYear, Importer, JobRunner, Sphere};

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports IRM and EQPRS uploads")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a single upload and wait for the result
    Run {
        /// Upload id (UUID)
        #[arg(long)]
        upload_id: String,
    },

    /// Claim and import queued uploads until interrupted
    Worker {
        /// Uploads imported at the same time
        #[arg(long, default_value = "1")]
        concurrency: usize,

        /// Exit once the queue is empty
        #[arg(long, default_value = "false")]
        once: bool,
    },

    /// Apply database migrations
    Migrate,

    /// Maintain canonical governments, departments, public entities,
    /// category groups and aliases
    Entity {
        #[command(subcommand)]
        action: EntityAction,
    },
}

#[derive(Subcommand, Debug)]
enum EntityAction {
    AddGovernment {
        #[arg(long)]
        sphere: Sphere,
        #[arg(long)]
        financial_year: FinancialYear,
        #[arg(long)]
        name: String,
    },
    AddDepartment {
        #[arg(long)]
        government_id: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        vote: Option<i32>,
        /// Department is the primary holder of its vote number
        #[arg(long, default_value = "false")]
        primary: bool,
    },
    AddPublicEntity {
        #[arg(long)]
        government_id: Uuid,
        #[arg(long)]
        name: String,
    },
    /// Category group such as a sector, per sphere and financial year
    AddCategoryGroup {
        #[arg(long)]
        sphere: Sphere,
        #[arg(long)]
        financial_year: FinancialYear,
        #[arg(long)]
        name: String,
    },
    AddAlias {
        #[arg(long)]
        entity_id: Uuid,
        #[arg(long)]
        alias: String,
    },
}

/// Live CKAN catalog, or none at all when CATALOG_URL is empty.
enum AppCatalog {
    Ckan(CkanCatalog),
    Offline(StaticCatalog),
}

#[async_trait]
impl CatalogClient for AppCatalog {
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<Cell>, CatalogError> {
        match self {
            AppCatalog::Ckan(c) => c.search(query).await,
            AppCatalog::Offline(c) => c.search(query).await,
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Cell>, CatalogError> {
        match self {
            AppCatalog::Ckan(c) => c.get(id).await,
            AppCatalog::Offline(c) => c.get(id).await,
        }
    }
}

fn build_runner(config: &Config, store: Arc<PgStore>) -> Result<JobRunner<PgStore, AppCatalog>> {
    let catalog = if config.catalog_url.trim().is_empty() {
        AppCatalog::Offline(StaticCatalog::empty())
    } else {
        AppCatalog::Ckan(CkanCatalog::new(&config.catalog_url).context("Failed to build catalog client")?)
    };
    let importer = Importer::new(store, Arc::new(catalog), config.importer());
    Ok(JobRunner::new(Arc::new(importer), config.job()))
}

async fn run_one(config: &Config, store: Arc<PgStore>, upload_id: &str) -> Result<()> {
    let upload_id: Uuid = upload_id.parse().context("Invalid upload_id UUID")?;
    let upload = store
        .get_upload(upload_id)
        .await?
        .context("Upload not found")?;

    println!("Upload ID: {}", upload.id);
    println!("File: {}", upload.file_name);
    println!("Kind: {}", upload.kind);
    println!(
        "Scope: {} {} {}",
        upload.sphere,
        upload
            .financial_year
            .map(|fy| fy.to_string())
            .unwrap_or_else(|| "(current)".to_string()),
        upload.period
    );
    println!("Status: {}", upload.status.as_str());

    if upload.status == UploadStatus::Running {
        anyhow::bail!("Upload is already being imported");
    }

    let runner = build_runner(config, store.clone())?;
    let status = runner.submit(upload_id).wait().await;

    let record = store
        .get_upload(upload_id)
        .await?
        .context("Upload disappeared during import")?;

    println!("\n=== Import Report ===");
    print!("{}", record.import_report);
    println!("\n=== Import Summary ===");
    println!("Status: {}", status.as_str());
    println!("Attempts: {}", record.attempts);
    println!("Imported: {}", record.num_imported);
    println!("Not imported: {}", record.num_not_imported);

    if status != UploadStatus::Done {
        anyhow::bail!("Import failed");
    }
    Ok(())
}

async fn run_worker(config: &Config, store: Arc<PgStore>, concurrency: usize, once: bool) -> Result<()> {
    let runner = build_runner(config, store.clone())?;
    let concurrency = concurrency.max(1);
    let mut running: JoinSet<(Uuid, UploadStatus)> = JoinSet::new();

    // running uploads quiet for longer than a whole job were orphaned by a dead worker
    let stale_after = config.job().stale_after();

    println!("Concurrency: {}", concurrency);
    println!("Poll interval: {:?}", config.worker_poll);
    println!("Reclaim running uploads after: {:?}", stale_after);

    let mut done = 0usize;
    let mut failed = 0usize;

    loop {
        // Fill free slots from the queue
        while running.len() < concurrency {
            let Some(upload_id) = store.claim_next_queued(stale_after).await? else {
                break;
            };
            println!("  → Claimed upload {}", upload_id);
            let handle = runner.submit(upload_id);
            running.spawn(async move { (upload_id, handle.wait().await) });
        }

        if once && running.is_empty() {
            break;
        }

        tokio::select! {
            Some(joined) = running.join_next(), if !running.is_empty() => {
                match joined {
                    Ok((upload_id, UploadStatus::Done)) => {
                        println!("  ✓ Imported {}", upload_id);
                        done += 1;
                    }
                    Ok((upload_id, status)) => {
                        eprintln!("  ✗ Upload {} ended as {}", upload_id, status.as_str());
                        failed += 1;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Worker task panicked");
                        failed += 1;
                    }
                }
            }
            _ = tokio::time::sleep(config.worker_poll), if running.len() < concurrency => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutdown requested, waiting for {} running import(s)...", running.len());
                while let Some(joined) = running.join_next().await {
                    if let Ok((upload_id, status)) = joined {
                        println!("  {} {}", upload_id, status.as_str());
                    }
                }
                break;
            }
        }
    }

    println!("\n=== Worker Summary ===");
    println!("Imported: {}", done);
    println!("Failed: {}", failed);
    Ok(())
}

async fn run_entity(store: &PgStore, action: EntityAction) -> Result<()> {
    match action {
        EntityAction::AddGovernment {
            sphere,
            financial_year,
            name,
        } => {
            let entity = store
                .create_entity(NewEntity::government(sphere, financial_year, name.trim()))
                .await?;
            println!("Government: {} ({})", entity.name, entity.id);
        }
        EntityAction::AddDepartment {
            government_id,
            name,
            vote,
            primary,
        } => {
            let mut new = NewEntity::department(government_id, name.trim());
            if let Some(vote) = vote {
                new = new.with_vote(vote, primary);
            }
            let entity = store.create_entity(new).await?;
            println!("Department: {} ({})", entity.name, entity.id);
        }
        EntityAction::AddPublicEntity { government_id, name } => {
            let entity = store
                .create_entity(NewEntity::public_entity(government_id, name.trim()))
                .await?;
            println!("Public entity: {} ({})", entity.name, entity.id);
        }
        EntityAction::AddCategoryGroup {
            sphere,
            financial_year,
            name,
        } => {
            let entity = store
                .create_entity(NewEntity::category_group(sphere, financial_year, name.trim()))
                .await?;
            println!("Category group: {} ({})", entity.name, entity.id);
        }
        EntityAction::AddAlias { entity_id, alias } => {
            store.create_alias(entity_id, &alias).await?;
            println!("Alias \"{}\" → {}", alias.trim(), entity_id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("importer=info,info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Budget Portal Importer ===");

    let store = Arc::new(
        PgStore::connect(&config.db_url, 5)
            .await
            .context("Failed to connect to database")?,
    );

    match args.command {
        Command::Run { upload_id } => run_one(&config, store, &upload_id).await?,
        Command::Worker { concurrency, once } => run_worker(&config, store, concurrency, once).await?,
        Command::Migrate => {
            store.migrate().await.context("Failed to apply migrations")?;
            println!("Migrations applied");
        }
        Command::Entity { action } => run_entity(&store, action).await?,
    }

    Ok(())
}
