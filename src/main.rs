//! Loan Pipeline - Main Entry Point
//!
//! Subcommands:
//! - `serve`: HTTP API, optional periodic reconciliation
//! - `reconcile` / `verify`: one-shot cross-store sync and consistency check
//! - `populate`: rebuild features, predictions and a snapshot in one store
//! - `train`: fit the logistic model on labelled applications
//! - `import`: load JSON-lines applications

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use loan_pipeline::api::{create_app, ApiState};
use loan_pipeline::config::{AppConfig, SyncSource};
use loan_pipeline::ml_engine::{train_and_save, PredictionEngine, TrainingConfig};
use loan_pipeline::service::LoanService;
use loan_pipeline::storage::{
    ApplicationFilter, Backend, DocumentStore, EntityKind, Page, RecordStore, RelationalStore,
};
use loan_pipeline::sync::{rebuild_derived, spawn_periodic_sync, SyncReconciler};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "loan-pipeline")]
#[command(about = "Loan application feature pipeline, prediction API and store synchronization")]
#[command(version)]
struct CliArgs {
    /// TOML config file (overrides LOAN_PIPELINE_CONFIG and ./loan_pipeline.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Relational store URL, e.g. sqlite:data/loan_pipeline.db?mode=rwc
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory of the document store
    #[arg(long, global = true, value_name = "DIR")]
    document_path: Option<PathBuf>,

    /// Model artifact path
    #[arg(long, global = true, value_name = "PATH")]
    model_path: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the HTTP API
    Serve {
        /// Override the bind address (default: "0.0.0.0:8000")
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Replace destination records with the source's (full resync)
    Reconcile {
        /// Entity kinds to reconcile (repeatable); all kinds when omitted
        #[arg(long = "entity")]
        entities: Vec<EntityKind>,
        /// Authoritative store: document or relational (default: `sync.source`)
        #[arg(long, value_parser = parse_source)]
        source: Option<SyncSource>,
    },

    /// Compare counts and identity keys between the stores
    Verify {
        #[arg(long = "entity")]
        entities: Vec<EntityKind>,
        #[arg(long, value_parser = parse_source)]
        source: Option<SyncSource>,
    },

    /// Rebuild features, predictions and an analytics snapshot
    Populate {
        /// Store to rebuild: relational or document
        #[arg(long, value_parser = parse_backend, default_value = "relational")]
        store: Backend,
    },

    /// Train the logistic model on labelled applications in the relational store
    Train {
        /// Where to write the artifact (default: model.artifact_path)
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        model_version: Option<String>,
    },

    /// Import applications from a JSON-lines file
    Import {
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
    },
}

fn parse_source(value: &str) -> Result<SyncSource, String> {
    match value {
        "document" => Ok(SyncSource::Document),
        "relational" => Ok(SyncSource::Relational),
        other => Err(format!("unknown source '{other}' (expected document or relational)")),
    }
}

fn parse_backend(value: &str) -> Result<Backend, String> {
    match value {
        "document" => Ok(Backend::Document),
        "relational" => Ok(Backend::Relational),
        other => Err(format!("unknown store '{other}' (expected document or relational)")),
    }
}

// ============================================================================
// Startup helpers
// ============================================================================

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,loan_pipeline=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = AppConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => AppConfig::load(),
    };
    if let Some(url) = &args.database_url {
        config.storage.database_url = url.clone();
    }
    if let Some(path) = &args.document_path {
        config.storage.document_path = path.clone();
    }
    if let Some(path) = &args.model_path {
        config.model.artifact_path = path.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

struct Stores {
    relational: Arc<RelationalStore>,
    document: Arc<DocumentStore>,
}

impl Stores {
    async fn open(config: &AppConfig) -> Result<Self> {
        let relational = RelationalStore::connect(
            &config.storage.database_url,
            config.storage.max_connections,
        )
        .await
        .context("Failed to open relational store")?;
        let document = DocumentStore::open(&config.storage.document_path)
            .context("Failed to open document store")?;
        Ok(Self {
            relational: Arc::new(relational),
            document: Arc::new(document),
        })
    }

    fn reconciler(&self, source: SyncSource) -> SyncReconciler {
        SyncReconciler::from_source(source, self.relational.clone(), self.document.clone())
    }

    fn service(&self, engine: Arc<PredictionEngine>, config: &AppConfig) -> LoanService {
        LoanService::new(
            self.relational.clone(),
            self.document.clone(),
            engine,
            config.sync.write_mode,
        )
    }

    async fn close(&self) {
        if let Err(e) = self.document.flush().await {
            warn!(error = %e, "Document store flush on shutdown failed");
        }
        self.relational.close().await;
    }
}

// ============================================================================
// Subcommands
// ============================================================================

async fn run_serve(config: AppConfig, addr: Option<String>) -> Result<()> {
    let stores = Stores::open(&config).await?;
    let engine = Arc::new(PredictionEngine::new(&config.model.artifact_path));
    engine.warm_up();

    let reconciler = Arc::new(stores.reconciler(config.sync.source));
    let state = ApiState {
        service: Arc::new(stores.service(engine, &config)),
        reconciler: reconciler.clone(),
    };
    let app = create_app(state, config.server.max_payload_size);

    let server_addr = addr.unwrap_or_else(|| config.server.bind_address.clone());
    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("Failed to bind {server_addr}"))?;
    info!(addr = %server_addr, "HTTP API listening");

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let sync_task = spawn_periodic_sync(
        reconciler,
        config.sync.entities.clone(),
        config.sync.interval_secs,
        cancel_token.clone(),
    );

    let server_token = cancel_token.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("[HttpServer] Received shutdown signal");
        })
        .await;

    cancel_token.cancel();
    if let Some(handle) = sync_task {
        if let Err(e) = handle.await {
            error!(error = %e, "Periodic reconciliation task panicked");
        }
    }
    stores.close().await;

    result.context("HTTP server error")?;
    info!("Loan pipeline shutdown complete");
    Ok(())
}

fn selected(entities: Vec<EntityKind>) -> Vec<EntityKind> {
    if entities.is_empty() {
        EntityKind::ALL.to_vec()
    } else {
        entities
    }
}

async fn run_reconcile(
    config: AppConfig,
    entities: Vec<EntityKind>,
    source: Option<SyncSource>,
) -> Result<()> {
    let stores = Stores::open(&config).await?;
    let reconciler = stores.reconciler(source.unwrap_or(config.sync.source));
    let result = reconciler.reconcile_many(&selected(entities)).await;
    stores.close().await;

    let reports = result.context("Reconciliation failed; destination must be fully resynced")?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn run_verify(
    config: AppConfig,
    entities: Vec<EntityKind>,
    source: Option<SyncSource>,
) -> Result<()> {
    let stores = Stores::open(&config).await?;
    let reconciler = stores.reconciler(source.unwrap_or(config.sync.source));
    let mut reports = Vec::new();
    for kind in selected(entities) {
        reports.push(reconciler.verify(kind).await?);
    }
    stores.close().await;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    let inconsistent: Vec<String> = reports
        .iter()
        .filter(|r| !r.consistent)
        .map(|r| r.entity.to_string())
        .collect();
    if !inconsistent.is_empty() {
        anyhow::bail!("stores differ for: {}", inconsistent.join(", "));
    }
    Ok(())
}

async fn run_populate(config: AppConfig, store: Backend) -> Result<()> {
    let stores = Stores::open(&config).await?;
    let engine = PredictionEngine::new(&config.model.artifact_path);
    let target: &dyn RecordStore = match store {
        Backend::Relational => &*stores.relational,
        Backend::Document => &*stores.document,
    };
    let result = rebuild_derived(target, &engine).await;
    stores.close().await;

    let report = result.context("Failed to rebuild derived collections")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_train(
    config: AppConfig,
    output: Option<PathBuf>,
    seed: Option<u64>,
    model_version: Option<String>,
) -> Result<()> {
    let stores = Stores::open(&config).await?;
    let apps = stores
        .relational
        .list_applications(&ApplicationFilter::default(), Page::all())
        .await;
    stores.close().await;
    let apps = apps.context("Failed to load applications")?;

    let mut training = TrainingConfig::from(&config.model);
    if let Some(seed) = seed {
        training.seed = seed;
    }
    training.model_version = model_version;
    let path = output.unwrap_or_else(|| config.model.artifact_path.clone());

    // CPU-bound; keep it off the async workers
    let report = tokio::task::spawn_blocking(move || train_and_save(&apps, &training, &path))
        .await
        .context("Training task panicked")?
        .context("Training failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_import(config: AppConfig, file: PathBuf) -> Result<()> {
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let stores = Stores::open(&config).await?;
    let engine = Arc::new(PredictionEngine::new(&config.model.artifact_path));
    let service = stores.service(engine, &config);
    let result = service.import_lines(&text).await;
    stores.close().await;

    let report = result.context("Import aborted")?;
    for line in &report.rejected {
        warn!(row = %line, "Row rejected");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    match args.command {
        SubCommand::Serve { addr } => run_serve(config, addr).await,
        SubCommand::Reconcile { entities, source } => run_reconcile(config, entities, source).await,
        SubCommand::Verify { entities, source } => run_verify(config, entities, source).await,
        SubCommand::Populate { store } => run_populate(config, store).await,
        SubCommand::Train {
            output,
            seed,
            model_version,
        } => run_train(config, output, seed, model_version).await,
        SubCommand::Import { file } => run_import(config, file).await,
    }
}
