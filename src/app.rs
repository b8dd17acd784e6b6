use crate::cli::{Args, Command};
use crate::config::{LogFormat, Settings};
use crate::cycle_runs::recent_cycle_runs;
use crate::insights::InsightWriter;
use crate::openai::real::create_openai_client;
use crate::pipeline::Pipeline;
use crate::prompt_versions::PromptVersionManager;
use crate::scheduler::{run_scheduler, CycleSchedule};
use crate::{create_pool, init_markov_db, DbPool};
use anyhow::{Context, Result};
use clap::Parser;
use fs2::FileExt;
use serde::Serialize;
use std::fs::File;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};
use tracing_tree::HierarchicalLayer;

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    // RUST_LOG wins over --log-level when set
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))?;

    match format {
        LogFormat::Tree => {
            let subscriber = Registry::default()
                .with(
                    HierarchicalLayer::new(2)
                        .with_targets(true)
                        .with_bracketed_fields(true),
                )
                .with(filter);
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = Registry::default()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true),
                )
                .with(filter);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn create_app_lock(path: &Path) -> Result<File> {
    let lock_file = File::create(path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("Another scheduler is already running"))?;
    Ok(lock_file)
}

fn open_database(settings: &Settings) -> Result<DbPool> {
    info!("Opening database {}", settings.database_path.display());
    let pool = create_pool(&settings.database_path, &settings.pool)
        .with_context(|| {
            format!(
                "failed to open database {}",
                settings.database_path.display()
            )
        })?;
    {
        let mut conn = pool.get()?;
        init_markov_db(&mut conn)?;
    }
    Ok(pool)
}

fn build_pipeline(
    settings: Arc<Settings>,
    pool: DbPool,
    shutdown: CancellationToken,
) -> Pipeline {
    let client = create_openai_client(
        settings.model_api_key.expose(),
        settings.model_api_base.as_deref(),
    );
    Pipeline::new(settings, pool, client, shutdown)
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for CTRL-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Resolves with the signal name on CTRL-C or SIGTERM. The SIGTERM handler
/// is installed before this returns.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt() => "CTRL-C",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    Ok(async {
        interrupt().await;
        "CTRL-C"
    })
}

async fn cancel_on_signal(
    signal: impl Future<Output = &'static str>,
    shutdown: CancellationToken,
) {
    let name = signal.await;
    info!("Received {}, initiating shutdown", name);
    shutdown.cancel();
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    match shutdown_signal() {
        Ok(signal) => {
            tokio::spawn(cancel_on_signal(signal, shutdown));
        }
        Err(e) => error!("Failed to install shutdown signal handlers: {}", e),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_scheduled(
    settings: Arc<Settings>,
    pool: DbPool,
    run_now: bool,
    lock_path: &Path,
) -> Result<()> {
    let _lock_file = create_app_lock(lock_path).map_err(|e| {
        error!("Failed to create lock file: {}", e);
        e
    })?;

    let schedule =
        CycleSchedule::parse(&settings.cron_schedule, settings.timezone)?;
    let shutdown = CancellationToken::new();
    let pipeline = Arc::new(build_pipeline(settings, pool, shutdown.clone()));

    // Refuse to start without a base template.
    let base = pipeline.versions().ensure_base_template()?;
    info!(
        "Using base template '{}' ({} chars)",
        pipeline.versions().base_template_name(),
        base.content.len()
    );

    spawn_signal_handler(shutdown);
    run_scheduler(pipeline, schedule, run_now).await;
    info!("Scheduler stopped");
    Ok(())
}

async fn run_once(settings: Arc<Settings>, pool: DbPool) -> Result<()> {
    let shutdown = CancellationToken::new();
    let pipeline = Arc::new(build_pipeline(settings, pool, shutdown.clone()));
    spawn_signal_handler(shutdown);

    let summary = pipeline.run_cycle().await;
    if let Some(fatal) = summary.fatal {
        return Err(anyhow::anyhow!("cycle aborted: {}", fatal));
    }

    let failures: Vec<_> = summary
        .failures
        .iter()
        .map(|e| {
            serde_json::json!({
                "subject_id": e.subject_id(),
                "kind": e.kind(),
                "error": e.to_string(),
            })
        })
        .collect();
    print_json(&serde_json::json!({
        "started_at": summary.started_at,
        "finished_at": summary.finished_at,
        "subjects_seen": summary.subjects_seen,
        "subjects_processed": summary.subjects_processed,
        "insight_count": summary.insight_count,
        "optimized_count": summary.optimized_count,
        "failure_count": summary.failure_count(),
        "cancelled": summary.cancelled,
        "failures": failures,
    }))
}

async fn execute(command: Command, settings: Arc<Settings>) -> Result<()> {
    let pool = open_database(&settings)?;

    match command {
        Command::Run { run_now, lock_file } => {
            run_scheduled(settings, pool, run_now, &lock_file).await
        }
        Command::Once => run_once(settings, pool).await,
        Command::History { subject } => {
            let versions = PromptVersionManager::new(
                pool,
                settings.base_template_name.clone(),
            );
            print_json(&versions.history(subject)?)
        }
        Command::Insights { subject } => {
            print_json(&InsightWriter::new(pool).list_active(subject)?)
        }
        Command::SetBaseTemplate { file, name } => {
            let content = std::fs::read_to_string(&file).with_context(|| {
                format!("failed to read template {}", file.display())
            })?;
            if content.trim().is_empty() {
                anyhow::bail!("template {} is empty", file.display());
            }
            let name = name.unwrap_or_else(|| settings.base_template_name.clone());
            PromptVersionManager::new(pool, name.clone())
                .install_base_template(&name, content.trim())
        }
        Command::Runs { limit } => print_json(&recent_cycle_runs(&pool, limit)?),
    }
}

pub async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.common.log_level, args.common.log_format)?;

    let settings = Settings::from_args(&args.common).map_err(|e| {
        error!("{}", e);
        e
    })?;
    let settings = Arc::new(settings);

    let root = info_span!("markov", env = %settings.environment);
    execute(args.command, settings).instrument(root).await
}
