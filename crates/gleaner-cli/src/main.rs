use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gleaner_client::{CswClient, CswClientFactory};
use gleaner_core::{
    BatchHarvestSummary, CreateJobRequest, DbConfig, DirectoryImporter, FetchState,
    HarvestConfig, HarvestLedger, HarvestPipeline, HarvestSource, HttpConfig, JobQueue,
    JobStatus, TracingReporter, TracingWorkerReporter, WorkerConfig, WorkerService,
    load_sources_config,
};
use gleaner_db::{JobRepository, LedgerRepository};
use uuid::Uuid;

mod config;

use config::{Command, Config};

type Worker = WorkerService<JobRepository, CswClientFactory, LedgerRepository, DirectoryImporter>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    info!("Connecting to database...");
    let db_config = DbConfig::default();
    let pool = PgPoolOptions::new()
        .max_connections(db_config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    gleaner_db::migrate(&pool)
        .await
        .context("Failed to apply database migrations")?;

    let ledger = LedgerRepository::new(pool.clone());
    let queue = JobRepository::new(pool);
    let http_config = HttpConfig::default()
        .with_timeout(Duration::from_secs(config.http_timeout))
        .with_page_size(config.page_size);

    match config.command {
        Command::Harvest {
            url,
            source,
            filter,
            import,
            concurrency,
            insecure,
        } => {
            let mut sources = select_sources(url, source, config.sources)?;
            for source in &mut sources {
                if filter.is_some() {
                    source.filter = filter.clone();
                }
                source.disable_ssl_verification |= insecure;
            }
            if sources.is_empty() {
                info!("No enabled sources found in configuration.");
                info!("Add sources to sources.toml or use: gleaner harvest <url>");
                return Ok(());
            }

            let worker = build_worker(
                queue,
                ledger,
                http_config,
                import.import_dir,
                concurrency,
                WorkerConfig::default(),
            );
            harvest(&worker, sources, shutdown_token()).await?;
        }
        Command::Enqueue {
            url,
            source,
            filter,
            max_retries,
        } => {
            let sources = select_sources(url, source, config.sources)?;
            for mut source in sources {
                if filter.is_some() {
                    source.filter = filter.clone();
                }
                let mut request = CreateJobRequest::new(source);
                if let Some(max) = max_retries {
                    request = request.with_max_retries(max);
                }
                let job = queue.create_job(request).await?;
                println!("{}  {}", job.id, job.source_url);
            }
        }
        Command::Worker {
            import,
            poll_interval,
            worker_id,
            concurrency,
        } => {
            let mut worker_config =
                WorkerConfig::default().with_poll_interval(Duration::from_secs(poll_interval));
            if let Some(id) = worker_id {
                worker_config = worker_config.with_worker_id(id);
            }

            let worker = build_worker(
                queue,
                ledger,
                http_config,
                import.import_dir,
                concurrency,
                worker_config,
            );
            worker
                .run(shutdown_token(), &TracingWorkerReporter, &TracingReporter)
                .await
                .context("Worker stopped with an error")?;
        }
        Command::Jobs { status, limit } => {
            list_jobs(&queue, status.map(Into::into), limit).await?;
        }
        Command::Entries {
            job_id,
            errors_only,
        } => {
            show_entries(&ledger, &queue, &http_config, job_id, errors_only).await?;
        }
        Command::Cancel { job_id } => {
            cancel_job(&queue, job_id).await?;
        }
        Command::Stats => {
            show_stats(&ledger, &queue).await?;
        }
    }

    Ok(())
}

fn build_worker(
    queue: JobRepository,
    ledger: LedgerRepository,
    http_config: HttpConfig,
    import_dir: PathBuf,
    concurrency: usize,
    worker_config: WorkerConfig,
) -> Worker {
    let pipeline = HarvestPipeline::with_config(
        CswClientFactory::new(http_config),
        ledger,
        DirectoryImporter::new(import_dir),
        HarvestConfig::default().with_concurrency(concurrency),
    );
    WorkerService::new(queue, pipeline, worker_config)
}

/// Resolves the sources of a `harvest`/`enqueue` invocation:
/// a direct URL, a named source, or every enabled source.
fn select_sources(
    url: Option<String>,
    name: Option<String>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<Vec<HarvestSource>> {
    if let Some(url) = url {
        return Ok(vec![HarvestSource::new(url)]);
    }

    let sources_config = load_sources_config(config_path)?.ok_or_else(|| {
        anyhow::anyhow!(
            "No configuration file found. Create ~/.config/gleaner/sources.toml or use --sources"
        )
    })?;

    match name {
        Some(name) => {
            let entry = sources_config
                .find_by_name(&name)
                .ok_or_else(|| anyhow::anyhow!("Source '{}' not found in configuration", name))?;
            if !entry.enabled {
                info!("Note: source '{}' is marked as disabled in configuration", name);
            }
            Ok(vec![entry.to_source()])
        }
        None => Ok(sources_config
            .enabled_sources()
            .into_iter()
            .map(|entry| entry.to_source())
            .collect()),
    }
}

/// Queues one job per source and runs them in this process.
///
/// An interrupted job stays queued, so `gleaner worker` resumes it.
async fn harvest(
    worker: &Worker,
    sources: Vec<HarvestSource>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let summary = worker
        .harvest_sources(&sources, cancel, &TracingWorkerReporter, &TracingReporter)
        .await
        .context("Job queue failed during harvest")?;

    if summary.results.iter().any(|r| r.result.cancelled) {
        warn!("Harvest interrupted; run `gleaner worker` to resume the pending job");
    }
    print_batch_summary(&summary);
    Ok(())
}

/// Cancels a job that has not finished yet.
async fn cancel_job(queue: &JobRepository, job_id: Uuid) -> anyhow::Result<()> {
    let job = queue
        .get_job(job_id)
        .await?
        .with_context(|| format!("Job {} not found", job_id))?;
    if job.status.is_terminal() {
        anyhow::bail!("Job {} is already {}", job_id, job.status);
    }
    if job.status == JobStatus::Running {
        warn!(
            %job_id,
            worker = job.worker_id.as_deref().unwrap_or("unknown"),
            "Job is running; its worker is not interrupted"
        );
    }

    queue.cancel_job(job_id, None).await?;
    println!("Cancelled job {}", job_id);
    Ok(())
}

fn print_batch_summary(summary: &BatchHarvestSummary) {
    info!("═══════════════════════════════════════════════════════");
    info!("HARVEST COMPLETE");
    info!("═══════════════════════════════════════════════════════");
    for result in &summary.results {
        let r = &result.result;
        info!(
            "  {:<25} new {:>5}  changed {:>5}  deleted {:>5}  fetched {:>5}  failed {:>5}",
            result.source_name, r.new, r.changed, r.deleted, r.fetched_ok, r.fetched_failed
        );
        if let Some(fatal) = &r.fatal {
            error!("    {}: {}", fatal.reason(), fatal);
        }
    }
    info!("───────────────────────────────────────────────────────");
    info!("  Sources processed:   {}", summary.total_sources());
    info!("  Successful:          {}", summary.successful_count());
    info!("  Failed:              {}", summary.failed_count());
    info!("  Records fetched:     {}", summary.total_fetched_ok());
    info!("  Fetch failures:      {}", summary.total_fetched_failed());
    info!("═══════════════════════════════════════════════════════");
}

async fn list_jobs(
    queue: &JobRepository,
    status: Option<JobStatus>,
    limit: usize,
) -> anyhow::Result<()> {
    let jobs = queue.list_jobs(status, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:>5}  {:<20}  SOURCE",
        "ID", "STATUS", "TRIES", "CREATED"
    );
    for job in jobs {
        println!(
            "{:<36}  {:<9}  {:>5}  {:<20}  {}",
            job.id,
            job.status,
            job.retry_count,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.source_name.as_deref().unwrap_or(&job.source_url)
        );
        if let Some(message) = &job.error_message {
            println!("    error: {}", message);
        }
    }
    Ok(())
}

async fn show_entries(
    ledger: &LedgerRepository,
    queue: &JobRepository,
    http_config: &HttpConfig,
    job_id: Uuid,
    errors_only: bool,
) -> anyhow::Result<()> {
    let client = match queue.get_job(job_id).await? {
        Some(job) => CswClient::new(&job.source(), http_config.clone()).ok(),
        None => None,
    };

    for gather_error in ledger.gather_errors(job_id).await? {
        println!("gather error: {}", gather_error.message);
    }

    let entries = ledger.entries_for_job(job_id).await?;
    if entries.is_empty() {
        println!("No entries for job {}", job_id);
        return Ok(());
    }

    for entry in entries {
        let state = entry.fetch_state();
        let failed = state == FetchState::Failed || entry.import_error.is_some();
        if errors_only && !failed {
            continue;
        }

        let state = match state {
            FetchState::Pending => "pending",
            FetchState::Fetched => "fetched",
            FetchState::Failed => "failed",
            FetchState::NotFetchable => "-",
        };
        println!(
            "{:<8} {:<8} {}{}",
            entry.status,
            state,
            entry.guid,
            if entry.current { "" } else { " (superseded)" }
        );
        if let Some(error) = &entry.error {
            println!("    fetch: {}", error);
        }
        if let Some(error) = &entry.import_error {
            println!("    import: {}", error);
        }
        if let (Some(client), true) = (&client, failed) {
            println!("    url: {}", client.record_url(&entry.guid));
        }
    }
    Ok(())
}

async fn show_stats(ledger: &LedgerRepository, queue: &JobRepository) -> anyhow::Result<()> {
    let stats = ledger.source_stats().await?;

    println!("\nLedger\n");
    for source in &stats {
        println!("  {}", source.source_id);
        println!("    Current records:   {}", source.current);
        println!("    Pending fetch:     {}", source.pending);
        println!("    Fetch failures:    {}", source.failed);
        if let Some(last) = source.last_gathered_at {
            println!("    Last gathered:     {}", last);
        }
    }
    if stats.is_empty() {
        println!("  (empty)");
    }

    println!("\nJobs\n");
    for status in [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ] {
        println!(
            "  {:<10} {}",
            status.as_str(),
            queue.count_by_status(status).await?
        );
    }
    println!();
    Ok(())
}

/// Token cancelled on Ctrl+C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping after in-flight records...");
        cancel.cancel();
    });
    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
