use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{info, warn};

use casemill::{
    cli,
    config,
    job::{JobOptions, JobStatus},
    logging,
    registry::JobRegistry,
    store::SqliteStore,
    tool::{CommandToolRunner, ScriptedToolRunner, ToolRunner},
};

fn main() -> Result<()> {
    logging::init_logging();

    let cli_opts = cli::parse();
    let loaded = config::load_config(cli_opts.config_path.as_deref())?;
    let mut cfg = loaded.config;
    if let Some(workers) = cli_opts.workers {
        cfg.image_workers = workers;
    }
    if let Some(timeout) = cli_opts.job_timeout_secs {
        cfg.job_timeout_secs = timeout;
    }
    let full_memory_analysis = cli_opts.full_memory_analysis || cfg.full_memory_analysis;

    std::fs::create_dir_all(&cli_opts.output)?;
    let store = Arc::new(SqliteStore::open(&cli_opts.output.join("casemill.db"))?);

    let tools: Arc<dyn ToolRunner> = if cli_opts.dry_run {
        info!("dry run: using scripted tool runner");
        Arc::new(ScriptedToolRunner::new())
    } else {
        Arc::new(CommandToolRunner::new(cfg.tools.clone()))
    };

    info!(
        "starting case={} images={} workers={} config_hash={}",
        cli_opts.case,
        cli_opts.images.len(),
        cfg.image_workers,
        loaded.config_hash
    );

    let registry = JobRegistry::new(store, tools, cfg.runner_config());
    let job = registry.create(
        &cli_opts.case,
        &cli_opts.images,
        JobOptions {
            full_memory_analysis,
        },
    )?;
    info!("job created job_id={}", job.id);

    let ctrlc_registry = registry.clone();
    let ctrlc_job_id = job.id.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received; requesting cooperative cancellation");
        if let Err(err) = ctrlc_registry.cancel(&ctrlc_job_id) {
            warn!("cancellation request failed: {err}");
        }
    })?;

    registry.start(&job.id)?;
    let job = registry.wait(&job.id)?;

    info!(
        "job finished job_id={} status={} progress={}",
        job.id,
        job.status.as_str(),
        job.progress
    );
    match job.status {
        JobStatus::Failed => {
            bail!(
                "job failed: {}",
                job.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        JobStatus::Completed => {
            if let Some(error) = &job.error {
                warn!("completed with partial errors: {error}");
            }
            if let Some(result) = &job.result {
                info!("result: {result}");
            }
        }
        _ => {}
    }
    Ok(())
}
