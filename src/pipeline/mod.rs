//! # Phase Orchestrator
//!
//! Drives a job through Identification -> Collection -> Processing ->
//! DeferredMemory -> Analysis. Collection and Processing iterate disk images
//! only; memory images are parked during Identification and enter the
//! pipeline again through the deferral store once every disk image has been
//! processed. Trigger messages stream to the progress aggregator and the
//! job log; cancellation is polled between per-image and per-phase steps.

pub mod events;
pub mod workers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::deferral::DeferralStore;
use crate::guard::{RetryPolicy, with_depth_budget};
use crate::image::{Image, ImageType, MemoryProfile};
use crate::job::{JobOptions, JobUpdate};
use crate::progress::ProgressAggregator;
use crate::store::StoreError;
use crate::tool::ToolRunner;

use events::{PhaseEvent, StepError};
use workers::{PhaseItem, spawn_phase_workers};

/// How long the orchestrator waits on the event channel before polling the
/// cancel flag and the job deadline.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Identification,
    Collection,
    Processing,
    DeferredMemory,
    Analysis,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identification => "identification",
            Self::Collection => "collection",
            Self::Processing => "processing",
            Self::DeferredMemory => "deferred_memory",
            Self::Analysis => "analysis",
        }
    }
}

/// How hibernation-class disk artifacts are handled during Processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeepArtifactPolicy {
    /// Process inline under a temporarily raised call-depth budget.
    Synchronous,
    /// Leave them to the DeferredMemory phase tooling.
    Deferred,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Where the orchestrator writes job progress and log lines. Only the
/// whitelisted update set passes through this seam.
pub trait JobSink: Send + Sync {
    fn record(&self, job_id: &str, update: JobUpdate);
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub image_workers: usize,
    pub progress_batch: u32,
    pub job_timeout: Option<Duration>,
    pub deep_artifact_policy: DeepArtifactPolicy,
    pub depth_budget_mib: u64,
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image_workers: 2,
            progress_batch: 8,
            job_timeout: None,
            deep_artifact_policy: DeepArtifactPolicy::Synchronous,
            depth_budget_mib: 64,
            retry: RetryPolicy::default(),
        }
    }
}

/// Final orchestration result, applied to the job by the registry.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        summary: String,
        partial_failures: Vec<String>,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

/// Everything one job run needs. The cancel flag is shared with the
/// registry, which raises it cooperatively.
pub struct PipelineContext {
    pub job_id: String,
    pub images: Vec<Image>,
    pub options: JobOptions,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct PhaseOutcome {
    failures: Vec<(String, String)>,
    cancelled: bool,
    /// A failure that must abort the whole job (exhausted retries).
    fatal: Option<String>,
}

pub struct PipelineRunner {
    cfg: RunnerConfig,
    tools: Arc<dyn ToolRunner>,
    deferrals: DeferralStore,
    sink: Arc<dyn JobSink>,
}

impl PipelineRunner {
    pub fn new(
        cfg: RunnerConfig,
        tools: Arc<dyn ToolRunner>,
        deferrals: DeferralStore,
        sink: Arc<dyn JobSink>,
    ) -> Self {
        Self {
            cfg,
            tools,
            deferrals,
            sink,
        }
    }

    pub fn run(&self, ctx: &PipelineContext) -> JobOutcome {
        match self.run_inner(ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("pipeline error job_id={}: {err}", ctx.job_id);
                JobOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    fn run_inner(&self, ctx: &PipelineContext) -> Result<JobOutcome, PipelineError> {
        let deadline = self.cfg.job_timeout.map(|t| Instant::now() + t);
        let mut agg = ProgressAggregator::new(ctx.images.len(), self.cfg.progress_batch);
        let mut failures: BTreeMap<String, String> = BTreeMap::new();

        // Identification covers every image and is the single writer of the
        // deferral store.
        let all_items = self.items_for(ctx, |_| true, &failures);
        let outcome = self.run_phase(ctx, Phase::Identification, &all_items, 1, deadline, &mut agg)?;
        if let Some(result) = self.check_phase(ctx, outcome, &mut failures) {
            return Ok(result);
        }

        for image in &ctx.images {
            if image.image_type == ImageType::Memory {
                self.deferrals
                    .park(&ctx.job_id, &image.filename, MemoryProfile::new(image))?;
                self.record_log(
                    ctx,
                    format!("memory image {} parked for deferred analysis", image.filename),
                );
            }
        }

        // Collection and Processing iterate a disk-only set; memory images
        // never enter it.
        let disk_items = self.items_for(ctx, |i| i.image_type == ImageType::Disk, &failures);
        let outcome = self.run_phase(
            ctx,
            Phase::Collection,
            &disk_items,
            self.cfg.image_workers,
            deadline,
            &mut agg,
        )?;
        if let Some(result) = self.check_phase(ctx, outcome, &mut failures) {
            return Ok(result);
        }

        let disk_items = self.items_for(ctx, |i| i.image_type == ImageType::Disk, &failures);
        let outcome = match self.cfg.deep_artifact_policy {
            // Hibernation-class artifacts are processed inline, so the
            // tooling is given a deeper call stack for the duration of the
            // phase.
            DeepArtifactPolicy::Synchronous => with_depth_budget(self.cfg.depth_budget_mib, || {
                self.run_phase(
                    ctx,
                    Phase::Processing,
                    &disk_items,
                    self.cfg.image_workers,
                    deadline,
                    &mut agg,
                )
            })?,
            DeepArtifactPolicy::Deferred => self.run_phase(
                ctx,
                Phase::Processing,
                &disk_items,
                self.cfg.image_workers,
                deadline,
                &mut agg,
            )?,
        };
        if let Some(result) = self.check_phase(ctx, outcome, &mut failures) {
            return Ok(result);
        }

        // DeferredMemory runs iff profiles are pending once Processing has
        // completed, or full memory analysis was explicitly requested.
        if self.deferrals.has_pending(&ctx.job_id)? || ctx.options.full_memory_analysis {
            let profiles = self.deferrals.drain(&ctx.job_id)?;
            let deferred_items: Vec<PhaseItem> = profiles
                .values()
                .map(|profile| PhaseItem {
                    index: self.image_index(ctx, &profile.filename),
                    filename: profile.filename.clone(),
                    locator: profile.locator.clone(),
                })
                .collect();
            if deferred_items.is_empty() {
                self.record_log(ctx, "deferred memory phase requested with no parked images");
            }
            let outcome =
                self.run_phase(ctx, Phase::DeferredMemory, &deferred_items, 1, deadline, &mut agg)?;
            if let Some(result) = self.check_phase(ctx, outcome, &mut failures) {
                return Ok(result);
            }
        } else {
            self.record_log(ctx, "no memory images parked; skipping deferred memory phase");
        }

        let analysis_items = self.items_for(ctx, |_| true, &failures);
        let outcome = self.run_phase(ctx, Phase::Analysis, &analysis_items, 1, deadline, &mut agg)?;
        if let Some(result) = self.check_phase(ctx, outcome, &mut failures) {
            return Ok(result);
        }

        let progress = agg.finalize();
        self.sink.record(
            &ctx.job_id,
            JobUpdate {
                progress: Some(progress),
                log_append: vec!["job finalized".to_string()],
                ..JobUpdate::default()
            },
        );

        Ok(self.conclude(ctx, failures))
    }

    /// Build the iteration set for a phase. Images that already failed an
    /// earlier phase stay out: their pipeline is broken.
    fn items_for(
        &self,
        ctx: &PipelineContext,
        keep: impl Fn(&Image) -> bool,
        failures: &BTreeMap<String, String>,
    ) -> Vec<PhaseItem> {
        ctx.images
            .iter()
            .enumerate()
            .filter(|&(_, image)| keep(image) && !failures.contains_key(&image.filename))
            .map(|(index, image)| PhaseItem {
                index,
                filename: image.filename.clone(),
                locator: image.locator.clone(),
            })
            .collect()
    }

    fn image_index(&self, ctx: &PipelineContext, filename: &str) -> usize {
        ctx.images
            .iter()
            .position(|image| image.filename == filename)
            .unwrap_or(0)
    }

    /// Fold a phase outcome into the job-level failure map; short-circuit
    /// on cancellation or a fatal error.
    fn check_phase(
        &self,
        ctx: &PipelineContext,
        outcome: PhaseOutcome,
        failures: &mut BTreeMap<String, String>,
    ) -> Option<JobOutcome> {
        for (filename, error) in outcome.failures {
            failures.entry(filename).or_insert(error);
        }
        if outcome.cancelled {
            self.record_log(ctx, "cancellation requested; job stopped cooperatively");
            return Some(JobOutcome::Cancelled);
        }
        if let Some(error) = outcome.fatal {
            return Some(JobOutcome::Failed { error });
        }
        None
    }

    fn conclude(&self, ctx: &PipelineContext, failures: BTreeMap<String, String>) -> JobOutcome {
        if failures.is_empty() {
            return JobOutcome::Completed {
                summary: format!("{} images analysed", ctx.images.len()),
                partial_failures: Vec::new(),
            };
        }
        if failures.len() >= ctx.images.len() {
            return JobOutcome::Failed {
                error: format!(
                    "every image failed: {}",
                    failures
                        .iter()
                        .map(|(f, e)| format!("{f}: {e}"))
                        .collect::<Vec<_>>()
                        .join("; ")
                ),
            };
        }
        let partial_failures: Vec<String> = failures
            .iter()
            .map(|(f, e)| format!("{f}: {e}"))
            .collect();
        JobOutcome::Completed {
            summary: format!(
                "{} of {} images analysed",
                ctx.images.len() - failures.len(),
                ctx.images.len()
            ),
            partial_failures,
        }
    }

    fn run_phase(
        &self,
        ctx: &PipelineContext,
        phase: Phase,
        items: &[PhaseItem],
        workers: usize,
        deadline: Option<Instant>,
        agg: &mut ProgressAggregator,
    ) -> Result<PhaseOutcome, PipelineError> {
        let mut outcome = PhaseOutcome::default();
        if ctx.cancel.load(Ordering::Relaxed) {
            outcome.cancelled = true;
            return Ok(outcome);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            outcome.fatal = Some("job timeout exceeded".to_string());
            return Ok(outcome);
        }
        if items.is_empty() {
            return Ok(outcome);
        }

        info!(
            "phase {} started job_id={} images={}",
            phase.as_str(),
            ctx.job_id,
            items.len()
        );
        let mut log_buf = vec![format!(
            "phase {} started ({} images)",
            phase.as_str(),
            items.len()
        )];

        let (job_tx, job_rx) = bounded::<PhaseItem>(items.len());
        let (event_tx, event_rx) = bounded::<PhaseEvent>(items.len().max(4) * 8);
        for item in items {
            if job_tx.send(item.clone()).is_err() {
                warn!("phase job channel closed during fill");
            }
        }
        drop(job_tx);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let handles = spawn_phase_workers(
            workers,
            phase,
            self.tools.clone(),
            self.cfg.retry.clone(),
            stop_flag.clone(),
            job_rx,
            event_tx,
        );

        let mut done = 0usize;
        while done < items.len() {
            match event_rx.recv_timeout(EVENT_POLL_INTERVAL) {
                Ok(PhaseEvent::ImageStarted { index, filename }) => {
                    agg.begin_image(index);
                    log_buf.push(format!("{}: image {filename} started", phase.as_str()));
                }
                Ok(PhaseEvent::Trigger { filename: _, text }) => {
                    let obs = agg.observe(&text);
                    log_buf.push(text);
                    if obs.should_persist {
                        self.flush(ctx, Some(obs.progress), &mut log_buf);
                    }
                }
                Ok(PhaseEvent::ImageDone { filename, result }) => {
                    done += 1;
                    match result {
                        Ok(()) => {
                            log_buf.push(format!("{}: image {filename} complete", phase.as_str()));
                        }
                        Err(StepError::Exhausted { attempts, source }) => {
                            let error = format!(
                                "{}: image {filename} exhausted resources after {attempts} attempts: {source}",
                                phase.as_str()
                            );
                            log_buf.push(error.clone());
                            outcome.fatal = Some(error);
                            stop_flag.store(true, Ordering::Relaxed);
                            break;
                        }
                        Err(StepError::Tool(err)) => {
                            warn!(
                                "tool failure phase={} job_id={} image={filename}: {err}",
                                phase.as_str(),
                                ctx.job_id
                            );
                            log_buf.push(format!("{}: image {filename} failed: {err}", phase.as_str()));
                            outcome.failures.push((filename, err.to_string()));
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.cancel.load(Ordering::Relaxed) {
                        outcome.cancelled = true;
                        stop_flag.store(true, Ordering::Relaxed);
                        break;
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        outcome.fatal = Some("job timeout exceeded".to_string());
                        stop_flag.store(true, Ordering::Relaxed);
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Dropping the receiver unblocks any worker still sending; workers
        // terminate their in-flight invocation once the stop flag is up.
        drop(event_rx);
        for handle in handles {
            let _ = handle.join();
        }

        if !outcome.cancelled && ctx.cancel.load(Ordering::Relaxed) {
            outcome.cancelled = true;
        }
        log_buf.push(format!("phase {} finished", phase.as_str()));
        self.flush(ctx, Some(agg.emitted()), &mut log_buf);
        Ok(outcome)
    }

    fn record_log(&self, ctx: &PipelineContext, message: impl Into<String>) {
        self.sink.record(
            &ctx.job_id,
            JobUpdate {
                log_append: vec![message.into()],
                ..JobUpdate::default()
            },
        );
    }

    fn flush(&self, ctx: &PipelineContext, progress: Option<u8>, log_buf: &mut Vec<String>) {
        if progress.is_none() && log_buf.is_empty() {
            return;
        }
        self.sink.record(
            &ctx.job_id,
            JobUpdate {
                progress,
                log_append: std::mem::take(log_buf),
                ..JobUpdate::default()
            },
        );
    }
}
