//! # Job Registry
//!
//! Owns Job entities and enforces the lifecycle state machine. Jobs are
//! mutated only through the transition table and the whitelisted update
//! set; each started job gets its own worker thread, and at most one live
//! execution exists per job at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

use crate::deferral::DeferralStore;
use crate::image::{Image, ValidationError, classify};
use crate::job::{Job, JobOptions, JobStatus, JobUpdate, TransitionError, generate_job_id};
use crate::pipeline::{JobOutcome, JobSink, PipelineContext, PipelineRunner, RunnerConfig};
use crate::store::{StateStore, StoreError};
use crate::tool::ToolRunner;

const JOBS_BUCKET: &str = "jobs";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job not found: {job_id}")]
    NotFound { job_id: String },
    #[error("invalid transition for job {job_id}: {source}")]
    InvalidTransition {
        job_id: String,
        source: TransitionError,
    },
    #[error("job {job_id} already has an active execution")]
    ExecutionActive { job_id: String },
    #[error("job {job_id} cannot be deleted while running")]
    DeleteWhileRunning { job_id: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Filter and pagination for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub case_id: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

struct Execution {
    cancel: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

pub struct JobRegistry {
    store: Arc<dyn StateStore>,
    tools: Arc<dyn ToolRunner>,
    runner_cfg: RunnerConfig,
    /// Serializes read-modify-write cycles against the store.
    write_lock: Mutex<()>,
    executions: Mutex<HashMap<String, Execution>>,
}

impl JobRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        tools: Arc<dyn ToolRunner>,
        runner_cfg: RunnerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tools,
            runner_cfg,
            write_lock: Mutex::new(()),
            executions: Mutex::new(HashMap::new()),
        })
    }

    /// Create a job from raw image descriptors. Every descriptor must
    /// classify; the first validation failure aborts and no job is created.
    pub fn create(
        &self,
        case_id: &str,
        descriptors: &[String],
        options: JobOptions,
    ) -> Result<Job, RegistryError> {
        let mut images: Vec<Image> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            images.push(classify(descriptor)?);
        }

        let mut job = Job::new(generate_job_id(), case_id.to_string(), images, options);
        job.append_log(format!(
            "job created for case {} with {} images",
            case_id,
            job.images.len()
        ));
        self.save(&job)?;
        info!("job created job_id={} case={} images={}", job.id, case_id, job.images.len());
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Job, RegistryError> {
        let raw = self
            .store
            .get(JOBS_BUCKET, job_id)?
            .ok_or_else(|| RegistryError::NotFound {
                job_id: job_id.to_string(),
            })?;
        let job = serde_json::from_str(&raw).map_err(StoreError::from)?;
        Ok(job)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, RegistryError> {
        let mut jobs: Vec<Job> = Vec::new();
        for (_, raw) in self.store.scan(JOBS_BUCKET)? {
            let job: Job = serde_json::from_str(&raw).map_err(StoreError::from)?;
            if let Some(status) = filter.status {
                if job.status != status {
                    continue;
                }
            }
            if let Some(case_id) = &filter.case_id {
                if &job.case_id != case_id {
                    continue;
                }
            }
            jobs.push(job);
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let jobs = jobs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(jobs)
    }

    /// Dispatch orchestration for a Queued or Pending job on its own worker
    /// thread.
    pub fn start(self: &Arc<Self>, job_id: &str) -> Result<(), RegistryError> {
        let mut executions = self
            .executions
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        if let Some(existing) = executions.get(job_id) {
            if !existing.handle.is_finished() {
                return Err(RegistryError::ExecutionActive {
                    job_id: job_id.to_string(),
                });
            }
        }

        let job = {
            let _guard = self.lock_writes()?;
            let mut job = self.get(job_id)?;
            self.apply_transition(&mut job, JobStatus::Running)?;
            job.append_log("job started");
            self.save(&job)?;
            job
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = PipelineContext {
            job_id: job.id.clone(),
            images: job.images.clone(),
            options: job.options.clone(),
            cancel: cancel.clone(),
        };

        let registry = self.clone();
        let handle = thread::spawn(move || {
            let sink: Arc<dyn JobSink> = registry.clone();
            let runner = PipelineRunner::new(
                registry.runner_cfg.clone(),
                registry.tools.clone(),
                DeferralStore::new(registry.store.clone()),
                sink,
            );
            let outcome = runner.run(&ctx);
            registry.finish(&ctx.job_id, outcome);
        });

        executions.insert(
            job_id.to_string(),
            Execution {
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Request cooperative cancellation. A Pending job transitions
    /// directly; a Running job is marked Cancelled and its orchestrator is
    /// signalled to terminate the in-flight invocation.
    pub fn cancel(&self, job_id: &str) -> Result<(), RegistryError> {
        let was_running = {
            let _guard = self.lock_writes()?;
            let mut job = self.get(job_id)?;
            let was_running = job.status == JobStatus::Running;
            self.apply_transition(&mut job, JobStatus::Cancelled)?;
            job.append_log("cancellation requested");
            self.save(&job)?;
            was_running
        };

        if was_running {
            if let Ok(executions) = self.executions.lock() {
                if let Some(execution) = executions.get(job_id) {
                    execution.cancel.store(true, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Move a Failed or Cancelled job back to Pending and dispatch a fresh
    /// execution. The log is preserved; result and error are cleared for
    /// the new run.
    pub fn restart(self: &Arc<Self>, job_id: &str) -> Result<(), RegistryError> {
        {
            let _guard = self.lock_writes()?;
            let mut job = self.get(job_id)?;
            self.apply_transition(&mut job, JobStatus::Pending)?;
            job.result = None;
            job.error = None;
            job.append_log("job restarted");
            self.save(&job)?;
        }
        self.start(job_id)
    }

    pub fn archive(&self, job_id: &str) -> Result<(), RegistryError> {
        let _guard = self.lock_writes()?;
        let mut job = self.get(job_id)?;
        self.apply_transition(&mut job, JobStatus::Archived)?;
        job.append_log("job archived");
        self.save(&job)?;
        Ok(())
    }

    pub fn unarchive(&self, job_id: &str) -> Result<(), RegistryError> {
        let _guard = self.lock_writes()?;
        let mut job = self.get(job_id)?;
        job.unarchive()
            .map_err(|source| RegistryError::InvalidTransition {
                job_id: job_id.to_string(),
                source,
            })?;
        job.append_log("job unarchived");
        self.save(&job)?;
        Ok(())
    }

    /// Apply a whitelisted partial update. Status changes still go through
    /// the transition table; progress can only rise.
    pub fn update(&self, job_id: &str, update: JobUpdate) -> Result<Job, RegistryError> {
        let _guard = self.lock_writes()?;
        let mut job = self.get(job_id)?;
        self.apply_update(&mut job, update)?;
        self.save(&job)?;
        Ok(job)
    }

    /// Remove a job and its deferral state. Rejected while Running.
    pub fn delete(&self, job_id: &str) -> Result<(), RegistryError> {
        let _guard = self.lock_writes()?;
        let job = self.get(job_id)?;
        if job.status == JobStatus::Running {
            return Err(RegistryError::DeleteWhileRunning {
                job_id: job_id.to_string(),
            });
        }
        self.store.delete(JOBS_BUCKET, job_id)?;
        DeferralStore::new(self.store.clone()).remove(job_id)?;
        Ok(())
    }

    pub fn bulk_cancel(&self, job_ids: &[String]) -> Vec<(String, Result<(), RegistryError>)> {
        job_ids
            .iter()
            .map(|id| (id.clone(), self.cancel(id)))
            .collect()
    }

    pub fn bulk_delete(&self, job_ids: &[String]) -> Vec<(String, Result<(), RegistryError>)> {
        job_ids
            .iter()
            .map(|id| (id.clone(), self.delete(id)))
            .collect()
    }

    pub fn bulk_archive(&self, job_ids: &[String]) -> Vec<(String, Result<(), RegistryError>)> {
        job_ids
            .iter()
            .map(|id| (id.clone(), self.archive(id)))
            .collect()
    }

    /// Block until the job's execution thread finishes. Returns the final
    /// job record.
    pub fn wait(&self, job_id: &str) -> Result<Job, RegistryError> {
        let execution = {
            let mut executions = self
                .executions
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            executions.remove(job_id)
        };
        if let Some(execution) = execution {
            let _ = execution.handle.join();
        }
        self.get(job_id)
    }

    fn finish(&self, job_id: &str, outcome: JobOutcome) {
        let result = (|| -> Result<(), RegistryError> {
            let _guard = self.lock_writes()?;
            let mut job = self.get(job_id)?;
            if job.status != JobStatus::Running {
                // cancel() already moved the job to a terminal state.
                job.append_log(format!(
                    "pipeline stopped; job already {}",
                    job.status.as_str()
                ));
                self.save(&job)?;
                return Ok(());
            }
            match outcome {
                JobOutcome::Completed {
                    summary,
                    partial_failures,
                } => {
                    self.apply_transition(&mut job, JobStatus::Completed)?;
                    job.raise_progress(100);
                    job.result = Some(summary);
                    if !partial_failures.is_empty() {
                        job.error = Some(partial_failures.join("; "));
                        job.append_log(format!(
                            "job completed with {} image failures",
                            partial_failures.len()
                        ));
                    } else {
                        job.append_log("job completed");
                    }
                }
                JobOutcome::Failed { error } => {
                    self.apply_transition(&mut job, JobStatus::Failed)?;
                    job.error = Some(error.clone());
                    job.append_log(format!("job failed: {error}"));
                }
                JobOutcome::Cancelled => {
                    self.apply_transition(&mut job, JobStatus::Cancelled)?;
                    job.append_log("job cancelled");
                }
            }
            self.save(&job)?;
            info!("job finished job_id={} status={}", job.id, job.status.as_str());
            Ok(())
        })();
        if let Err(err) = result {
            warn!("failed to record job outcome job_id={job_id}: {err}");
        }
    }

    fn apply_update(&self, job: &mut Job, update: JobUpdate) -> Result<(), RegistryError> {
        if let Some(status) = update.status {
            self.apply_transition(job, status)?;
        }
        if let Some(progress) = update.progress {
            job.raise_progress(progress);
        }
        for line in update.log_append {
            job.append_log(line);
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
        }
        Ok(())
    }

    fn apply_transition(&self, job: &mut Job, to: JobStatus) -> Result<(), RegistryError> {
        job.transition(to)
            .map_err(|source| RegistryError::InvalidTransition {
                job_id: job.id.clone(),
                source,
            })
    }

    fn save(&self, job: &Job) -> Result<(), RegistryError> {
        let raw = serde_json::to_string(job).map_err(StoreError::from)?;
        self.store.put(JOBS_BUCKET, &job.id, &raw)?;
        Ok(())
    }

    fn lock_writes(&self) -> Result<std::sync::MutexGuard<'_, ()>, RegistryError> {
        Ok(self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?)
    }
}

impl JobSink for JobRegistry {
    fn record(&self, job_id: &str, update: JobUpdate) {
        let result = (|| -> Result<(), RegistryError> {
            let _guard = self.lock_writes()?;
            let mut job = self.get(job_id)?;
            self.apply_update(&mut job, update)?;
            self.save(&job)?;
            Ok(())
        })();
        if let Err(err) = result {
            warn!("failed to persist job update job_id={job_id}: {err}");
        }
    }
}
