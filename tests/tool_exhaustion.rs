use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use casemill::deferral::DeferralStore;
use casemill::guard::RetryPolicy;
use casemill::image::classify;
use casemill::job::{JobOptions, JobUpdate};
use casemill::pipeline::{JobOutcome, JobSink, PipelineContext, PipelineRunner, RunnerConfig};
use casemill::store::MemoryStore;
use casemill::tool::{ToolError, ToolInvocation, ToolRequest, ToolRunner};

/// A runner whose spawns always hit the file-descriptor limit.
struct ExhaustedRunner {
    calls: AtomicU32,
}

impl ToolRunner for ExhaustedRunner {
    fn run(&self, _request: &ToolRequest) -> Result<Box<dyn ToolInvocation>, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::Io(std::io::Error::from_raw_os_error(
            libc::EMFILE,
        )))
    }
}

struct NullSink;

impl JobSink for NullSink {
    fn record(&self, _job_id: &str, _update: JobUpdate) {}
}

#[test]
fn exhausted_retries_fail_the_job_with_the_cause_attached() {
    let tools = Arc::new(ExhaustedRunner {
        calls: AtomicU32::new(0),
    });
    let runner = PipelineRunner::new(
        RunnerConfig {
            retry: RetryPolicy {
                max_retries: 2,
                initial_wait_ms: 1,
                backoff_multiplier: 2.0,
                max_wait_ms: 4,
            },
            ..RunnerConfig::default()
        },
        tools.clone(),
        DeferralStore::new(Arc::new(MemoryStore::new())),
        Arc::new(NullSink),
    );
    let ctx = PipelineContext {
        job_id: "job_exhaustion_test".to_string(),
        images: vec![classify("disk01.dd::/mnt/point00::disk").expect("classify")],
        options: JobOptions::default(),
        cancel: Arc::new(AtomicBool::new(false)),
    };

    let outcome = runner.run(&ctx);
    match outcome {
        JobOutcome::Failed { error } => {
            assert!(error.contains("exhausted"), "unexpected error: {error}");
            assert!(error.contains("attempts"), "cause missing: {error}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    // Initial call plus exactly max_retries retries, then the job aborts
    // before any further phase runs.
    assert_eq!(tools.calls.load(Ordering::SeqCst), 3);
}
