use std::sync::Arc;
use std::time::{Duration, Instant};

use casemill::job::{JobOptions, JobStatus};
use casemill::pipeline::RunnerConfig;
use casemill::registry::JobRegistry;
use casemill::store::MemoryStore;
use casemill::tool::ScriptedToolRunner;

#[test]
fn cancel_mid_run_stops_further_phase_steps() {
    let registry = JobRegistry::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedToolRunner::with_delay(Duration::from_millis(100))),
        RunnerConfig::default(),
    );
    let job = registry
        .create(
            "case01",
            &[
                "disk01.dd::/mnt/point00::disk".to_string(),
                "disk02.dd::/mnt/point01::disk".to_string(),
            ],
            JobOptions::default(),
        )
        .expect("create");
    registry.start(&job.id).expect("start");

    // Wait until the run is demonstrably in flight, then cancel.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = registry.get(&job.id).expect("get");
        if job.log.iter().any(|e| e.message.contains("started for")) {
            break;
        }
        assert!(Instant::now() < deadline, "job never produced trigger output");
        std::thread::sleep(Duration::from_millis(10));
    }
    registry.cancel(&job.id).expect("cancel");

    let job = registry.wait(&job.id).expect("wait");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.progress < 100);

    let lines: Vec<&str> = job.log.iter().map(|e| e.message.as_str()).collect();
    assert!(lines.iter().any(|l| l.contains("cancellation requested")));
    assert!(
        !lines.iter().any(|l| l.contains("analysis started")),
        "no phase step may run after cancellation"
    );
    assert!(
        !lines.iter().any(|l| l.contains("job finalized")),
        "a cancelled job is never finalized"
    );
}
