use std::sync::Arc;

use casemill::job::{JobOptions, JobStatus};
use casemill::pipeline::RunnerConfig;
use casemill::registry::JobRegistry;
use casemill::store::MemoryStore;
use casemill::tool::ScriptedToolRunner;

fn run_job(descriptors: &[&str]) -> casemill::job::Job {
    let registry = JobRegistry::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedToolRunner::new()),
        RunnerConfig::default(),
    );
    let descriptors: Vec<String> = descriptors.iter().map(|d| d.to_string()).collect();
    let job = registry
        .create("case01", &descriptors, JobOptions::default())
        .expect("create");
    registry.start(&job.id).expect("start");
    registry.wait(&job.id).expect("wait")
}

#[test]
fn memory_image_is_deferred_until_disk_processing_completes() {
    let job = run_job(&[
        "disk01.dd::/mnt/point00::disk",
        "mem.raw::/data/memdumps::memory",
    ]);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);

    let lines: Vec<&str> = job.log.iter().map(|e| e.message.as_str()).collect();

    // The memory image never appears in collection or processing.
    for line in &lines {
        if line.contains("mem.raw") {
            assert!(
                !line.contains("collection"),
                "memory image in collection log: {line}"
            );
            assert!(
                !line.contains("processing"),
                "memory image in processing log: {line}"
            );
        }
    }

    let disk_processed = lines
        .iter()
        .position(|l| l.contains("processing complete for disk01.dd"))
        .expect("disk image processed");
    let memory_started = lines
        .iter()
        .position(|l| l.contains("memory analysis started for mem.raw"))
        .expect("memory image analysed");
    assert!(
        disk_processed < memory_started,
        "memory analysis must start only after disk processing completes"
    );
}

#[test]
fn all_disk_job_skips_deferred_memory_phase() {
    let job = run_job(&[
        "disk01.dd::/mnt/point00::disk",
        "disk02.dd::/mnt/point01::disk",
    ]);

    assert_eq!(job.status, JobStatus::Completed);
    let lines: Vec<&str> = job.log.iter().map(|e| e.message.as_str()).collect();
    assert!(
        lines
            .iter()
            .any(|l| l.contains("skipping deferred memory phase")),
        "deferred memory phase should be skipped"
    );
    assert!(
        !lines.iter().any(|l| l.contains("memory analysis started")),
        "no memory analysis may run for an all-disk job"
    );
}

#[test]
fn full_memory_analysis_flag_forces_deferred_phase_entry() {
    let registry = JobRegistry::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedToolRunner::new()),
        RunnerConfig::default(),
    );
    let job = registry
        .create(
            "case01",
            &["disk01.dd::/mnt/point00::disk".to_string()],
            JobOptions {
                full_memory_analysis: true,
            },
        )
        .expect("create");
    registry.start(&job.id).expect("start");
    let job = registry.wait(&job.id).expect("wait");

    assert_eq!(job.status, JobStatus::Completed);
    let lines: Vec<&str> = job.log.iter().map(|e| e.message.as_str()).collect();
    assert!(
        lines
            .iter()
            .any(|l| l.contains("deferred memory phase requested with no parked images")),
        "forced deferred phase should be entered and logged"
    );
}
