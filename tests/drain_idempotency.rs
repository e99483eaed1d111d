use std::sync::Arc;

use casemill::deferral::DeferralStore;
use casemill::image::{MemoryProfile, classify};
use casemill::store::SqliteStore;

#[test]
fn deferral_state_survives_restart_and_drains_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("casemill.db");

    {
        let store = Arc::new(SqliteStore::open(&db_path).expect("store"));
        let deferrals = DeferralStore::new(store);
        let image = classify("mem.raw::/data/memdumps::memory").expect("classify");
        deferrals
            .park("job1", "mem.raw", MemoryProfile::new(&image))
            .expect("park");
    }

    // Simulated process restart between Processing and DeferredMemory.
    let store = Arc::new(SqliteStore::open(&db_path).expect("reopen"));
    let deferrals = DeferralStore::new(store);
    assert!(deferrals.has_pending("job1").expect("pending"));

    let drained = deferrals.drain("job1").expect("drain");
    assert_eq!(drained.len(), 1);
    assert!(drained.contains_key("mem.raw"));

    // A retried orchestrator step never sees the profiles again.
    assert!(deferrals.drain("job1").expect("second drain").is_empty());

    // Nor does a process that restarts after the drain.
    let store = Arc::new(SqliteStore::open(&db_path).expect("reopen"));
    let deferrals = DeferralStore::new(store);
    assert!(!deferrals.has_pending("job1").expect("pending"));
    assert!(deferrals.drain("job1").expect("drain").is_empty());
}
