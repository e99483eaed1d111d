//! # Deferral Store
//!
//! Durable parking area for memory-image profiles. Identification is the
//! single writer, the DeferredMemory phase the single consumer. State is
//! keyed by job id so a crash between Processing and DeferredMemory does not
//! lose parked images.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::image::MemoryProfile;
use crate::store::{StateStore, StoreError};

const BUCKET: &str = "deferrals";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeferralRecord {
    profiles: BTreeMap<String, MemoryProfile>,
    /// Set once [`DeferralStore::drain`] has handed the profiles out. A
    /// drained record never yields profiles again, even if the orchestrator
    /// step that called drain is itself retried.
    drained: bool,
}

pub struct DeferralStore {
    store: Arc<dyn StateStore>,
}

impl DeferralStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn load(&self, job_id: &str) -> Result<DeferralRecord, StoreError> {
        match self.store.get(BUCKET, job_id)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(DeferralRecord::default()),
        }
    }

    fn save(&self, job_id: &str, record: &DeferralRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        self.store.put(BUCKET, job_id, &raw)
    }

    /// Park a memory-image profile during Identification.
    pub fn park(
        &self,
        job_id: &str,
        filename: &str,
        profile: MemoryProfile,
    ) -> Result<(), StoreError> {
        let mut record = self.load(job_id)?;
        debug!("parking memory image job_id={job_id} filename={filename}");
        record.profiles.insert(filename.to_string(), profile);
        self.save(job_id, &record)
    }

    /// Hand out every parked profile exactly once. The drained marker is
    /// persisted before the profiles are returned, so a second call after a
    /// successful drain returns an empty map.
    pub fn drain(&self, job_id: &str) -> Result<BTreeMap<String, MemoryProfile>, StoreError> {
        let mut record = self.load(job_id)?;
        if record.drained || record.profiles.is_empty() {
            return Ok(BTreeMap::new());
        }
        let profiles = std::mem::take(&mut record.profiles);
        record.drained = true;
        self.save(job_id, &record)?;
        Ok(profiles)
    }

    /// Whether undrained profiles are parked for this job.
    pub fn has_pending(&self, job_id: &str) -> Result<bool, StoreError> {
        let record = self.load(job_id)?;
        Ok(!record.drained && !record.profiles.is_empty())
    }

    /// Drop all deferral state for a job. Called when the job's other
    /// artifacts are garbage-collected.
    pub fn remove(&self, job_id: &str) -> Result<(), StoreError> {
        self.store.delete(BUCKET, job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageType, classify};
    use crate::store::MemoryStore;

    fn profile(name: &str) -> MemoryProfile {
        let image = classify(&format!("{name}::/data/mem::memory")).expect("classify");
        assert_eq!(image.image_type, ImageType::Memory);
        MemoryProfile::new(&image)
    }

    #[test]
    fn drain_returns_profiles_at_most_once() {
        let deferrals = DeferralStore::new(Arc::new(MemoryStore::new()));
        deferrals
            .park("job1", "mem.raw", profile("mem.raw"))
            .expect("park");
        deferrals
            .park("job1", "hiber.sys", profile("hiber.sys"))
            .expect("park");

        assert!(deferrals.has_pending("job1").expect("pending"));
        let drained = deferrals.drain("job1").expect("drain");
        assert_eq!(drained.len(), 2);
        assert!(!deferrals.has_pending("job1").expect("pending"));

        let second = deferrals.drain("job1").expect("drain again");
        assert!(second.is_empty());
    }

    #[test]
    fn jobs_do_not_share_deferral_state() {
        let deferrals = DeferralStore::new(Arc::new(MemoryStore::new()));
        deferrals
            .park("job1", "mem.raw", profile("mem.raw"))
            .expect("park");
        assert!(!deferrals.has_pending("job2").expect("pending"));
        assert!(deferrals.drain("job2").expect("drain").is_empty());
        assert!(deferrals.has_pending("job1").expect("pending"));
    }

    #[test]
    fn remove_clears_job_state() {
        let deferrals = DeferralStore::new(Arc::new(MemoryStore::new()));
        deferrals
            .park("job1", "mem.raw", profile("mem.raw"))
            .expect("park");
        deferrals.remove("job1").expect("remove");
        assert!(!deferrals.has_pending("job1").expect("pending"));
    }
}
