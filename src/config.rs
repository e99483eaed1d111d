use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::guard::RetryPolicy;
use crate::pipeline::{DeepArtifactPolicy, Phase, RunnerConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub image_workers: usize,
    pub progress_batch: u32,
    pub job_timeout_secs: u64,
    pub full_memory_analysis: bool,
    pub deep_artifact_policy: DeepArtifactPolicy,
    pub depth_budget_mib: u64,
    pub retry: RetryPolicy,
    /// External tool argv templates per phase. `{filename}` and `{locator}`
    /// expand per image.
    pub tools: BTreeMap<Phase, Vec<String>>,
}

impl Config {
    /// Build the orchestrator configuration. The worker cap never exceeds
    /// the machine's core count.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            image_workers: self.image_workers.clamp(1, num_cpus::get()),
            progress_batch: self.progress_batch.max(1),
            job_timeout: match self.job_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            deep_artifact_policy: self.deep_artifact_policy,
            depth_budget_mib: self.depth_budget_mib,
            retry: self.retry.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let config: Config = serde_yaml::from_slice(&bytes)?;
    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig {
        config,
        config_hash,
    })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}
