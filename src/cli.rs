use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Case identifier the job belongs to
    #[arg(short, long)]
    pub case: String,

    /// Image descriptor of form `filename::locator::type` (repeatable)
    #[arg(short, long = "image", required = true)]
    pub images: Vec<String>,

    /// Output directory for job state
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Per-image worker threads for collection/processing (overrides config)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Overall job timeout in seconds (overrides config)
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,

    /// Run the deferred-memory phase even with no parked memory images
    #[arg(long)]
    pub full_memory_analysis: bool,

    /// Use the scripted tool runner instead of external commands
    #[arg(long)]
    pub dry_run: bool,
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
