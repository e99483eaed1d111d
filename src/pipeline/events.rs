//! # Pipeline Events
//!
//! Events flowing from per-image workers to the orchestrator loop.

use crate::tool::ToolError;

/// A per-image step failure, split by how the orchestrator must react.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Retries spent on a resource-exhaustion signal. Fails the whole job.
    #[error("resource exhausted after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: ToolError },
    /// The tool failed for this image only. Recorded and the remaining
    /// images continue.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Events sent from phase workers to the orchestrator.
#[derive(Debug)]
pub enum PhaseEvent {
    /// A worker picked up an image.
    ImageStarted { index: usize, filename: String },
    /// The tool emitted a trigger message for an image.
    Trigger { filename: String, text: String },
    /// A worker finished an image, successfully or not.
    ImageDone {
        filename: String,
        result: Result<(), StepError>,
    },
}
