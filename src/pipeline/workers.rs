//! # Phase Workers
//!
//! Bounded worker pool executing per-image tool invocations for one phase.
//! The pool size is a fixed cap, deliberately low: unbounded parallel file
//! operations against mounted images are the documented cause of
//! file-descriptor exhaustion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::guard::{GuardError, RetryPolicy, with_retry};
use crate::tool::{ToolRequest, ToolRunner};

use super::Phase;
use super::events::{PhaseEvent, StepError};

/// How often a streaming worker checks the stop flag while the tool is
/// quiet.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One image scheduled into a phase. `index` is the image's position in the
/// job's image list, which anchors its progress band.
#[derive(Debug, Clone)]
pub struct PhaseItem {
    pub index: usize,
    pub filename: String,
    pub locator: String,
}

pub fn spawn_phase_workers(
    workers: usize,
    phase: Phase,
    tools: Arc<dyn ToolRunner>,
    retry: RetryPolicy,
    stop_flag: Arc<AtomicBool>,
    rx: Receiver<PhaseItem>,
    event_tx: Sender<PhaseEvent>,
) -> Vec<thread::JoinHandle<()>> {
    let mut handles = Vec::new();
    let worker_count = workers.max(1);

    for _ in 0..worker_count {
        let tools = tools.clone();
        let retry = retry.clone();
        let stop_flag = stop_flag.clone();
        let rx = rx.clone();
        let event_tx = event_tx.clone();

        handles.push(thread::spawn(move || {
            for item in rx {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                if event_tx
                    .send(PhaseEvent::ImageStarted {
                        index: item.index,
                        filename: item.filename.clone(),
                    })
                    .is_err()
                {
                    warn!("event channel closed before image start");
                    break;
                }
                let result = run_image_step(phase, &tools, &retry, &stop_flag, &item, &event_tx);
                if event_tx
                    .send(PhaseEvent::ImageDone {
                        filename: item.filename.clone(),
                        result,
                    })
                    .is_err()
                {
                    warn!("event channel closed while reporting image completion");
                    break;
                }
            }
        }));
    }

    handles
}

/// Spawn the tool through the retry guard, stream its trigger messages, and
/// terminate it cooperatively if the stop flag is raised mid-stream.
fn run_image_step(
    phase: Phase,
    tools: &Arc<dyn ToolRunner>,
    retry: &RetryPolicy,
    stop_flag: &Arc<AtomicBool>,
    item: &PhaseItem,
    event_tx: &Sender<PhaseEvent>,
) -> Result<(), StepError> {
    let request = ToolRequest {
        phase,
        filename: item.filename.clone(),
        locator: item.locator.clone(),
        options: Vec::new(),
    };

    let spawn_result = with_retry(
        retry,
        || debug!("releasing cached handles before retry image={}", item.filename),
        || tools.run(&request),
    );

    let mut invocation = match spawn_result {
        Ok(invocation) => invocation,
        Err(GuardError::ResourceExhausted { attempts, source }) => {
            return Err(StepError::Exhausted { attempts, source });
        }
        Err(GuardError::Operation(err)) => return Err(StepError::Tool(err)),
    };

    let mut terminated = false;
    loop {
        match invocation.messages().recv_timeout(STOP_POLL_INTERVAL) {
            Ok(message) => {
                if event_tx
                    .send(PhaseEvent::Trigger {
                        filename: item.filename.clone(),
                        text: message.text,
                    })
                    .is_err()
                {
                    warn!("event channel closed while forwarding trigger");
                    invocation.terminate();
                    terminated = true;
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !terminated && stop_flag.load(Ordering::Relaxed) {
                    debug!("terminating in-flight tool image={}", item.filename);
                    invocation.terminate();
                    terminated = true;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    match invocation.wait() {
        Ok(()) => Ok(()),
        // A run we killed ourselves is not an image failure.
        Err(_) if terminated => Ok(()),
        Err(err) => Err(StepError::Tool(err)),
    }
}
