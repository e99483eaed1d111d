//! # External Tool Seam
//!
//! The orchestrator reaches all forensic tooling through one capability:
//! run a tool for a phase and stream its textual trigger messages back. The
//! tools themselves are opaque collaborators; nothing here inspects their
//! output beyond line framing.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};
use thiserror::Error;
use tracing::{debug, warn};

use crate::guard::ResourceSignal;
use crate::pipeline::Phase;

const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// A textual event emitted by an external tool invocation.
#[derive(Debug, Clone)]
pub struct TriggerMessage {
    pub text: String,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no tool command configured for phase {phase}")]
    NotConfigured { phase: &'static str },
    #[error("tool exited with status {status} for image {filename}")]
    Failed { status: i32, filename: String },
}

impl ResourceSignal for ToolError {
    fn is_exhaustion(&self) -> bool {
        match self {
            Self::Io(err) => err.is_exhaustion(),
            _ => false,
        }
    }
}

/// One tool run: a phase applied to a single image.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub phase: Phase,
    pub filename: String,
    pub locator: String,
    pub options: Vec<String>,
}

/// A live invocation streaming trigger messages. The message channel closes
/// when the tool finishes; `wait` then reports the exit outcome.
pub trait ToolInvocation: Send + std::fmt::Debug {
    fn messages(&self) -> &Receiver<TriggerMessage>;
    /// Cooperatively terminate the in-flight run and release its resources.
    fn terminate(&mut self);
    fn wait(&mut self) -> Result<(), ToolError>;
}

pub trait ToolRunner: Send + Sync {
    fn run(&self, request: &ToolRequest) -> Result<Box<dyn ToolInvocation>, ToolError>;
}

/// Runs configured external commands, one per phase, substituting
/// `{filename}` and `{locator}` into the argv template and streaming stdout
/// lines as trigger messages.
pub struct CommandToolRunner {
    commands: BTreeMap<Phase, Vec<String>>,
}

impl CommandToolRunner {
    pub fn new(commands: BTreeMap<Phase, Vec<String>>) -> Self {
        Self { commands }
    }
}

impl ToolRunner for CommandToolRunner {
    fn run(&self, request: &ToolRequest) -> Result<Box<dyn ToolInvocation>, ToolError> {
        let template = self
            .commands
            .get(&request.phase)
            .filter(|argv| !argv.is_empty())
            .ok_or(ToolError::NotConfigured {
                phase: request.phase.as_str(),
            })?;

        let argv: Vec<String> = template
            .iter()
            .map(|arg| {
                arg.replace("{filename}", &request.filename)
                    .replace("{locator}", &request.locator)
            })
            .chain(request.options.iter().cloned())
            .collect();

        debug!(
            "spawning tool phase={} image={} argv={:?}",
            request.phase.as_str(),
            request.filename,
            argv
        );

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()?;

        let stdout = child.stdout.take();
        let (tx, rx) = bounded::<TriggerMessage>(MESSAGE_CHANNEL_CAPACITY);
        let reader_handle = stdout.map(|out| {
            std::thread::spawn(move || {
                let reader = BufReader::new(out);
                for line in reader.lines() {
                    match line {
                        Ok(text) => {
                            if tx.send(TriggerMessage { text }).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!("tool stdout read error: {err}");
                            break;
                        }
                    }
                }
            })
        });

        Ok(Box::new(CommandInvocation {
            filename: request.filename.clone(),
            child,
            reader_handle,
            messages: rx,
        }))
    }
}

#[derive(Debug)]
struct CommandInvocation {
    filename: String,
    child: Child,
    reader_handle: Option<std::thread::JoinHandle<()>>,
    messages: Receiver<TriggerMessage>,
}

impl ToolInvocation for CommandInvocation {
    fn messages(&self) -> &Receiver<TriggerMessage> {
        &self.messages
    }

    fn terminate(&mut self) {
        if let Err(err) = self.child.kill() {
            debug!("tool already exited before terminate: {err}");
        }
    }

    fn wait(&mut self) -> Result<(), ToolError> {
        let status = self.child.wait()?;
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                status: status.code().unwrap_or(-1),
                filename: self.filename.clone(),
            })
        }
    }
}

/// Scripted runner used for dry runs and tests: emits the canonical trigger
/// sequence for each phase without touching any external tooling.
pub struct ScriptedToolRunner {
    delay: Duration,
    fail: std::sync::Mutex<Vec<(Phase, String)>>,
}

impl Default for ScriptedToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedToolRunner {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Pause between emitted messages, to let callers exercise cancellation
    /// mid-stream.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            fail: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Mark one image as failing in one phase (non-zero tool exit).
    pub fn fail_image(&self, phase: Phase, filename: &str) {
        if let Ok(mut fail) = self.fail.lock() {
            fail.push((phase, filename.to_string()));
        }
    }

    fn script_for(request: &ToolRequest) -> Vec<String> {
        let name = &request.filename;
        match request.phase {
            Phase::Identification => vec![
                format!("identification started for {name}"),
                format!("image mounted at {}", request.locator),
                format!("identification complete for {name}"),
            ],
            Phase::Collection => vec![
                format!("collection started for {name}"),
                format!("collecting artefacts from {name}"),
                format!("collection complete for {name}"),
            ],
            Phase::Processing => vec![
                format!("processing started for {name}"),
                format!("parsing artefacts from {name}"),
                format!("processing complete for {name}"),
            ],
            Phase::DeferredMemory => vec![
                format!("memory analysis started for {name}"),
                format!("memory analysis complete for {name}"),
            ],
            Phase::Analysis => vec![
                format!("analysis started for {name}"),
                format!("analysis complete for {name}"),
            ],
        }
    }
}

impl ToolRunner for ScriptedToolRunner {
    fn run(&self, request: &ToolRequest) -> Result<Box<dyn ToolInvocation>, ToolError> {
        let should_fail = self
            .fail
            .lock()
            .map(|fail| {
                fail.iter()
                    .any(|(p, f)| *p == request.phase && f == &request.filename)
            })
            .unwrap_or(false);

        let script = Self::script_for(request);
        let (tx, rx) = bounded::<TriggerMessage>(MESSAGE_CHANNEL_CAPACITY);
        let terminated = Arc::new(AtomicBool::new(false));

        let delay = self.delay;
        let thread_terminated = terminated.clone();
        let emit_count = if should_fail { 1 } else { script.len() };
        let handle = std::thread::spawn(move || {
            for text in script.into_iter().take(emit_count) {
                if thread_terminated.load(Ordering::Relaxed) {
                    break;
                }
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                if tx.send(TriggerMessage { text }).is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(ScriptedInvocation {
            filename: request.filename.clone(),
            messages: rx,
            terminated,
            handle: Some(handle),
            should_fail,
        }))
    }
}

#[derive(Debug)]
struct ScriptedInvocation {
    filename: String,
    messages: Receiver<TriggerMessage>,
    terminated: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
    should_fail: bool,
}

impl ToolInvocation for ScriptedInvocation {
    fn messages(&self) -> &Receiver<TriggerMessage> {
        &self.messages
    }

    fn terminate(&mut self) {
        self.terminated.store(true, Ordering::Relaxed);
    }

    fn wait(&mut self) -> Result<(), ToolError> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if self.terminated.load(Ordering::Relaxed) {
            return Ok(());
        }
        if self.should_fail {
            return Err(ToolError::Failed {
                status: 1,
                filename: self.filename.clone(),
            });
        }
        Ok(())
    }
}
