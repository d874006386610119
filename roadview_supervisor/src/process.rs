//! Child-process workers and their line-oriented JSON IPC.
//!
//! ```text
//!  supervisor                          roadview worker --spec <json>
//! ┌──────────────┐  stdin: ControlCommand lines  ┌────────────────┐
//! │ ProcessWorker│ ─────────────────────────────▶│ control thread │──▶ WorkerSignals
//! │              │                               │                │
//! │ stdout task  │◀───────────────────────────── │ writer thread  │◀── ResultQueue
//! └──────┬───────┘  stdout: WorkerEvent lines    └────────────────┘
//!        ▼
//!   ResultQueue (drop-oldest, parent side)
//! ```
//!
//! EOF on the child's stdin means the parent is gone; the child stops.

use crate::error::SupervisorError;
use crate::launcher::{WorkerHandle, WorkerLauncher, WorkerProcess};
use anyhow::Context;
use async_trait::async_trait;
use roadview_core::{build_pipeline, ResultQueue, WorkerEvent, WorkerExit, WorkerSignals, WorkerSpec};
use roadview_env::SystemClock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Parent-to-child control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Stop,
    Backpressure { on: bool },
}

/// Encodes one message as a JSON line (with trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one JSON line; surrounding whitespace is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

// ============================================================================
// PARENT SIDE
// ============================================================================

/// Launches each worker as `<exe> worker --spec <json>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
}

impl ProcessLauncher {
    /// Re-executes the running binary.
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe().map_err(|e| SupervisorError::WorkerLaunch(e.to_string()))?;
        Ok(Self { exe })
    }

    pub fn with_executable(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle, SupervisorError> {
        let spec_json = serde_json::to_string(&spec).map_err(|e| SupervisorError::WorkerLaunch(e.to_string()))?;

        let mut child = Command::new(&self.exe)
            .arg("worker")
            .arg("--spec")
            .arg(spec_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::WorkerLaunch(format!("{}: {}", self.exe.display(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::WorkerLaunch("child stdout unavailable".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::WorkerLaunch("child stdin unavailable".to_string()))?;

        let queue = spec.result_queue();
        let stdout_open = Arc::new(AtomicBool::new(true));
        tokio::spawn(read_events(stdout, queue.clone(), stdout_open.clone(), spec.feed_id.clone()));

        let (control, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_commands(stdin, control_rx));

        let pid = child.id().unwrap_or_default();
        debug!("Launched worker process {} for {}", pid, spec.feed_id);

        Ok(WorkerHandle {
            queue,
            process: Box::new(ProcessWorker {
                feed_id: spec.feed_id,
                pid,
                child,
                control,
                stdout_open,
                backpressure: AtomicBool::new(false),
            }),
        })
    }
}

async fn read_events(
    stdout: ChildStdout,
    queue: Arc<ResultQueue<WorkerEvent>>,
    open: Arc<AtomicBool>,
    feed_id: String,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line::<WorkerEvent>(&line) {
                Ok(event) => {
                    queue.push(event);
                }
                Err(e) => warn!("Undecodable event from {}: {}", feed_id, e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Event stream from {} failed: {}", feed_id, e);
                break;
            }
        }
    }
    queue.close();
    open.store(false, Ordering::SeqCst);
}

async fn write_commands(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<ControlCommand>) {
    while let Some(command) = commands.recv().await {
        let line = match encode_line(&command) {
            Ok(line) => line,
            Err(e) => {
                warn!("Cannot encode {:?}: {}", command, e);
                continue;
            }
        };
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            // Child already gone
            break;
        }
    }
}

struct ProcessWorker {
    feed_id: String,
    pid: u32,
    child: Child,
    control: mpsc::UnboundedSender<ControlCommand>,
    stdout_open: Arc<AtomicBool>,
    backpressure: AtomicBool,
}

#[async_trait]
impl WorkerProcess for ProcessWorker {
    /// Alive until the child has exited and every line it wrote is queued.
    fn is_alive(&mut self) -> bool {
        let running = matches!(self.child.try_wait(), Ok(None));
        running || self.stdout_open.load(Ordering::SeqCst)
    }

    fn signal_stop(&self) {
        let _ = self.control.send(ControlCommand::Stop);
    }

    fn set_backpressure(&self, on: bool) {
        if self.backpressure.swap(on, Ordering::Relaxed) != on {
            let _ = self.control.send(ControlCommand::Backpressure { on });
        }
    }

    async fn wait(&mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Worker {} ({}) exited: {}", self.feed_id, self.pid, status);
                true
            }
            Ok(Err(e)) => {
                warn!("Waiting on worker {} failed: {}", self.feed_id, e);
                false
            }
            Err(_) => false,
        }
    }

    async fn terminate(&mut self) -> Result<(), SupervisorError> {
        self.child
            .start_kill()
            .map_err(|e| SupervisorError::ProcessTermination(format!("pid {}: {}", self.pid, e)))?;
        self.child
            .wait()
            .await
            .map_err(|e| SupervisorError::ProcessTermination(format!("pid {}: {}", self.pid, e)))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("pid {}", self.pid)
    }
}

// ============================================================================
// CHILD SIDE
// ============================================================================

/// How long the stdout writer waits for an event before rechecking.
const WRITER_POLL: Duration = Duration::from_millis(100);

/// Entry point of `roadview worker`: runs one worker, streaming its events
/// to stdout and obeying control commands from stdin.
pub fn worker_main(spec: WorkerSpec) -> anyhow::Result<WorkerExit> {
    let queue = spec.result_queue();
    let signals = WorkerSignals::new();

    {
        let signals = signals.clone();
        std::thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    match decode_line::<ControlCommand>(&line) {
                        Ok(ControlCommand::Stop) => signals.request_stop(),
                        Ok(ControlCommand::Backpressure { on }) => signals.set_backpressure(on),
                        Err(e) => warn!("Ignoring control line: {}", e),
                    }
                }
                // Parent closed our stdin
                signals.request_stop();
            })
            .context("spawning control thread")?;
    }

    let writer = {
        let queue = queue.clone();
        std::thread::Builder::new()
            .name("events".to_string())
            .spawn(move || -> anyhow::Result<()> {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                loop {
                    match queue.pop_timeout(WRITER_POLL) {
                        Some(event) => {
                            out.write_all(encode_line(&event)?.as_bytes())?;
                            out.flush()?;
                        }
                        None if queue.is_closed() && queue.is_empty() => return Ok(()),
                        None => {}
                    }
                }
            })
            .context("spawning event writer thread")?
    };

    let feed_id = spec.feed_id.clone();
    let exit = match build_pipeline(&spec, Arc::new(SystemClock::new())) {
        Ok(parts) => spec.into_loop(parts, queue.clone(), signals).run(),
        Err(e) => {
            let reason = format!("cannot open source: {e}");
            queue.push(WorkerEvent::Fatal {
                feed_id,
                reason: reason.clone(),
            });
            queue.close();
            WorkerExit::Failed(reason)
        }
    };

    writer
        .join()
        .map_err(|_| anyhow::anyhow!("event writer thread panicked"))?
        .context("writing events to stdout")?;
    Ok(exit)
}
