//! Isolation providers: the seam between the executor and whatever actually
//! runs task code.
//!
//! A provider receives a resolved [`RunRequest`] and returns an
//! [`ExecutionHandle`] exposing output, progress, the final [`Outcome`] and
//! a way to terminate the run. Two backends exist: a host subprocess with a
//! memory cap ([`ProcessProvider`]) and a docker container
//! ([`ContainerProvider`]).

pub mod container;
pub mod process;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use winlink_core::{ResourceLimits, TaskId};

use crate::config::{BackendKind, IsolationConfig};

pub use container::ContainerProvider;
pub use process::ProcessProvider;

/// Stdout lines with this prefix are progress reports, not output.
pub const PROGRESS_MARKER: &str = "##progress:";

const OUTPUT_BUFFER: usize = 256;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised before a run has started.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("Interpreter '{0}' is not available on this worker")]
    UnknownInterpreter(String),

    #[error("Failed to launch task: {0}")]
    Launch(#[from] std::io::Error),
}

/// Program text and the interpreter that runs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub interpreter: String,
    pub source: String,
}

/// Everything a provider needs to start one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: TaskId,
    pub program: Program,
    pub limits: ResourceLimits,
    /// Wall-clock budget; the provider terminates the run when it elapses.
    pub timeout: Duration,
}

impl RunRequest {
    pub fn new(task_id: TaskId, program: Program, limits: ResourceLimits) -> Self {
        Self {
            task_id,
            program,
            limits,
            timeout: Duration::from_secs(limits.timeout_s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of task output, newline included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The program exited on its own. Signals map to `-1`.
    Exited(i32),
    /// The wall-clock budget ran out.
    TimedOut,
    /// [`ExecutionHandle::terminate`] was called.
    Terminated,
    /// The run could not be observed to completion.
    Lost(String),
}

/// A started run.
///
/// The outcome is delivered only after both output streams are drained, so
/// every chunk is already buffered in `output` when it arrives.
pub struct ExecutionHandle {
    pub output: mpsc::Receiver<OutputChunk>,
    pub progress: mpsc::Receiver<u8>,
    pub outcome: oneshot::Receiver<Outcome>,
    terminate: CancellationToken,
}

impl ExecutionHandle {
    pub fn new(
        output: mpsc::Receiver<OutputChunk>,
        progress: mpsc::Receiver<u8>,
        outcome: oneshot::Receiver<Outcome>,
        terminate: CancellationToken,
    ) -> Self {
        Self {
            output,
            progress,
            outcome,
            terminate,
        }
    }

    /// Ask the provider to stop the run; the outcome becomes `Terminated`.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }
}

/// Something that can run task code in isolation.
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, request: RunRequest) -> Result<ExecutionHandle, IsolationError>;
}

/// Build the provider selected by configuration.
pub fn from_config(config: &IsolationConfig) -> Arc<dyn IsolationProvider> {
    match config.backend {
        BackendKind::Process => Arc::new(ProcessProvider::new(config.interpreters.clone())),
        BackendKind::Container => Arc::new(ContainerProvider::new(
            config.container.clone(),
            config.interpreters.clone(),
        )),
    }
}

/// Parse a `##progress:<n>` line, clamping to 100.
pub fn parse_progress(line: &str) -> Option<u8> {
    let value = line.trim().strip_prefix(PROGRESS_MARKER)?.trim();
    value.parse::<u32>().ok().map(|n| n.min(100) as u8)
}

/// Split a configured interpreter command line into program and arguments.
pub(crate) fn interpreter_argv(
    interpreters: &std::collections::BTreeMap<String, String>,
    name: &str,
) -> Result<Vec<String>, IsolationError> {
    let argv: Vec<String> = interpreters
        .get(name)
        .map(|command| command.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    if argv.is_empty() {
        return Err(IsolationError::UnknownInterpreter(name.to_string()));
    }
    Ok(argv)
}

/// Spawn `command`, feed it the program on stdin and watch it.
///
/// `on_terminate` receives the child's pid and may return a command that
/// runs before the child is killed when the run is stopped early, for
/// workloads that outlive the direct child.
pub(crate) fn spawn_supervised<F>(
    mut command: Command,
    request: &RunRequest,
    on_terminate: F,
) -> Result<ExecutionHandle, IsolationError>
where
    F: FnOnce(Option<u32>) -> Option<Command>,
{
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let on_terminate = on_terminate(child.id());

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
    let (progress_tx, progress_rx) = mpsc::channel(OUTPUT_BUFFER);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let terminate = CancellationToken::new();

    if let Some(mut stdin) = child.stdin.take() {
        let source = request.program.source.clone();
        let task_id = request.task_id.clone();
        tokio::spawn(async move {
            let result = async {
                stdin.write_all(source.as_bytes()).await?;
                if !source.ends_with('\n') {
                    stdin.write_all(b"\n").await?;
                }
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = result {
                debug!(task_id = %task_id, error = %e, "Program stdin closed early");
            }
        });
    }

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(
            stdout,
            OutputStream::Stdout,
            output_tx.clone(),
            Some(progress_tx),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(
            stderr,
            OutputStream::Stderr,
            output_tx,
            None,
        )));
    }

    tokio::spawn(supervise(
        child,
        request.task_id.clone(),
        request.timeout,
        terminate.clone(),
        on_terminate,
        readers,
        outcome_tx,
    ));

    Ok(ExecutionHandle::new(output_rx, progress_rx, outcome_rx, terminate))
}

async fn read_lines<R>(
    reader: R,
    stream: OutputStream,
    output: mpsc::Sender<OutputChunk>,
    progress: Option<mpsc::Sender<u8>>,
) where
    R: AsyncRead + Unpin,
{
    // Task output is arbitrary bytes; the pipe is drained to EOF even when
    // nobody listens so the child never blocks or dies on a closed pipe.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !forwarding {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if let (Some(progress), Some(value)) = (&progress, parse_progress(&line)) {
                    let _ = progress.send(value).await;
                    continue;
                }
                let chunk = OutputChunk { stream, text: line };
                if output.send(chunk).await.is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                warn!(?stream, error = %e, "Error reading task output");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    task_id: TaskId,
    timeout: Duration,
    terminate: CancellationToken,
    on_terminate: Option<Command>,
    readers: Vec<JoinHandle<()>>,
    outcome_tx: oneshot::Sender<Outcome>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Outcome::Exited(status.code().unwrap_or(-1)),
            Err(e) => Outcome::Lost(e.to_string()),
        },
        _ = terminate.cancelled() => {
            stop(&mut child, &task_id, on_terminate).await;
            Outcome::Terminated
        }
        _ = tokio::time::sleep(timeout) => {
            stop(&mut child, &task_id, on_terminate).await;
            Outcome::TimedOut
        }
    };

    for reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            warn!(task_id = %task_id, "Output still open after exit, abandoning it");
        }
    }

    debug!(task_id = %task_id, ?outcome, "Run finished");
    let _ = outcome_tx.send(outcome);
}

async fn stop(child: &mut Child, task_id: &TaskId, on_terminate: Option<Command>) {
    if let Some(mut hook) = on_terminate {
        match tokio::time::timeout(DRAIN_TIMEOUT, hook.status()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(task_id = %task_id, error = %e, "Terminate hook failed"),
            Err(_) => warn!(task_id = %task_id, "Terminate hook timed out"),
        }
    }
    if let Err(e) = child.kill().await {
        debug!(task_id = %task_id, error = %e, "Kill failed, process already gone");
    }
}
