//! Task executor.
//!
//! Turns `task_submit` messages into isolated runs and reports their
//! progress back as `task_update` messages on the worker's outbound queue.
//! Concurrency is bounded by a semaphore sized to the declared capacity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use winlink_core::{Payload, TaskError, TaskId, TaskStatus, TaskUpdate};
use winlink_proto::{Message, TaskSubmit, TaskUpdateMsg};

use crate::config::{LocalPolicy, TemplateConfig, WorkerConfig};
use crate::isolation::{
    ExecutionHandle, IsolationError, IsolationProvider, Outcome, OutputStream, Program,
    RunRequest,
};

/// Reasons a task fails before or while starting.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Rejected(#[from] TaskError),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error("Executor is shutting down")]
    Closed,
}

/// A task this worker owns until its terminal update reaches the master.
struct TaskControl {
    cancel: CancellationToken,
    cancel_reason: Option<String>,
}

pub struct Executor {
    provider: Arc<dyn IsolationProvider>,
    policy: LocalPolicy,
    templates: BTreeMap<String, TemplateConfig>,
    slots: Arc<Semaphore>,
    tasks: Mutex<HashMap<TaskId, TaskControl>>,
    update_interval: Duration,
    updates: mpsc::Sender<Message>,
}

impl Executor {
    pub fn new(
        config: &WorkerConfig,
        provider: Arc<dyn IsolationProvider>,
        updates: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            provider,
            policy: config.policy,
            templates: config.template_table(),
            slots: Arc::new(Semaphore::new(config.capacity.max_tasks as usize)),
            tasks: Mutex::new(HashMap::new()),
            update_interval: config.update_interval(),
            updates,
        }
    }

    /// Accept a dispatched task and start it in the background.
    ///
    /// A task already owned by this worker is ignored.
    pub async fn submit(self: &Arc<Self>, submit: TaskSubmit) {
        let task_id = submit.task_id.clone();
        let cancel = CancellationToken::new();
        {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(&task_id) {
                warn!(task_id = %task_id, "Ignoring duplicate dispatch");
                return;
            }
            tasks.insert(
                task_id.clone(),
                TaskControl {
                    cancel: cancel.clone(),
                    cancel_reason: None,
                },
            );
        }

        let request = match self.prepare(&submit) {
            Ok(request) => request,
            Err(e) => {
                warn!(task_id = %task_id, reason = %e, "Rejecting task");
                self.report(&task_id, TaskUpdate::new(TaskStatus::Failed).with_error(e.to_string()))
                    .await;
                return;
            }
        };

        info!(
            task_id = %task_id,
            name = %submit.metadata.name,
            priority = %submit.priority,
            backend = self.provider.name(),
            "Accepted task"
        );
        tokio::spawn(self.clone().run_task(request, cancel));
    }

    /// Stop a task. Unknown ids are ignored.
    pub async fn cancel(&self, task_id: &TaskId, reason: &str) {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(task_id) {
            Some(control) => {
                info!(task_id = %task_id, reason, "Cancelling task");
                control.cancel_reason = Some(reason.to_string());
                control.cancel.cancel();
            }
            None => debug!(task_id = %task_id, "Cancel for a task not held here"),
        }
    }

    /// Cancel everything, used on shutdown.
    pub async fn cancel_all(&self, reason: &str) {
        let mut tasks = self.tasks.lock().await;
        for control in tasks.values_mut() {
            control.cancel_reason = Some(reason.to_string());
            control.cancel.cancel();
        }
    }

    /// The terminal update for `task_id` has been written to the master.
    pub async fn reported(&self, task_id: &TaskId) {
        self.tasks.lock().await.remove(task_id);
    }

    /// Tasks this worker still owns, reported on (re)registration.
    pub async fn active_tasks(&self) -> Vec<TaskId> {
        self.tasks.lock().await.keys().cloned().collect()
    }

    pub async fn load(&self) -> u32 {
        self.tasks.lock().await.len() as u32
    }

    fn prepare(&self, submit: &TaskSubmit) -> Result<RunRequest, ExecutorError> {
        self.policy.check(&submit.resources)?;
        let program = self.resolve(&submit.payload)?;
        Ok(RunRequest::new(
            submit.task_id.clone(),
            program,
            submit.resources,
        ))
    }

    /// Turn a payload into program text, expanding templates.
    fn resolve(&self, payload: &Payload) -> Result<Program, ExecutorError> {
        match payload {
            Payload::Code {
                interpreter,
                source,
            } => Ok(Program {
                interpreter: interpreter.clone(),
                source: source.clone(),
            }),
            Payload::Template { name, params } => {
                let template = self
                    .templates
                    .get(name)
                    .ok_or_else(|| ExecutorError::UnknownTemplate(name.clone()))?;
                let mut values = template.defaults.clone();
                values.extend(params.clone());
                let source = values.iter().fold(template.source.clone(), |source, (key, value)| {
                    source.replace(&format!("{{{{{}}}}}", key), value)
                });
                Ok(Program {
                    interpreter: template.interpreter.clone(),
                    source,
                })
            }
        }
    }

    async fn run_task(self: Arc<Self>, request: RunRequest, cancel: CancellationToken) {
        let task_id = request.task_id.clone();

        let _permit = tokio::select! {
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let reason = ExecutorError::Closed.to_string();
                    self.report(&task_id, TaskUpdate::new(TaskStatus::Failed).with_error(reason))
                        .await;
                    return;
                }
            },
            _ = cancel.cancelled() => {
                let reason = self.cancel_reason(&task_id).await;
                self.report(&task_id, TaskUpdate::new(TaskStatus::Cancelled).with_error(reason))
                    .await;
                return;
            }
        };

        self.report(&task_id, TaskUpdate::new(TaskStatus::Running))
            .await;

        let timeout = request.timeout;
        let handle = match self.provider.run(request).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = ExecutorError::from(e).to_string();
                warn!(task_id = %task_id, reason = %reason, "Failed to launch task");
                self.report(&task_id, TaskUpdate::new(TaskStatus::Failed).with_error(reason))
                    .await;
                return;
            }
        };

        let update = self.watch(&task_id, handle, &cancel, timeout).await;
        info!(
            task_id = %task_id,
            status = %update.status,
            reason = update.error_reason.as_deref().unwrap_or(""),
            "Task finished"
        );
        self.report(&task_id, update).await;
    }

    /// Relay output and progress until the run ends; returns the final update.
    async fn watch(
        &self,
        task_id: &TaskId,
        mut handle: ExecutionHandle,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> TaskUpdate {
        let mut output = PendingOutput::default();
        let mut cancelled = false;

        let mut flush = tokio::time::interval_at(
            Instant::now() + self.update_interval,
            self.update_interval,
        );
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    handle.terminate();
                }
                Some(chunk) = handle.output.recv() => output.push(chunk.stream, &chunk.text),
                Some(value) = handle.progress.recv() => output.advance(value),
                _ = flush.tick() => {
                    if let Some(update) = output.take_running() {
                        self.report(task_id, update).await;
                    }
                }
                outcome = &mut handle.outcome => {
                    break outcome.unwrap_or_else(|_| Outcome::Lost("run supervisor vanished".to_string()));
                }
            }
        };

        while let Ok(chunk) = handle.output.try_recv() {
            output.push(chunk.stream, &chunk.text);
        }
        while let Ok(value) = handle.progress.try_recv() {
            output.advance(value);
        }

        let update = match outcome {
            _ if cancelled => {
                TaskUpdate::new(TaskStatus::Cancelled).with_error(self.cancel_reason(task_id).await)
            }
            Outcome::Exited(0) => {
                output.progress = 100;
                TaskUpdate::new(TaskStatus::Succeeded)
            }
            Outcome::Exited(code) => {
                let reason = match &output.last_stderr_line {
                    Some(line) => format!("exit status {}: {}", code, line),
                    None => format!("exit status {}", code),
                };
                TaskUpdate::new(TaskStatus::Failed).with_error(reason)
            }
            Outcome::TimedOut => TaskUpdate::new(TaskStatus::TimedOut)
                .with_error(format!("timed out after {}s", timeout.as_secs())),
            Outcome::Terminated => {
                TaskUpdate::new(TaskStatus::Cancelled).with_error(self.cancel_reason(task_id).await)
            }
            Outcome::Lost(reason) => TaskUpdate::new(TaskStatus::Failed).with_error(reason),
        };

        update
            .with_progress(output.progress)
            .with_output(output.stdout, output.stderr)
    }

    async fn cancel_reason(&self, task_id: &TaskId) -> String {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .and_then(|control| control.cancel_reason.clone())
            .unwrap_or_else(|| "cancelled".to_string())
    }

    async fn report(&self, task_id: &TaskId, update: TaskUpdate) {
        let message = Message::TaskUpdate(TaskUpdateMsg::new(task_id.clone(), update));
        if self.updates.send(message).await.is_err() {
            warn!(task_id = %task_id, "Outbound queue closed, dropping task update");
        }
    }
}

/// Output and progress accumulated since the last update.
#[derive(Default)]
struct PendingOutput {
    stdout: String,
    stderr: String,
    progress: u8,
    last_stderr_line: Option<String>,
    dirty: bool,
}

impl PendingOutput {
    fn push(&mut self, stream: OutputStream, text: &str) {
        match stream {
            OutputStream::Stdout => self.stdout.push_str(text),
            OutputStream::Stderr => {
                self.stderr.push_str(text);
                let line = text.trim();
                if !line.is_empty() {
                    self.last_stderr_line = Some(line.to_string());
                }
            }
        }
        self.dirty = true;
    }

    /// Progress only moves forward.
    fn advance(&mut self, value: u8) {
        if value > self.progress {
            self.progress = value;
            self.dirty = true;
        }
    }

    fn take_running(&mut self) -> Option<TaskUpdate> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(
            TaskUpdate::new(TaskStatus::Running)
                .with_progress(self.progress)
                .with_output(
                    std::mem::take(&mut self.stdout),
                    std::mem::take(&mut self.stderr),
                ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use winlink_core::{Priority, ResourceLimits, WorkerCapacity};
    use winlink_proto::SubmitMetadata;

    use crate::isolation::OutputChunk;

    #[derive(Clone)]
    enum Script {
        Exit {
            stdout: Vec<&'static str>,
            stderr: Vec<&'static str>,
            progress: Vec<u8>,
            code: i32,
        },
        Hang,
        LaunchError,
    }

    struct ScriptedProvider {
        script: Script,
        calls: AtomicU32,
        programs: std::sync::Mutex<Vec<Program>>,
    }

    impl ScriptedProvider {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
                programs: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl IsolationProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, request: RunRequest) -> Result<ExecutionHandle, IsolationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.programs.lock().unwrap().push(request.program.clone());

            let (output_tx, output_rx) = mpsc::channel(16);
            let (progress_tx, progress_rx) = mpsc::channel(16);
            let (outcome_tx, outcome_rx) = oneshot::channel();
            let terminate = CancellationToken::new();
            let stop = terminate.clone();

            let script = self.script.clone();
            if let Script::LaunchError = script {
                return Err(IsolationError::UnknownInterpreter("cobol".to_string()));
            }

            tokio::spawn(async move {
                let outcome = match script {
                    Script::Exit {
                        stdout,
                        stderr,
                        progress,
                        code,
                    } => {
                        for value in progress {
                            progress_tx.send(value).await.unwrap();
                        }
                        for (lines, stream) in
                            [(stdout, OutputStream::Stdout), (stderr, OutputStream::Stderr)]
                        {
                            for line in lines {
                                let chunk = OutputChunk {
                                    stream,
                                    text: line.to_string(),
                                };
                                output_tx.send(chunk).await.unwrap();
                            }
                        }
                        Outcome::Exited(code)
                    }
                    Script::Hang => tokio::select! {
                        _ = stop.cancelled() => Outcome::Terminated,
                        _ = tokio::time::sleep(request.timeout) => Outcome::TimedOut,
                    },
                    Script::LaunchError => unreachable!(),
                };
                drop(output_tx);
                drop(progress_tx);
                let _ = outcome_tx.send(outcome);
            });

            Ok(ExecutionHandle::new(
                output_rx,
                progress_rx,
                outcome_rx,
                terminate,
            ))
        }
    }

    fn config(max_tasks: u32) -> WorkerConfig {
        let mut config = WorkerConfig {
            capacity: WorkerCapacity::new(100, 2048, max_tasks),
            policy: LocalPolicy {
                max_cpu: 100,
                max_memory_mb: 1024,
                max_timeout_s: 600,
            },
            update_interval_ms: 500,
            ..WorkerConfig::default()
        };
        config.templates.insert(
            "greet".to_string(),
            TemplateConfig {
                interpreter: "sh".to_string(),
                source: "echo hello {{who}} from {{place}}".to_string(),
                defaults: [("place".to_string(), "home".to_string())].into(),
            },
        );
        config
    }

    fn executor(
        script: Script,
        max_tasks: u32,
    ) -> (Arc<Executor>, Arc<ScriptedProvider>, mpsc::Receiver<Message>) {
        let provider = ScriptedProvider::new(script);
        let (tx, rx) = mpsc::channel(64);
        let executor = Arc::new(Executor::new(&config(max_tasks), provider.clone(), tx));
        (executor, provider, rx)
    }

    fn submit(id: &str, payload: Payload, resources: ResourceLimits) -> TaskSubmit {
        TaskSubmit {
            task_id: TaskId::new(id),
            metadata: SubmitMetadata {
                name: id.to_string(),
            },
            payload,
            resources,
            priority: Priority::Normal,
        }
    }

    fn code(id: &str) -> TaskSubmit {
        submit(id, Payload::code("sh", "echo hello"), ResourceLimits::new(10, 64, 30))
    }

    async fn next_update(rx: &mut mpsc::Receiver<Message>) -> TaskUpdateMsg {
        match tokio::time::timeout(Duration::from_secs(60), rx.recv()).await {
            Ok(Some(Message::TaskUpdate(update))) => update,
            other => panic!("expected task update, got {:?}", other),
        }
    }

    /// Updates for one task up to and including the terminal one.
    async fn until_terminal(rx: &mut mpsc::Receiver<Message>) -> Vec<TaskUpdateMsg> {
        let mut updates = Vec::new();
        loop {
            let update = next_update(rx).await;
            let done = update.status.is_terminal();
            updates.push(update);
            if done {
                return updates;
            }
        }
    }

    #[tokio::test]
    async fn test_success_reports_running_then_succeeded() {
        let (executor, _, mut rx) = executor(
            Script::Exit {
                stdout: vec!["hello\n", "world\n"],
                stderr: vec![],
                progress: vec![30, 20, 70],
                code: 0,
            },
            2,
        );
        executor.submit(code("t1")).await;

        let updates = until_terminal(&mut rx).await;
        assert_eq!(updates[0].status, TaskStatus::Running);
        assert_eq!(updates[0].progress, 0);

        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Succeeded);
        assert_eq!(last.progress, 100);
        let stdout: String = updates.iter().map(|u| u.stdout_delta.as_str()).collect();
        assert_eq!(stdout, "hello\nworld\n");

        let progress: Vec<u8> = updates.iter().map(|u| u.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr() {
        let (executor, _, mut rx) = executor(
            Script::Exit {
                stdout: vec![],
                stderr: vec!["Traceback\n", "ValueError: bad input\n"],
                progress: vec![],
                code: 2,
            },
            1,
        );
        executor.submit(code("t1")).await;

        let updates = until_terminal(&mut rx).await;
        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Failed);
        assert_eq!(
            last.error_reason.as_deref(),
            Some("exit status 2: ValueError: bad input")
        );
        let stderr: String = updates.iter().map(|u| u.stderr_delta.as_str()).collect();
        assert!(stderr.contains("Traceback"));
    }

    #[tokio::test]
    async fn test_limits_above_policy_fail_without_running() {
        let (executor, provider, mut rx) = executor(Script::Hang, 1);
        executor
            .submit(submit(
                "big",
                Payload::code("sh", "true"),
                ResourceLimits::new(10, 4096, 30),
            ))
            .await;

        let update = next_update(&mut rx).await;
        assert_eq!(update.status, TaskStatus::Failed);
        assert!(update
            .error_reason
            .unwrap()
            .starts_with("ResourceLimitExceeded"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        // Still owned until the update is known to be delivered.
        assert_eq!(executor.active_tasks().await, vec![TaskId::new("big")]);
        executor.reported(&TaskId::new("big")).await;
        assert!(executor.active_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_template_is_expanded() {
        let (executor, provider, mut rx) = executor(
            Script::Exit {
                stdout: vec![],
                stderr: vec![],
                progress: vec![],
                code: 0,
            },
            1,
        );
        let mut params = BTreeMap::new();
        params.insert("who".to_string(), "ops".to_string());
        params.insert("place".to_string(), "rack 4".to_string());
        executor
            .submit(submit(
                "tpl",
                Payload::Template {
                    name: "greet".to_string(),
                    params,
                },
                ResourceLimits::new(10, 64, 30),
            ))
            .await;
        until_terminal(&mut rx).await;

        let programs = provider.programs.lock().unwrap().clone();
        assert_eq!(
            programs,
            vec![Program {
                interpreter: "sh".to_string(),
                source: "echo hello ops from rack 4".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_template_defaults_fill_missing_params() {
        let (executor, provider, mut rx) = executor(
            Script::Exit {
                stdout: vec![],
                stderr: vec![],
                progress: vec![],
                code: 0,
            },
            1,
        );
        let params: BTreeMap<String, String> = [("who".to_string(), "ops".to_string())].into();
        executor
            .submit(submit(
                "tpl",
                Payload::Template {
                    name: "greet".to_string(),
                    params,
                },
                ResourceLimits::new(10, 64, 30),
            ))
            .await;
        until_terminal(&mut rx).await;
        executor
            .submit(submit(
                "fib",
                Payload::template("fibonacci"),
                ResourceLimits::new(10, 64, 30),
            ))
            .await;
        until_terminal(&mut rx).await;

        let programs = provider.programs.lock().unwrap().clone();
        assert_eq!(programs[0].source, "echo hello ops from home");
        assert_eq!(programs[1].interpreter, "python");
        assert!(programs[1].source.contains(r#"n = int("10")"#));
    }

    #[tokio::test]
    async fn test_unknown_template_fails() {
        let (executor, provider, mut rx) = executor(Script::Hang, 1);
        executor
            .submit(submit(
                "tpl",
                Payload::template("missing"),
                ResourceLimits::new(10, 64, 30),
            ))
            .await;

        let update = next_update(&mut rx).await;
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(
            update.error_reason.as_deref(),
            Some("Unknown template: missing")
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_launch_error_fails() {
        let (executor, _, mut rx) = executor(Script::LaunchError, 1);
        executor.submit(code("t1")).await;

        let updates = until_terminal(&mut rx).await;
        assert_eq!(updates[0].status, TaskStatus::Running);
        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Failed);
        assert!(last.error_reason.as_deref().unwrap().contains("cobol"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_times_out() {
        let (executor, _, mut rx) = executor(Script::Hang, 1);
        executor
            .submit(submit(
                "slow",
                Payload::code("sh", "sleep 100"),
                ResourceLimits::new(10, 64, 2),
            ))
            .await;

        let updates = until_terminal(&mut rx).await;
        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::TimedOut);
        assert_eq!(last.error_reason.as_deref(), Some("timed out after 2s"));
    }

    #[tokio::test]
    async fn test_cancel_terminates_run() {
        let (executor, _, mut rx) = executor(Script::Hang, 1);
        executor.submit(code("t1")).await;
        assert_eq!(next_update(&mut rx).await.status, TaskStatus::Running);

        executor.cancel(&TaskId::new("t1"), "user request").await;

        let updates = until_terminal(&mut rx).await;
        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Cancelled);
        assert_eq!(last.error_reason.as_deref(), Some("user request"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_bound_concurrency() {
        let (executor, _, mut rx) = executor(Script::Hang, 1);
        executor.submit(code("first")).await;
        executor.submit(code("second")).await;

        let running = next_update(&mut rx).await;
        assert_eq!(running.task_id, TaskId::new("first"));
        assert_eq!(running.status, TaskStatus::Running);
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
        assert_eq!(executor.load().await, 2);

        executor.cancel(&TaskId::new("first"), "make room").await;
        let cancelled = next_update(&mut rx).await;
        assert_eq!(cancelled.task_id, TaskId::new("first"));
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let started = next_update(&mut rx).await;
        assert_eq!(started.task_id, TaskId::new("second"));
        assert_eq!(started.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_ignored() {
        let (executor, provider, mut rx) = executor(Script::Hang, 2);
        executor.submit(code("t1")).await;
        executor.submit(code("t1")).await;
        assert_eq!(next_update(&mut rx).await.status, TaskStatus::Running);

        executor.cancel_all("shutdown").await;
        until_terminal(&mut rx).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.active_tasks().await, vec![TaskId::new("t1")]);
    }
}
