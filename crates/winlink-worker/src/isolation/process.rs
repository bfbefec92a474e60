//! Host subprocess backend.
//!
//! The interpreter reads the program from stdin. On Unix the run is wrapped
//! in `sh -c 'ulimit -v ...; exec ...'` so the address space is capped at the
//! task's memory limit and placed in its own process group, which is killed
//! as a whole on terminate. CPU share is not enforced by this backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{
    interpreter_argv, spawn_supervised, ExecutionHandle, IsolationError, IsolationProvider,
    RunRequest,
};

pub struct ProcessProvider {
    interpreters: BTreeMap<String, String>,
}

impl ProcessProvider {
    pub fn new(interpreters: BTreeMap<String, String>) -> Self {
        Self { interpreters }
    }

    /// Command line for a request, memory cap included.
    pub fn command_line(&self, request: &RunRequest) -> Result<Vec<String>, IsolationError> {
        let argv = interpreter_argv(&self.interpreters, &request.program.interpreter)?;
        if !cfg!(unix) {
            return Ok(argv);
        }

        let limit_kb = request.limits.max_memory_mb.saturating_mul(1024);
        let mut line = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("ulimit -v {} && exec \"$@\"", limit_kb),
            "winlink-task".to_string(),
        ];
        line.extend(argv);
        Ok(line)
    }
}

#[async_trait]
impl IsolationProvider for ProcessProvider {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, request: RunRequest) -> Result<ExecutionHandle, IsolationError> {
        let line = self.command_line(&request)?;
        debug!(task_id = %request.task_id, command = ?line, "Spawning task process");

        let mut command = Command::new(&line[0]);
        command
            .args(&line[1..])
            .env("WINLINK_TASK_ID", request.task_id.as_str());

        #[cfg(unix)]
        {
            command.process_group(0);
            spawn_supervised(command, &request, |pid| pid.map(kill_group))
        }
        #[cfg(not(unix))]
        {
            spawn_supervised(command, &request, |_| None)
        }
    }
}

/// `kill -KILL -- -<pgid>`: the interpreter and everything it started.
#[cfg(unix)]
fn kill_group(pgid: u32) -> Command {
    let mut command = Command::new("kill");
    let group = format!("-{}", pgid);
    command.args(["-KILL", "--", group.as_str()]);
    command
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::isolation::{Outcome, OutputStream, Program};
    use std::time::Duration;
    use winlink_core::{ResourceLimits, TaskId};

    fn provider() -> ProcessProvider {
        let mut interpreters = BTreeMap::new();
        interpreters.insert("sh".to_string(), "sh -s".to_string());
        ProcessProvider::new(interpreters)
    }

    fn request(source: &str) -> RunRequest {
        RunRequest::new(
            TaskId::new("proc-test"),
            Program {
                interpreter: "sh".to_string(),
                source: source.to_string(),
            },
            ResourceLimits::new(50, 256, 30),
        )
    }

    async fn collect(mut handle: ExecutionHandle) -> (String, String, Vec<u8>, Outcome) {
        let outcome = (&mut handle.outcome).await.unwrap();
        let (mut stdout, mut stderr, mut progress) = (String::new(), String::new(), Vec::new());
        while let Ok(chunk) = handle.output.try_recv() {
            match chunk.stream {
                OutputStream::Stdout => stdout.push_str(&chunk.text),
                OutputStream::Stderr => stderr.push_str(&chunk.text),
            }
        }
        while let Ok(value) = handle.progress.try_recv() {
            progress.push(value);
        }
        (stdout, stderr, progress, outcome)
    }

    #[test]
    fn test_command_line_caps_memory() {
        let line = provider().command_line(&request("true")).unwrap();
        assert_eq!(line[0], "sh");
        assert!(line[2].contains("ulimit -v 262144"));
        assert_eq!(&line[4..], &["sh", "-s"]);
    }

    #[tokio::test]
    async fn test_runs_program_and_splits_streams() {
        let handle = provider()
            .run(request(
                "echo hello\necho '##progress:50'\necho oops >&2\nexit 3",
            ))
            .await
            .unwrap();

        let (stdout, stderr, progress, outcome) = collect(handle).await;
        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "oops\n");
        assert_eq!(progress, vec![50]);
        assert_eq!(outcome, Outcome::Exited(3));
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_streaming() {
        let handle = provider()
            .run(request(
                "printf '\\377\\n'\necho after\nhead -c 200000 /dev/zero | tr '\\0' a\necho\nexit 0",
            ))
            .await
            .unwrap();

        let (stdout, _, _, outcome) = collect(handle).await;
        assert_eq!(outcome, Outcome::Exited(0));
        assert!(stdout.starts_with("\u{FFFD}\n"));
        assert!(stdout.contains("after\n"));
        assert!(stdout.len() > 200_000);
    }

    #[tokio::test]
    async fn test_terminate_stops_run() {
        let handle = provider().run(request("sleep 30")).await.unwrap();
        handle.terminate();
        let (_, _, _, outcome) = collect(handle).await;
        assert_eq!(outcome, Outcome::Terminated);
    }

    #[tokio::test]
    async fn test_timeout_stops_run() {
        let mut req = request("sleep 30");
        req.timeout = Duration::from_millis(200);
        let handle = provider().run(req).await.unwrap();
        let (_, _, _, outcome) = collect(handle).await;
        assert_eq!(outcome, Outcome::TimedOut);
    }

    #[tokio::test]
    async fn test_unknown_interpreter() {
        let mut req = request("print(1)");
        req.program.interpreter = "python".to_string();
        let result = provider().run(req).await;
        assert!(matches!(result, Err(IsolationError::UnknownInterpreter(_))));
    }
}
