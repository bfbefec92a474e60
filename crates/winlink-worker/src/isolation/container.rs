//! Docker backend.
//!
//! Each run gets a throwaway container with no network, a read-only root,
//! all capabilities dropped and memory/CPU limits taken from the task. The
//! program is piped to the interpreter over stdin.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use winlink_core::TaskId;

use super::{
    interpreter_argv, spawn_supervised, ExecutionHandle, IsolationError, IsolationProvider,
    RunRequest,
};
use crate::config::ContainerOptions;

pub struct ContainerProvider {
    options: ContainerOptions,
    interpreters: BTreeMap<String, String>,
}

impl ContainerProvider {
    pub fn new(options: ContainerOptions, interpreters: BTreeMap<String, String>) -> Self {
        Self {
            options,
            interpreters,
        }
    }

    /// Arguments passed to `docker` for a request.
    pub fn docker_args(&self, request: &RunRequest) -> Result<Vec<String>, IsolationError> {
        let argv = interpreter_argv(&self.interpreters, &request.program.interpreter)?;
        let limits = &request.limits;
        let memory = format!("{}m", limits.max_memory_mb);

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--name".into(),
            container_name(&request.task_id),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory,
            "--cpus".into(),
            format!("{:.2}", f64::from(limits.max_cpu) / 100.0),
            "--pids-limit".into(),
            self.options.pids_limit.to_string(),
            "--read-only".into(),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,nodev,size={}m", self.options.tmpfs_mb),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
        ];
        if !self.options.user.is_empty() {
            args.push("--user".into());
            args.push(self.options.user.clone());
        }
        args.push(self.options.image.clone());
        args.extend(argv);
        Ok(args)
    }
}

#[async_trait]
impl IsolationProvider for ContainerProvider {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn run(&self, request: RunRequest) -> Result<ExecutionHandle, IsolationError> {
        let args = self.docker_args(&request)?;
        debug!(task_id = %request.task_id, image = %self.options.image, "Starting task container");

        let mut command = Command::new(&self.options.docker_path);
        command.args(&args);

        // Killing the docker client leaves the container running.
        let docker = self.options.docker_path.clone();
        let name = container_name(&request.task_id);
        spawn_supervised(command, &request, move |_| {
            let mut kill = Command::new(docker);
            kill.args(["kill", name.as_str()]);
            Some(kill)
        })
    }
}

fn container_name(task_id: &TaskId) -> String {
    let safe: String = task_id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("winlink-{}", safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::Program;
    use winlink_core::ResourceLimits;

    fn provider() -> ContainerProvider {
        let mut interpreters = BTreeMap::new();
        interpreters.insert("python".to_string(), "python3 -u -".to_string());
        ContainerProvider::new(ContainerOptions::default(), interpreters)
    }

    fn request(interpreter: &str) -> RunRequest {
        RunRequest::new(
            TaskId::new("3f2a/9"),
            Program {
                interpreter: interpreter.to_string(),
                source: "print('hi')".to_string(),
            },
            ResourceLimits::new(25, 128, 60),
        )
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> &'a str {
        let at = args.iter().position(|a| a == flag).unwrap();
        &args[at + 1]
    }

    #[test]
    fn test_args_carry_limits_and_hardening() {
        let args = provider().docker_args(&request("python")).unwrap();

        assert_eq!(&args[..3], &["run", "--rm", "-i"]);
        assert_eq!(value_after(&args, "--name"), "winlink-3f2a_9");
        assert_eq!(value_after(&args, "--network"), "none");
        assert_eq!(value_after(&args, "--memory"), "128m");
        assert_eq!(value_after(&args, "--cpus"), "0.25");
        assert_eq!(value_after(&args, "--cap-drop"), "ALL");
        assert_eq!(value_after(&args, "--security-opt"), "no-new-privileges");
        assert_eq!(value_after(&args, "--user"), "nobody");
        assert!(args.iter().any(|a| a == "--read-only"));
        assert!(value_after(&args, "--tmpfs").ends_with("size=100m"));
    }

    #[test]
    fn test_interpreter_follows_image() {
        let args = provider().docker_args(&request("python")).unwrap();
        let image_at = args.iter().position(|a| a == "python:3.12-slim").unwrap();
        assert_eq!(&args[image_at + 1..], &["python3", "-u", "-"]);
    }

    #[test]
    fn test_unknown_interpreter_rejected() {
        assert!(matches!(
            provider().docker_args(&request("ruby")),
            Err(IsolationError::UnknownInterpreter(_))
        ));
    }
}
