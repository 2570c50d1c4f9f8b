//! Process execution and supervision.
//!
//! Two kinds of child processes are spawned here: short installer commands
//! (venv creation, pip, ansible-galaxy) whose output is collected in memory,
//! and the user command itself, which runs in its own process group with its
//! merged stdout/stderr spooled to an anonymous temporary file.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::blueprint::BlueprintLayout;
use crate::error::RunError;
use crate::framer::{self, FramedOutput};

/// Token that marks a config-management invocation.
const ANSIBLE_PLAYBOOK: &str = "ansible-playbook";

/// Configuration for a collected (non-streaming) process run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSpec {
    /// The program to run (e.g., "pip")
    pub program: String,
    /// Arguments to pass to the program
    pub args: Vec<String>,
    /// Environment variables set on top of the inherited environment
    pub env: HashMap<String, String>,
    /// Working directory; inherited when unset
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Collected result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Launches installer processes and waits for them to finish.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn output(&self, spec: &ProcessSpec) -> std::io::Result<ProcessOutput>;
}

/// Launcher backed by real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn output(&self, spec: &ProcessSpec) -> std::io::Result<ProcessOutput> {
        debug!(cmd = %spec.display(), "Spawning installer process");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd.output().await?;
        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Request identifiers propagated into the command's environment.
#[derive(Debug, Clone, Default)]
pub struct IdentityEnv {
    pub request_id: String,
    pub sub_request_id: String,
    pub originator_id: String,
    pub correlation_id: String,
}

impl IdentityEnv {
    pub fn vars(&self) -> [(&'static str, &str); 4] {
        [
            ("CDS_REQUEST_ID", self.request_id.as_str()),
            ("CDS_SUBREQUEST_ID", self.sub_request_id.as_str()),
            ("CDS_ORIGINATOR_ID", self.originator_id.as_str()),
            ("CDS_CORRELATION_ID", self.correlation_id.as_str()),
        ]
    }
}

/// What a command run produced.
///
/// `error` is set for timeouts and nonzero exits; `output` is populated in
/// every case.
#[derive(Debug)]
pub struct RunOutcome {
    pub output: FramedOutput,
    pub error: Option<RunError>,
    pub elapsed: Duration,
}

/// Runs user commands inside an activated blueprint environment.
#[derive(Debug, Default, Clone)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Build the shell line for `command`.
    ///
    /// `ansible-playbook` invocations are pointed at the environment's
    /// interpreter; anything else receives the properties as one trailing
    /// JSON argument.
    pub fn command_line(
        layout: &BlueprintLayout,
        command: &str,
        properties: &Map<String, Value>,
    ) -> Result<String, RunError> {
        if command.contains(ANSIBLE_PLAYBOOK) {
            return Ok(format!(
                "{command} -e 'ansible_python_interpreter={}'",
                layout.python().display()
            ));
        }
        if properties.is_empty() {
            return Ok(command.to_string());
        }

        let json = serde_json::to_string(properties).map_err(|e| RunError::Properties(e.to_string()))?;
        let quoted = shlex::try_quote(&json).map_err(|e| RunError::Properties(e.to_string()))?;
        Ok(format!("{command} {quoted}"))
    }

    /// Run `command` in the blueprint directory and demultiplex its output.
    ///
    /// On timeout the whole process group is killed; whatever reached the
    /// spool before that is still parsed and returned.
    pub async fn run(
        &self,
        layout: &BlueprintLayout,
        command: &str,
        properties: &Map<String, Value>,
        identity: &IdentityEnv,
        timeout: Duration,
    ) -> Result<RunOutcome, RunError> {
        let line = Self::command_line(layout, command, properties)?;

        let spool = tempfile::tempfile().map_err(RunError::Spool)?;
        let stdout = spool.try_clone().map_err(RunError::Spool)?;
        let stderr = spool.try_clone().map_err(RunError::Spool)?;

        let host_path = std::env::var("PATH").ok();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&line)
            .current_dir(layout.root())
            .envs(layout.activation_env(host_path.as_deref()))
            .envs(identity.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true);

        info!(cmd = %line, timeout_secs = timeout.as_secs(), "Spawning command");
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(RunError::Spawn)?;

        let error = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                debug!(exit_code = code, "Command completed");
                (code != 0).then_some(RunError::CommandExecution { exit_code: code })
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait for command");
                kill_process_group(&mut child).await;
                Some(RunError::Wait(e))
            }
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(elapsed_ms = elapsed.as_millis() as u64, "Command timed out, killing process group");
                kill_process_group(&mut child).await;
                Some(RunError::Timeout { elapsed })
            }
        };
        let elapsed = started.elapsed();

        let mut reader = BufReader::new(tokio::fs::File::from_std(spool));
        let output = framer::parse_output(&mut reader)
            .await
            .map_err(RunError::Spool)?;

        Ok(RunOutcome {
            output,
            error,
            elapsed,
        })
    }
}

/// Kill every process in the child's group, then reap the child.
async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall; a negative pid addresses the process group
        // created by `process_group(0)` at spawn.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pid, error = %err, "Failed to kill process group");
            }
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Child already gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::BlueprintId;
    use tempfile::tempdir;

    fn layout_in(dir: &std::path::Path) -> BlueprintLayout {
        let layout = BlueprintLayout::new(dir, BlueprintId::new("demo", "1.0.0", "u1"));
        std::fs::create_dir_all(layout.root()).unwrap();
        layout
    }

    fn props(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_command_line_for_ansible() {
        let layout = BlueprintLayout::new(std::path::Path::new("/d"), BlueprintId::new("a", "1", "u"));
        let line = CommandRunner::command_line(
            &layout,
            "ansible-playbook -i hosts site.yml",
            &props(serde_json::json!({"ignored": true})),
        )
        .unwrap();

        assert_eq!(
            line,
            "ansible-playbook -i hosts site.yml -e 'ansible_python_interpreter=/d/a/1/u/bin/python'"
        );
    }

    #[test]
    fn test_command_line_quotes_properties() {
        let layout = BlueprintLayout::new(std::path::Path::new("/d"), BlueprintId::new("a", "1", "u"));

        let bare = CommandRunner::command_line(&layout, "python run.py", &Map::new()).unwrap();
        assert_eq!(bare, "python run.py");

        let line = CommandRunner::command_line(
            &layout,
            "python run.py",
            &props(serde_json::json!({"name": "x"})),
        )
        .unwrap();
        assert!(line.starts_with("python run.py "));
        assert_ne!(line, r#"python run.py {"name":"x"}"#);
    }

    #[tokio::test]
    async fn test_run_echo_with_properties_and_identity() {
        let dir = tempdir().unwrap();
        let layout = layout_in(dir.path());
        let identity = IdentityEnv {
            request_id: "req-9".to_string(),
            ..Default::default()
        };

        let outcome = CommandRunner::new()
            .run(
                &layout,
                "echo $CDS_REQUEST_ID; echo oops 1>&2; echo",
                &props(serde_json::json!({"a": "it's b"})),
                &identity,
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert!(outcome.error.is_none());
        assert_eq!(outcome.output.results_log, vec!["req-9", "oops", r#"{"a":"it's b"}"#]);
    }

    #[tokio::test]
    async fn test_runs_in_blueprint_directory() {
        let dir = tempdir().unwrap();
        let layout = layout_in(dir.path());
        std::fs::write(layout.root().join("marker.txt"), "here\n").unwrap();

        let outcome = CommandRunner::new()
            .run(&layout, "cat marker.txt", &Map::new(), &IdentityEnv::default(), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.output.results_log, vec!["here"]);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let dir = tempdir().unwrap();
        let layout = layout_in(dir.path());

        let outcome = CommandRunner::new()
            .run(
                &layout,
                "for i in 1 2 3 4 5; do echo line$i; done; sleep 30",
                &Map::new(),
                &IdentityEnv::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(matches!(outcome.error, Some(RunError::Timeout { .. })));
        assert_eq!(
            outcome.output.results_log,
            vec!["line1", "line2", "line3", "line4", "line5"]
        );
        assert!(outcome.elapsed < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_grandchildren() {
        let dir = tempdir().unwrap();
        let layout = layout_in(dir.path());

        let outcome = CommandRunner::new()
            .run(
                &layout,
                "(sleep 2; touch late) & echo early; sleep 30",
                &Map::new(),
                &IdentityEnv::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(matches!(outcome.error, Some(RunError::Timeout { .. })));
        assert_eq!(outcome.output.results_log, vec!["early"]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!layout.root().join("late").exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_payload() {
        let dir = tempdir().unwrap();
        let layout = layout_in(dir.path());

        let outcome = CommandRunner::new()
            .run(
                &layout,
                r#"echo start; printf 'BEGIN_EXTRA_PAYLOAD\n{"k": "v"}\nEND_EXTRA_PAYLOAD\n'; exit 1"#,
                &Map::new(),
                &IdentityEnv::default(),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome.error,
            Some(RunError::CommandExecution { exit_code: 1 })
        ));
        assert_eq!(outcome.output.results_log, vec!["start"]);
        assert_eq!(outcome.output.payload.get("k"), Some(&Value::from("v")));
    }

    #[tokio::test]
    async fn test_system_launcher_collects_output() {
        let spec = ProcessSpec::new("sh")
            .arg("-c")
            .arg("echo out; echo err 1>&2; exit 3");
        let output = SystemLauncher.output(&spec).await.unwrap();

        assert_eq!(output.code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }
}
