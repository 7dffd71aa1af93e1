//! # ProcessExecutor — shell-command thought bodies
//!
//! ## Responsibility
//! Run a thought body as `sh -c <body>`, feeding bound inputs as JSON on
//! stdin and reading the output from stdout.
//!
//! ## Guarantees
//! - Gated: refuses to spawn unless the grant covers `shell.exec`
//! - Never detached: the child is spawned with `kill_on_drop`, so a body that
//!   is cancelled, timed out, or aborted takes its process down with it
//! - Classified: exit code 75 (`EX_TEMPFAIL`) is transient, any other
//!   non-zero exit is permanent
//!
//! ## NOT Responsible For
//! - Filesystem or network jailing of the child

use super::{ExecutionContext, ExecutionError, ExecutionOutput, ThoughtExecutor};
use crate::thought::Capability;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit status a body uses to request a retry.
pub const EXIT_TEMPFAIL: i32 = 75;

/// Maximum bytes of stderr carried into an error message.
const STDERR_EXCERPT: usize = 512;

/// Runs body references as shell commands.
///
/// # Usage
///
/// ```rust,no_run
/// use thought_orchestrator::sandbox::ProcessExecutor;
/// let executor = ProcessExecutor::new().current_dir("/tmp");
/// ```
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: PathBuf,
    current_dir: Option<PathBuf>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    /// Run bodies with `/bin/sh` in the engine's working directory.
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("sh"),
            current_dir: None,
        }
    }

    /// Use a different shell binary; it is invoked as `<shell> -c <body>`.
    pub fn shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run bodies in `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ThoughtExecutor for ProcessExecutor {
    async fn run(&self, mut ctx: ExecutionContext) -> Result<ExecutionOutput, ExecutionError> {
        ctx.grant.require(&Capability::ShellExec)?;

        let stdin_payload = serde_json::to_vec(&Value::Object(std::mem::take(&mut ctx.inputs)))
            .map_err(|e| ExecutionError::Permanent(format!("failed to encode inputs: {e}")))?;

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&ctx.body)
            .env("THOUGHT_NAME", &ctx.thought.name)
            .env("THOUGHT_VERSION", ctx.thought.version.to_string())
            .env("THOUGHT_RUN_ID", ctx.run_id.to_string())
            .env("THOUGHT_NODE", ctx.node.as_str())
            .env("THOUGHT_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            ExecutionError::Permanent(format!("failed to spawn body for {}: {e}", ctx.thought))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A body that never reads stdin closes the pipe early; that is not an error.
            let _ = stdin.write_all(&stdin_payload).await;
            drop(stdin);
        }

        let output = tokio::select! {
            out = child.wait_with_output() => out.map_err(|e| {
                ExecutionError::Permanent(format!("failed to wait on body for {}: {e}", ctx.thought))
            })?,
            _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
        };

        debug!(
            thought = %ctx.thought,
            node = %ctx.node,
            status = ?output.status.code(),
            "process: body exited"
        );

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let trimmed = stdout.trim();
            let value = serde_json::from_str(trimmed)
                .unwrap_or_else(|_| Value::String(trimmed.to_string()));
            return Ok(ExecutionOutput::value(value));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
        match output.status.code() {
            Some(EXIT_TEMPFAIL) => Err(ExecutionError::Transient(excerpt)),
            Some(code) => Err(ExecutionError::Permanent(format!("exit {code}: {excerpt}"))),
            None => Err(ExecutionError::Permanent(format!(
                "terminated by signal: {excerpt}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeId, RunId};
    use crate::sandbox::{CancelSignal, CancelSource, ErrorKind, SandboxGrant};
    use crate::thought::ThoughtId;
    use serde_json::{json, Map};
    use std::time::{Duration, Instant};

    fn ctx(body: &str, caps: Vec<Capability>) -> ExecutionContext {
        let thought = ThoughtId::new("sh", 1);
        let mut inputs = Map::new();
        inputs.insert("name".to_string(), json!("world"));
        ExecutionContext {
            run_id: RunId::new(),
            node: NodeId::new("n"),
            thought: thought.clone(),
            body: body.to_string(),
            inputs,
            attempt: 1,
            grant: SandboxGrant::new(thought, caps, Duration::from_secs(5)),
            cancel: CancelSignal::never(),
        }
    }

    #[tokio::test]
    async fn test_requires_shell_capability() {
        let err = ProcessExecutor::new()
            .run(ctx("echo hi", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityDenied);
    }

    #[tokio::test]
    async fn test_stdout_json_becomes_value() {
        let out = ProcessExecutor::new()
            .run(ctx(r#"cat >/dev/null; echo '{"ok": true}'"#, vec![Capability::ShellExec]))
            .await
            .expect("run");
        assert_eq!(out.value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_inputs_arrive_on_stdin() {
        let out = ProcessExecutor::new()
            .run(ctx("cat", vec![Capability::ShellExec]))
            .await
            .expect("run");
        assert_eq!(out.value, json!({"name": "world"}));
    }

    #[tokio::test]
    async fn test_plain_stdout_becomes_string() {
        let out = ProcessExecutor::new()
            .run(ctx("echo hello", vec![Capability::ShellExec]))
            .await
            .expect("run");
        assert_eq!(out.value, json!("hello"));
    }

    #[tokio::test]
    async fn test_exit_codes_classified() {
        let transient = ProcessExecutor::new()
            .run(ctx("exit 75", vec![Capability::ShellExec]))
            .await
            .unwrap_err();
        assert_eq!(transient.kind(), ErrorKind::Transient);

        let permanent = ProcessExecutor::new()
            .run(ctx("echo bad >&2; exit 3", vec![Capability::ShellExec]))
            .await
            .unwrap_err();
        assert_eq!(permanent, ExecutionError::Permanent("exit 3: bad".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let source = CancelSource::new();
        let mut c = ctx("sleep 30", vec![Capability::ShellExec]);
        c.cancel = source.signal();
        let handle = tokio::spawn(async move { ProcessExecutor::new().run(c).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        source.cancel();
        let err = handle.await.expect("join").unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
