use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::OxvisorError;

pub const DEFAULT_PATH: &str = "/usr/bin:/usr/sbin:/bin:/sbin";
const OUTPUT_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn new(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(0, "", "")
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::new(1, "", reason)
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    pub fn merge(&self, other: &CommandResult) -> Self {
        Self {
            code: self.code | other.code,
            stdout: format!("{}{}", self.stdout, other.stdout),
            stderr: format!("{}{}", self.stderr, other.stderr),
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exit {} (stdout: {:?}, stderr: {:?})",
            self.code,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

// The timeout covers the process only; output still held open by a
// backgrounded grandchild is collected for `OUTPUT_GRACE` at most.
pub async fn run_command(
    argv: &[String],
    timeout_secs: Option<u64>,
    env: Option<&HashMap<String, String>>,
) -> Result<CommandResult, OxvisorError> {
    let rendered = argv.join(" ");
    let Some((program, args)) = argv.split_first() else {
        return Err(OxvisorError::ProcessError {
            command: rendered,
            reason: "command cannot be empty".to_string(),
        });
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match env {
        Some(vars) => {
            command.envs(vars);
        }
        None => {
            command.env("PATH", DEFAULT_PATH);
        }
    }

    let mut child = command.spawn().map_err(|err| OxvisorError::ProcessError {
        command: rendered.clone(),
        reason: err.to_string(),
    })?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let waited = match timeout_secs {
        None => child.wait().await,
        Some(secs) => match timeout(Duration::from_secs(secs), child.wait()).await {
            Ok(waited) => waited,
            Err(_) => {
                if let Err(err) = child.start_kill() {
                    debug!("failed to kill {rendered}: {err}");
                }
                let _ = child.wait().await;
                stdout.1.abort();
                stderr.1.abort();
                return Err(OxvisorError::ProcessTimedOut {
                    command: rendered,
                    timeout_secs: secs,
                });
            }
        },
    };
    let status = waited.map_err(|err| OxvisorError::ProcessError {
        command: rendered.clone(),
        reason: err.to_string(),
    })?;

    let result = CommandResult::new(
        exit_code(&status),
        collect(stdout).await,
        collect(stderr).await,
    );
    debug!("{rendered} returned {result}");
    Ok(result)
}

type Drained = (Arc<Mutex<Vec<u8>>>, JoinHandle<()>);

fn drain<R>(reader: Option<R>) -> Drained
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);
    let handle = tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if let Ok(mut buffer) = sink.lock() {
                        buffer.extend_from_slice(&chunk[..read]);
                    }
                }
            }
        }
    });
    (buffer, handle)
}

async fn collect((buffer, mut handle): Drained) -> String {
    if timeout(OUTPUT_GRACE, &mut handle).await.is_err() {
        handle.abort();
    }
    let bytes = buffer
        .lock()
        .map(|buffer| buffer.clone())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Instant;

    use super::{run_command, CommandResult};
    use crate::errors::OxvisorError;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[tokio::test]
    async fn run_command_captures_code_and_streams() {
        let result = run_command(
            &argv(&["/bin/sh", "-c", "echo out; echo err >&2; exit 3"]),
            Some(5),
            None,
        )
        .await
        .expect("command should run");

        assert_eq!(result.code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[tokio::test]
    async fn run_command_without_timeout_blocks_until_exit() {
        let result = run_command(&argv(&["/bin/sh", "-c", "sleep 0.2; echo done"]), None, None)
            .await
            .expect("command should run");
        assert!(result.is_success());
        assert_eq!(result.stdout.trim(), "done");
    }

    #[tokio::test]
    async fn run_command_kills_on_timeout() {
        let started = Instant::now();
        let err = run_command(&argv(&["/bin/sh", "-c", "sleep 5"]), Some(1), None)
            .await
            .expect_err("command should time out");

        assert!(
            matches!(err, OxvisorError::ProcessTimedOut { timeout_secs: 1, .. }),
            "unexpected error: {err}"
        );
        assert!(started.elapsed().as_secs() < 4, "timeout was not enforced");
    }

    #[tokio::test]
    async fn run_command_returns_when_backgrounded_child_keeps_pipes() {
        let started = Instant::now();
        let result = run_command(
            &argv(&["/bin/sh", "-c", "sleep 4 & echo started; exit 0"]),
            Some(2),
            None,
        )
        .await
        .expect("shell exits before the timeout");

        assert_eq!(result.code, 0);
        assert_eq!(result.stdout, "started\n");
        assert!(started.elapsed().as_secs() < 2, "waited for the grandchild");
    }

    #[tokio::test]
    async fn run_command_reports_unlaunchable_program() {
        let err = run_command(&argv(&["/definitely/not/here"]), Some(1), None)
            .await
            .expect_err("missing executable should fail");
        assert!(matches!(err, OxvisorError::ProcessError { .. }));

        let err = run_command(&[], Some(1), None)
            .await
            .expect_err("empty command should fail");
        assert!(matches!(err, OxvisorError::ProcessError { .. }));
    }

    #[tokio::test]
    async fn run_command_uses_minimal_path_or_given_env() {
        let result = run_command(&argv(&["/bin/sh", "-c", "echo $PATH"]), Some(5), None)
            .await
            .expect("command should run");
        assert_eq!(result.stdout.trim(), super::DEFAULT_PATH);

        let env = HashMap::from([("PATH".to_string(), "/opt/custom/bin".to_string())]);
        let result = run_command(&argv(&["/bin/sh", "-c", "echo $PATH"]), Some(5), Some(&env))
            .await
            .expect("command should run");
        assert_eq!(result.stdout.trim(), "/opt/custom/bin");
    }

    #[test]
    fn merge_ors_codes_and_concatenates_streams() {
        let stop = CommandResult::new(1, "stopped\n", "");
        let start = CommandResult::new(2, "started\n", "warn\n");
        let merged = stop.merge(&start);

        assert_eq!(merged.code, 3);
        assert_eq!(merged.stdout, "stopped\nstarted\n");
        assert_eq!(merged.stderr, "warn\n");
        assert!(CommandResult::success().merge(&CommandResult::success()).is_success());
    }
}
