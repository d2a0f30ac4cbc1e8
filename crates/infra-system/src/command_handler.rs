// External command handler: runs a program per job, payload on stdin
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use conveyor_core::application::registry::DEFAULT_HANDLER_TIMEOUT;
use conveyor_core::domain::{JobId, JobPayload, Outcome};
use conveyor_core::port::JobHandler;

/// `EX_DATAERR` from sysexits.h: the input is bad and retrying will not help
pub const EXIT_DATA_ERROR: i32 = 65;

/// Time between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Variables passed through from the daemon environment by default
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "LANG", "TZ"];

/// Set in the child environment so scripts can log the job they serve
pub const JOB_ID_ENV: &str = "CONVEYOR_JOB_ID";

/// Keep at most this much stderr in the failure reason
const MAX_STDERR_IN_REASON: usize = 512;

/// Handler that executes an external program
///
/// The JSON payload is written to the child's stdin. Exit code 0 is success,
/// `EXIT_DATA_ERROR` a permanent failure, anything else (including death by
/// signal or spawn errors) a retryable failure. The child never inherits the
/// full daemon environment, only variables on the allowlist.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    env_allowlist: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    kill_grace: Duration,
}

impl CommandHandler {
    /// # Arguments
    /// * `program` - Executable path (or name resolved through the allowed `PATH`)
    /// * `args` - Fixed arguments of every invocation
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            timeout: DEFAULT_HANDLER_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn env_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.env_allowlist = allowlist;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Upper bound of one invocation, kill included
    pub fn total_timeout(&self) -> Duration {
        self.timeout + self.kill_grace
    }

    /// Allowed subset of the current process environment
    fn filtered_env(&self) -> Vec<(String, String)> {
        std::env::vars()
            .filter(|(k, _)| self.env_allowlist.iter().any(|allowed| allowed == k))
            .collect()
    }

    fn command(&self, job_id: JobId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.filtered_env())
            .env(JOB_ID_ENV, job_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dispatcher-side aborts drop the future; the child must not outlive it
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run(&self, job_id: JobId, payload: &JobPayload) -> Outcome {
        let mut child = match self.command(job_id).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(job_id = %job_id, program = %self.program, error = %e, "Failed to spawn command");
                return Outcome::retryable(format!("spawn {} failed: {}", self.program, e));
            }
        };

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        // Written from its own task so a child that never reads a large payload
        // still runs into `self.timeout` below
        let writer = child.stdin.take().map(|mut stdin| {
            let input = payload.as_value().to_string();
            tokio::spawn(async move {
                let written = stdin.write_all(input.as_bytes()).await;
                drop(stdin);
                written
            })
        });

        let status = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Outcome::retryable(format!("wait failed: {}", e)),
            Err(_) => {
                let input_pending = writer.as_ref().is_some_and(|w| !w.is_finished());
                warn!(
                    job_id = %job_id,
                    program = %self.program,
                    timeout_ms = self.timeout.as_millis() as u64,
                    input_pending = input_pending,
                    "Command timed out, terminating"
                );
                if let Some(writer) = &writer {
                    writer.abort();
                }
                self.terminate(&mut child).await;
                let detail = if input_pending {
                    " (payload not read)"
                } else {
                    ""
                };
                return Outcome::retryable(format!(
                    "command timed out after {}ms{}",
                    self.timeout.as_millis(),
                    detail
                ));
            }
        };

        // A child that ignores its input closes the pipe early; that is not a failure
        if let Some(writer) = writer {
            match writer.await {
                Ok(Err(e)) => debug!(job_id = %job_id, error = %e, "Child did not read the payload"),
                Err(e) => debug!(job_id = %job_id, error = %e, "Payload writer aborted"),
                Ok(Ok(())) => {}
            }
        }

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        info!(
            job_id = %job_id,
            program = %self.program,
            exit_code = ?status.code(),
            stdout_bytes = stdout.len(),
            "Command finished"
        );

        classify(status, &stderr)
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid = pid, error = %e, "SIGTERM failed");
                }
                if timeout(self.kill_grace, child.wait()).await.is_ok() {
                    debug!(pid = pid, "Child exited after SIGTERM");
                    return;
                }
                warn!(pid = pid, "Child ignored SIGTERM, sending SIGKILL");
            }
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill child");
        }
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn execute(&self, job_id: JobId, payload: &JobPayload) -> Outcome {
        self.run(job_id, payload).await
    }
}

fn drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        // Partial output is still useful in the failure reason
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    match handle {
        Some(handle) => handle
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// Map the exit status of a finished child to an outcome
fn classify(status: ExitStatus, stderr: &str) -> Outcome {
    let detail = stderr_tail(stderr);
    match status.code() {
        Some(0) => Outcome::Success,
        Some(EXIT_DATA_ERROR) => Outcome::permanent(with_detail(
            format!("exit code {}", EXIT_DATA_ERROR),
            &detail,
        )),
        Some(code) => Outcome::retryable(with_detail(format!("exit code {}", code), &detail)),
        None => Outcome::retryable(with_detail("terminated by signal".to_string(), &detail)),
    }
}

fn with_detail(reason: String, detail: &str) -> String {
    if detail.is_empty() {
        reason
    } else {
        format!("{}: {}", reason, detail)
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= MAX_STDERR_IN_REASON {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - MAX_STDERR_IN_REASON;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> CommandHandler {
        CommandHandler::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    fn payload() -> JobPayload {
        JobPayload::new(serde_json::json!({"url": "https://example.com", "n": 1}))
    }

    #[tokio::test]
    async fn test_exit_zero_is_success() {
        let outcome = sh("cat > /dev/null; exit 0").execute(1, &payload()).await;
        assert_eq!(outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_payload_is_written_to_stdin() {
        let outcome = sh(r#"grep -q '"n":1'"#).execute(1, &payload()).await;
        assert_eq!(outcome, Outcome::Success);

        let outcome = sh(r#"grep -q '"n":2'"#).execute(1, &payload()).await;
        assert!(matches!(outcome, Outcome::RetryableFailure(_)));
    }

    #[tokio::test]
    async fn test_exit_65_is_permanent() {
        let outcome = sh("echo 'bad url' >&2; exit 65").execute(1, &payload()).await;
        assert_eq!(outcome, Outcome::permanent("exit code 65: bad url"));
    }

    #[tokio::test]
    async fn test_other_exit_codes_are_retryable() {
        let outcome = sh("echo 'upstream 503' >&2; exit 3").execute(1, &payload()).await;
        assert_eq!(outcome, Outcome::retryable("exit code 3: upstream 503"));
    }

    #[tokio::test]
    async fn test_env_is_allowlisted() {
        let handler = sh(r#"[ -z "$CARGO_MANIFEST_DIR" ] && [ "$CONVEYOR_JOB_ID" = "42" ]"#)
            .env_allowlist(vec!["PATH".to_string()]);
        assert_eq!(handler.execute(42, &payload()).await, Outcome::Success);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_retryable() {
        let handler = CommandHandler::new("/nonexistent/conveyor-handler", vec![]);
        let outcome = handler.execute(1, &payload()).await;
        let reason = outcome.reason().unwrap_or_default().to_string();
        assert!(matches!(outcome, Outcome::RetryableFailure(_)));
        assert!(reason.contains("spawn"), "{}", reason);
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let handler = sh("exec sleep 10")
            .timeout(Duration::from_millis(200))
            .kill_grace(Duration::from_secs(2));

        let started = Instant::now();
        let outcome = handler.execute(1, &payload()).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        let reason = outcome.reason().unwrap_or_default().to_string();
        assert!(reason.contains("timed out"), "{}", reason);
    }

    #[tokio::test]
    async fn test_unread_large_payload_still_times_out() {
        let handler = sh("exec sleep 10")
            .timeout(Duration::from_millis(200))
            .kill_grace(Duration::from_secs(2));
        // Far beyond a pipe buffer, so the write can only finish if the child reads
        let big = JobPayload::new(serde_json::json!({"blob": "x".repeat(1 << 20)}));

        let started = Instant::now();
        let outcome = handler.execute(1, &big).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(outcome, Outcome::RetryableFailure(_)));
        let reason = outcome.reason().unwrap_or_default().to_string();
        assert!(reason.contains("payload not read"), "{}", reason);
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let handler = sh("trap '' TERM; sleep 5 > /dev/null 2>&1")
            .timeout(Duration::from_millis(200))
            .kill_grace(Duration::from_millis(300));

        let started = Instant::now();
        let outcome = handler.execute(1, &payload()).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(outcome, Outcome::RetryableFailure(_)));
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = format!("{}END", "x".repeat(2000));
        let tail = stderr_tail(&long);
        assert_eq!(tail.len(), MAX_STDERR_IN_REASON);
        assert!(tail.ends_with("END"));
    }
}
