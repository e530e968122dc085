use crate::runner::{FailureStage, Outcome, WorkerRunner, WorkerScript};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    io,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    time::timeout,
};
use tracing::instrument;

/// How much of an unparseable stdout is kept as the diagnostic.
const OUTPUT_HEAD_BYTES: usize = 512;

/// Everything observed from a worker between spawn and exit.
struct Exchange {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdin_error: Option<io::Error>,
}

/// Launches each worker as a child process with piped stdin, stdout and stderr.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    deadline: Duration,
}

impl ProcessRunner {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    async fn exchange(child: &mut Child, payload: Vec<u8>) -> io::Result<Exchange> {
        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("worker stderr was not captured"))?;

        let write_input = async move {
            let Some(mut stdin) = stdin else {
                return Some(io::Error::other("worker stdin was not captured"));
            };
            let result = match stdin.write_all(&payload).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            // Dropping the handle closes the pipe, which is the worker's end-of-input.
            drop(stdin);
            result.err()
        };

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (stdin_error, out_read, err_read) = tokio::join!(
            write_input,
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err),
        );
        out_read?;
        err_read?;

        if let Some(e) = &stdin_error {
            tracing::warn!(error = %e, "Writing payload to worker stdin failed");
        }

        let status = child.wait().await?;

        Ok(Exchange {
            status,
            stdout: out,
            stderr: err,
            stdin_error,
        })
    }

    fn decide(exchange: Exchange) -> Outcome {
        if !exchange.status.success() {
            let stderr = String::from_utf8_lossy(&exchange.stderr).trim().to_string();
            tracing::error!(status = %exchange.status, stderr = %stderr, "Worker exited with failure");
            let diagnostic = if stderr.is_empty() {
                match exchange.status.code() {
                    Some(code) => format!("worker exited with status {}", code),
                    None => "worker was terminated by a signal".to_string(),
                }
            } else {
                stderr
            };
            return Outcome::failure(FailureStage::NonZeroExit, diagnostic);
        }

        if !exchange.stderr.is_empty() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&exchange.stderr).trim(),
                "Worker diagnostics"
            );
        }

        match serde_json::from_slice::<Value>(&exchange.stdout) {
            Ok(body) => Outcome::Success(body),
            Err(parse_error) => {
                let silent = exchange.stdout.iter().all(u8::is_ascii_whitespace);
                if let (true, Some(write_error)) = (silent, &exchange.stdin_error) {
                    return Outcome::failure(FailureStage::StdinWrite, write_error.to_string());
                }
                let head = output_head(&exchange.stdout);
                tracing::error!(error = %parse_error, output = %head, "Worker output is not valid JSON");
                Outcome::failure(FailureStage::Parse, head)
            }
        }
    }
}

/// Kills the worker's whole process group, then the worker itself, and reaps it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg only sends a signal; the group id is the pid of a child
        // spawned as its own group leader that has not been reaped yet.
        let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if result != 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "Failed to kill worker process group");
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker");
    }
}

fn output_head(stdout: &[u8]) -> String {
    let end = stdout.len().min(OUTPUT_HEAD_BYTES);
    String::from_utf8_lossy(&stdout[..end]).into_owned()
}

#[async_trait]
impl WorkerRunner for ProcessRunner {
    #[instrument(skip(self, script, payload), fields(program = %script.program, args = ?script.args))]
    async fn invoke(&self, script: &WorkerScript, payload: Vec<u8>) -> Outcome {
        let started = Instant::now();
        let mut command = Command::new(&script.program);
        command
            .args(&script.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so helpers the worker forks can be killed with it.
        #[cfg(unix)]
        command.process_group(0);
        let spawned = command.spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start worker");
                return Outcome::failure(FailureStage::Spawn, e.to_string());
            }
        };
        tracing::debug!(pid = ?child.id(), payload_len = payload.len(), "Worker started");

        let outcome = match timeout(self.deadline, Self::exchange(&mut child, payload)).await {
            Ok(Ok(exchange)) => Self::decide(exchange),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Lost contact with worker");
                terminate(&mut child).await;
                Outcome::failure(FailureStage::NonZeroExit, e.to_string())
            }
            Err(_) => {
                tracing::error!(deadline_ms = self.deadline.as_millis() as u64, "Worker timed out");
                terminate(&mut child).await;
                Outcome::failure(
                    FailureStage::Timeout,
                    format!("worker timed out after {:?}", self.deadline),
                )
            }
        };

        tracing::info!(
            outcome = outcome.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, name: &str, body: &str) -> WorkerScript {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        sh(&path)
    }

    fn sh(path: &Path) -> WorkerScript {
        WorkerScript {
            program: "sh".to_string(),
            args: vec![path.display().to_string()],
        }
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_success_returns_worker_json_unchanged() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            "analyze.sh",
            "cat > /dev/null\nprintf '{\"features\":[\"avg_r\"],\"mi_scores\":[0.42]}'\n",
        );

        let payload = serde_json::to_vec(&json!({"images": ["aW1n"], "labels": [0]})).unwrap();
        let outcome = runner().invoke(&script, payload).await;

        assert_eq!(
            outcome,
            Outcome::Success(json!({"features": ["avg_r"], "mi_scores": [0.42]}))
        );
    }

    #[tokio::test]
    async fn test_payload_reaches_worker_stdin() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "echo.sh", "cat\n");

        let body = json!({"images": ["YQ==", "Yg=="], "labels": [0, 1], "mode": "train"});
        let outcome = runner()
            .invoke(&script, serde_json::to_vec(&body).unwrap())
            .await;

        assert_eq!(outcome, Outcome::Success(body));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            "fail.sh",
            "cat > /dev/null\necho 'ValueError: bad label' >&2\necho '{\"accuracy\": 1.0}'\nexit 1\n",
        );

        let outcome = runner().invoke(&script, b"{}".to_vec()).await;

        assert_eq!(
            outcome,
            Outcome::failure(FailureStage::NonZeroExit, "ValueError: bad label")
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_stderr_uses_generic_message() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "exit3.sh", "exit 3\n");

        let outcome = runner().invoke(&script, b"{}".to_vec()).await;

        assert_eq!(
            outcome,
            Outcome::failure(FailureStage::NonZeroExit, "worker exited with status 3")
        );
    }

    #[tokio::test]
    async fn test_non_json_output_is_a_parse_failure() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "text.sh", "cat > /dev/null\necho 'Epoch 1/5 done'\n");

        let outcome = runner().invoke(&script, b"{}".to_vec()).await;

        match outcome {
            Outcome::Failure(failure) => {
                assert_eq!(failure.stage, FailureStage::Parse);
                assert!(failure.diagnostic.contains("Epoch 1/5"));
            }
            other => panic!("expected parse failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_failure() {
        let script = WorkerScript {
            program: "/nonexistent/feature-lab-worker".to_string(),
            args: vec![],
        };

        let outcome = runner().invoke(&script, b"{}".to_vec()).await;

        match outcome {
            Outcome::Failure(failure) => assert_eq!(failure.stage, FailureStage::Spawn),
            other => panic!("expected spawn failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_ignoring_stdin_still_decides_on_exit() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "ignore.sh", "echo '{\"predicted_label\": 1}'\n");

        let payload = vec![b' '; 1024 * 1024];
        let outcome = runner().invoke(&script, payload).await;

        assert_eq!(outcome, Outcome::Success(json!({"predicted_label": 1})));
    }

    #[tokio::test]
    async fn test_silent_worker_that_never_read_input() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "silent.sh", "exit 0\n");

        let payload = vec![b' '; 1024 * 1024];
        let outcome = runner().invoke(&script, payload).await;

        match outcome {
            Outcome::Failure(failure) => assert_eq!(failure.stage, FailureStage::StdinWrite),
            other => panic!("expected stdin-write failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_kills_unresponsive_worker() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "hang.sh", "cat > /dev/null\nexec sleep 30\n");

        let started = Instant::now();
        let outcome = ProcessRunner::new(Duration::from_millis(300))
            .invoke(&script, b"{}".to_vec())
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        match outcome {
            Outcome::Failure(failure) => assert_eq!(failure.stage, FailureStage::Timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deadline_kills_processes_forked_by_worker() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("helper-survived");
        let script = write_script(
            &dir,
            "fork.sh",
            &format!(
                "(sleep 1; touch '{}') &\ncat > /dev/null\nexec sleep 30\n",
                marker.display()
            ),
        );

        let outcome = ProcessRunner::new(Duration::from_millis(300))
            .invoke(&script, b"{}".to_vec())
            .await;
        assert_eq!(outcome.label(), "timeout");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
