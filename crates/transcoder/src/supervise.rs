//! Child process supervision: captured output, a hard timeout and
//! cooperative cancellation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {after:?}")]
    TimedOut {
        after: Duration,
        stderr_tail: Vec<String>,
    },
    #[error("cancelled")]
    Cancelled { stderr_tail: Vec<String> },
    #[error("I/O error waiting for process: {0}")]
    Io(#[from] std::io::Error),
}

/// Output captured from a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    /// The last few stderr lines, oldest first.
    pub stderr_tail: Vec<String>,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn stderr_text(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

/// Run `program` to completion, feeding each stderr line to `on_line`.
///
/// The child is killed when `timeout` elapses or `cancel` fires. A non-zero
/// exit status is not an error here; callers classify it.
pub async fn run(
    program: &Path,
    args: &[String],
    timeout: Duration,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str),
) -> Result<ProcessOutput, SuperviseError> {
    let started = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SuperviseError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout {
            if let Err(e) = out.read_to_end(&mut buf).await {
                warn!(error = %e, "failed to read process stdout");
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let mut lines = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut stderr_open = lines.is_some();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let status = loop {
        tokio::select! {
            _ = &mut deadline => {
                kill(&mut child).await;
                stdout_task.abort();
                return Err(SuperviseError::TimedOut {
                    after: timeout,
                    stderr_tail: tail.into(),
                });
            }
            _ = cancel.cancelled() => {
                kill(&mut child).await;
                stdout_task.abort();
                return Err(SuperviseError::Cancelled {
                    stderr_tail: tail.into(),
                });
            }
            line = next_line(&mut lines), if stderr_open => match line {
                Some(line) => {
                    on_line(&line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                None => stderr_open = false,
            },
            status = child.wait(), if !stderr_open => break status?,
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();

    Ok(ProcessOutput {
        status,
        stdout,
        stderr_tail: tail.into(),
        elapsed: started.elapsed(),
    })
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(pid = ?child.id(), error = %e, "failed to kill process");
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStderr>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".into(), script.into()]
    }

    #[tokio::test]
    async fn captures_exit_status_and_stderr() {
        let mut seen = Vec::new();
        let out = run(
            Path::new("sh"),
            &sh("echo progress=continue >&2; echo done; echo boom >&2; exit 3"),
            Duration::from_secs(10),
            &CancellationToken::new(),
            |line| seen.push(line.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "done");
        assert_eq!(out.stderr_tail, vec!["progress=continue", "boom"]);
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn tail_is_bounded() {
        let out = run(
            Path::new("sh"),
            &sh("i=0; while [ $i -lt 100 ]; do echo line$i >&2; i=$((i+1)); done"),
            Duration::from_secs(10),
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap();

        assert!(out.status.success());
        assert_eq!(out.stderr_tail.len(), STDERR_TAIL_LINES);
        assert_eq!(out.stderr_tail.last().map(String::as_str), Some("line99"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = Instant::now();
        let err = run(
            Path::new("sleep"),
            &["10".to_string()],
            Duration::from_millis(100),
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SuperviseError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = run(
            Path::new("sleep"),
            &["10".to_string()],
            Duration::from_secs(30),
            &cancel,
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SuperviseError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = run(
            Path::new("/nonexistent/ffmpeg-xyz"),
            &[],
            Duration::from_secs(1),
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SuperviseError::Spawn { .. }));
    }
}
