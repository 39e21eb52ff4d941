//! Runs submitted code in a child interpreter process under a wall-clock limit.

use std::{
    process::Stdio,
    time::{Duration, Instant},
};

use shared::{domain::StudentId, protocol::ExecutionResult};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, warn};

const MAX_CAPTURED_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub interpreter: String,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to launch interpreter '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("execution timed out after {} ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("failed to collect interpreter output: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes `code` as `<interpreter> -c <code>`, feeding `stdin` when given.
pub async fn run_code(
    config: &ExecutorConfig,
    code: &str,
    stdin: Option<&str>,
) -> Result<ExecutionResult, ExecutionError> {
    let started = Instant::now();
    let mut child = Command::new(&config.interpreter)
        .arg("-c")
        .arg(code)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecutionError::Spawn {
            program: config.interpreter.clone(),
            source,
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_owned();
        tokio::spawn(async move {
            if let Err(error) = pipe.write_all(input.as_bytes()).await {
                debug!(%error, "child closed stdin early");
            }
        });
    }

    let output = tokio::time::timeout(config.timeout, child.wait_with_output())
        .await
        .map_err(|_| ExecutionError::TimedOut(config.timeout))??;
    let elapsed = started.elapsed();

    let stderr = captured_text(&output.stderr);
    let error = if !stderr.is_empty() {
        Some(stderr)
    } else if !output.status.success() {
        Some(format!("process exited with {}", output.status))
    } else {
        None
    };

    Ok(ExecutionResult {
        student_id: None,
        success: output.status.success(),
        output: captured_text(&output.stdout),
        error,
        execution_time_ms: elapsed.as_millis() as u64,
    })
}

/// Like [`run_code`], but folds launch failures and timeouts into a failed result.
pub async fn execute_for_student(
    config: &ExecutorConfig,
    student_id: StudentId,
    code: &str,
) -> ExecutionResult {
    let started = Instant::now();
    match run_code(config, code, None).await {
        Ok(mut result) => {
            result.student_id = Some(student_id);
            result
        }
        Err(error) => {
            warn!(student_id = student_id.0, %error, "student code execution failed");
            ExecutionResult {
                student_id: Some(student_id),
                success: false,
                output: String::new(),
                error: Some(error.to_string()),
                execution_time_ms: started.elapsed().as_millis() as u64,
            }
        }
    }
}

fn captured_text(bytes: &[u8]) -> String {
    let limit = bytes.len().min(MAX_CAPTURED_OUTPUT_BYTES);
    let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    if bytes.len() > MAX_CAPTURED_OUTPUT_BYTES {
        text.push_str("\n[output truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(timeout: Duration) -> ExecutorConfig {
        ExecutorConfig {
            interpreter: "sh".into(),
            timeout,
        }
    }

    #[tokio::test]
    async fn captures_stdout_of_successful_run() {
        let result = run_code(&shell(Duration::from_secs(5)), "echo hello", None)
            .await
            .expect("run");
        assert!(result.success);
        assert_eq!(result.output, "hello\n");
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn feeds_stdin_to_the_program() {
        let result = run_code(
            &shell(Duration::from_secs(5)),
            "read name; echo \"hi $name\"",
            Some("Alice\n"),
        )
        .await
        .expect("run");
        assert_eq!(result.output, "hi Alice\n");
    }

    #[tokio::test]
    async fn non_zero_exit_reports_failure() {
        let result = run_code(&shell(Duration::from_secs(5)), "echo oops >&2; exit 3", None)
            .await
            .expect("run");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("oops\n"));
    }

    #[tokio::test]
    async fn long_running_code_times_out() {
        let err = run_code(&shell(Duration::from_millis(100)), "sleep 5", None)
            .await
            .expect_err("should time out");
        assert!(matches!(err, ExecutionError::TimedOut(_)));
    }

    #[tokio::test]
    async fn missing_interpreter_becomes_failed_result() {
        let config = ExecutorConfig {
            interpreter: "definitely-not-an-interpreter".into(),
            timeout: Duration::from_secs(1),
        };
        let result = execute_for_student(&config, StudentId(4), "print(1)").await;
        assert!(!result.success);
        assert_eq!(result.student_id, Some(StudentId(4)));
        assert!(result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("failed to launch interpreter")));
    }
}
