//! # Executor — External Data-Reduction Step
//!
//! The worker never reduces data itself; it hands `(task_name, params)` to an
//! [`Executor`] and maps the answer onto the queue:
//!
//! | Executor answer | Task transition |
//! |-----------------|-----------------|
//! | `Ok(Success(result))` | `complete_task(result)` |
//! | `Ok(Failure(errors))` | `fail_task(errors)`, never retried |
//! | `Err(PipelineError)` | retried while the policy allows, then `fail_task` |
//!
//! [`CommandExecutor`] runs a configured program once per attempt: the task
//! name is appended as the last argument, params are written to stdin as
//! JSON, and the last JSON object on stdout is the answer:
//!
//! ```text
//! {"status": "success", "result": {"ms_path": "/stage/2025-10-02T00:12:00.ms"}}
//! {"status": "error", "errors": ["calibrator not found"]}
//! ```
//!
//! Exit code 75 (`EX_TEMPFAIL`) without a JSON answer is a retryable failure;
//! any other non-zero exit without one is not.

use crate::error::{ErrorKind, PipelineError};
use serde_json::Value;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Temporary-failure exit status from `sysexits.h`.
pub const EXIT_TEMPFAIL: i32 = 75;

const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(Value),
    Failure(Vec<String>),
}

pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        task_name: &str,
        params: &Value,
    ) -> impl Future<Output = Result<ExecutionOutcome, PipelineError>> + Send;
}

/// Error kind for a failure of `task_name`, chosen by its processing stage.
pub fn kind_for_task(task_name: &str) -> ErrorKind {
    let name = task_name.to_ascii_lowercase();
    if name.contains("calibrat") {
        ErrorKind::Calibration
    } else if name.contains("imag") {
        ErrorKind::Imaging
    } else {
        ErrorKind::Conversion
    }
}

/// Interpret executor stdout. `Ok(None)` when no JSON answer line exists.
pub fn parse_executor_output(stdout: &str) -> Result<Option<ExecutionOutcome>, String> {
    let answer = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str::<Value>(l).ok().filter(Value::is_object));
    let Some(answer) = answer else {
        return Ok(None);
    };

    match answer.get("status").and_then(Value::as_str) {
        Some("success") => {
            let result = answer.get("result").cloned().unwrap_or(answer);
            Ok(Some(ExecutionOutcome::Success(result)))
        }
        Some("error") => {
            let mut errors: Vec<String> = match answer.get("errors") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|e| match e {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            if let Some(single) = answer.get("error").and_then(Value::as_str) {
                errors.push(single.to_string());
            }
            if errors.is_empty() {
                errors.push("executor reported an error without details".to_string());
            }
            Ok(Some(ExecutionOutcome::Failure(errors)))
        }
        Some(other) => Err(format!("unknown executor status '{}'", other)),
        None => Err("executor answer has no status field".to_string()),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

/// Runs an external program per attempt.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Option<Duration>) -> Self {
        CommandExecutor {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, task_name: &str, params: &Value) -> Result<ExecutionOutcome, PipelineError> {
        let kind = kind_for_task(task_name);
        let stage_error = |message: String, retryable: bool| {
            PipelineError::new(kind, message)
                .with_retryable(retryable)
                .with_stage(task_name)
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(task_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| stage_error(format!("failed to start {}: {}", self.program, e), false))?;

        let payload = serde_json::to_vec(params)
            .map_err(|e| PipelineError::validation(format!("unserialisable params: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores stdin may close it early; that is not a failure.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "executor closed stdin early");
            }
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    PipelineError::timeout(format!("{} exceeded {}s", task_name, limit.as_secs()))
                        .with_stage(task_name)
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| stage_error(format!("waiting for {}: {}", self.program, e), true))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_executor_output(&stdout).map_err(|msg| stage_error(msg, false))?;
        match (parsed, output.status.code()) {
            (Some(outcome), _) => Ok(outcome),
            (None, Some(0)) => Ok(ExecutionOutcome::Success(serde_json::json!({}))),
            (None, code) => {
                let retryable = code == Some(EXIT_TEMPFAIL);
                let status = code
                    .map(|c| format!("exit status {}", c))
                    .unwrap_or_else(|| "terminated by signal".to_string());
                Err(stage_error(
                    format!("{} failed ({}): {}", self.program, status, stderr_tail(&output.stderr)),
                    retryable,
                ))
            }
        }
    }
}

impl Executor for CommandExecutor {
    fn execute(
        &self,
        task_name: &str,
        params: &Value,
    ) -> impl Future<Output = Result<ExecutionOutcome, PipelineError>> + Send {
        self.run(task_name, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_success_with_result() {
        let out = "loading...\n{\"status\": \"success\", \"result\": {\"ms\": \"/x.ms\"}}\n";
        assert_eq!(
            parse_executor_output(out).unwrap(),
            Some(ExecutionOutcome::Success(json!({"ms": "/x.ms"})))
        );
    }

    #[test]
    fn success_without_result_keeps_whole_answer() {
        let out = "{\"status\":\"success\",\"elapsed\":3.5}";
        assert_eq!(
            parse_executor_output(out).unwrap(),
            Some(ExecutionOutcome::Success(json!({"status":"success","elapsed":3.5})))
        );
    }

    #[test]
    fn parses_error_lists() {
        let out = "{\"status\":\"error\",\"errors\":[\"no calibrator\", 42]}";
        assert_eq!(
            parse_executor_output(out).unwrap(),
            Some(ExecutionOutcome::Failure(vec!["no calibrator".into(), "42".into()]))
        );
        let out = "{\"status\":\"error\"}";
        match parse_executor_output(out).unwrap() {
            Some(ExecutionOutcome::Failure(errs)) => assert_eq!(errs.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn last_json_line_wins_and_noise_is_ignored() {
        let out = "{\"status\":\"error\",\"errors\":[\"old\"]}\n{not json\n{\"status\":\"success\"}\nbye";
        assert!(matches!(
            parse_executor_output(out).unwrap(),
            Some(ExecutionOutcome::Success(_))
        ));
        assert_eq!(parse_executor_output("plain log output\n").unwrap(), None);
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!(parse_executor_output("{\"status\":\"maybe\"}").is_err());
        assert!(parse_executor_output("{\"result\":1}").is_err());
    }

    #[test]
    fn task_names_map_to_stage_kinds() {
        assert_eq!(kind_for_task("convert-group"), ErrorKind::Conversion);
        assert_eq!(kind_for_task("bandpass-calibration"), ErrorKind::Calibration);
        assert_eq!(kind_for_task("image-field"), ErrorKind::Imaging);
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr = b"a\nb\n\nc\nd\ne\nf\ng\n";
        assert_eq!(stderr_tail(stderr), "c | d | e | f | g");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_executor_reads_params_from_stdin() {
        let exec = CommandExecutor::new(
            "sh",
            vec![
                "-c".into(),
                "read line; echo \"{\\\"status\\\":\\\"success\\\",\\\"result\\\":$line}\"".into(),
            ],
            Some(Duration::from_secs(10)),
        );
        let outcome = exec
            .execute("convert-group", &json!({"group_id": "2025-10-02T00:12:00"}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Success(json!({"group_id": "2025-10-02T00:12:00"}))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tempfail_exit_is_retryable() {
        let exec = CommandExecutor::new(
            "sh",
            vec!["-c".into(), "echo busy >&2; exit 75".into()],
            None,
        );
        let err = exec.execute("convert-group", &json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conversion);
        assert!(err.retryable);
        assert!(err.message.contains("busy"));
        assert_eq!(err.stage.as_deref(), Some("convert-group"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_exit_codes_are_not_retryable() {
        let exec = CommandExecutor::new("sh", vec!["-c".into(), "exit 3".into()], None);
        let err = exec.execute("image-field", &json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Imaging);
        assert!(!err.retryable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_program_times_out() {
        let exec = CommandExecutor::new(
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Some(Duration::from_millis(100)),
        );
        let err = exec.execute("convert-group", &json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn missing_program_is_not_retryable() {
        let exec = CommandExecutor::new("/nonexistent/reducer", vec![], None);
        let err = exec.execute("convert-group", &json!({})).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("failed to start"));
    }
}
