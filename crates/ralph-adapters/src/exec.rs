//! Structured subprocess execution: timeout, process-group isolation,
//! output capture and truncation, and a human-readable log file.
//!
//! Shared by the gate runner, the service lifecycle manager, and the
//! Claude CLI adapter so every subprocess in the system goes through the
//! same timeout/process-group/logging discipline.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Default wall-clock timeout applied when a caller doesn't set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;
/// Output kept in memory/on disk per stream before truncation.
pub const MAX_STORED_OUTPUT: usize = 100_000;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to write log file {0}: {1}")]
    LogWrite(PathBuf, std::io::Error),
}

/// How to invoke a command: as a shell one-liner (gates, service start
/// commands, which are free-form shell strings in config) or as an
/// explicit argv (git plumbing, the agent CLI).
#[derive(Debug, Clone)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn display(&self) -> String {
        match self {
            CommandSpec::Shell(s) => s.clone(),
            CommandSpec::Argv(parts) => parts.join(" "),
        }
    }

    fn to_tokio_command(&self) -> Command {
        match self {
            CommandSpec::Shell(s) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(s);
                cmd
            }
            CommandSpec::Argv(parts) => {
                let mut cmd = Command::new(&parts[0]);
                cmd.args(&parts[1..]);
                cmd
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunCommandOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub log_path: Option<PathBuf>,
}

impl Default for RunCommandOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            env: Vec::new(),
            log_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub error: Option<String>,
    pub log_path: Option<PathBuf>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout and stderr joined, for callers that don't care which
    /// stream a line came from (gate failure feedback, e.g.).
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    pub fn truncated_output(&self, max_chars: usize) -> String {
        truncate_output(&self.combined_output(), max_chars)
    }
}

/// Head/tail truncation: keep `max_chars/2` from the front and the rest
/// (minus a small marker allowance) from the back, joined by a
/// "truncated N characters" marker. Mirrors the source's storage and
/// display truncation, which both use this exact split.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let chars: Vec<char> = output.chars().collect();
    if chars.len() <= max_chars {
        return output.to_string();
    }
    let head_size = max_chars / 2;
    let tail_size = max_chars.saturating_sub(head_size).saturating_sub(100);
    let total = chars.len();
    let head: String = chars[..head_size].iter().collect();
    let tail: String = chars[total - tail_size..].iter().collect();
    format!(
        "{head}\n\n... [truncated {} characters] ...\n\n{tail}",
        total - head_size - tail_size
    )
}

/// First 10 and last 10 lines, used for gate failure feedback rather
/// than the character-count truncation above.
pub fn truncate_lines(output: &str, head: usize, tail: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= head + tail {
        return output.to_string();
    }
    let head_lines = lines[..head].join("\n");
    let tail_lines = lines[lines.len() - tail..].join("\n");
    format!(
        "{head_lines}\n\n... [{} lines omitted] ...\n\n{tail_lines}",
        lines.len() - head - tail
    )
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Runs a command to completion (or until `options.timeout` elapses),
/// capturing stdout/stderr, writing a structured log file if
/// `options.log_path` is set, and classifying not-found (127) and
/// permission-denied (126) spawn failures the way a shell would.
pub async fn run_command(spec: CommandSpec, options: RunCommandOptions) -> ExecResult {
    let start = Instant::now();
    let display = spec.display();
    let mut cmd = spec.to_tokio_command();

    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());

    #[cfg(unix)]
    {
        // Detach into our own process group so a timeout or cancellation
        // can kill the whole subprocess tree (e.g. a shell-launched
        // `npm run dev` and its `node` child) with one killpg call.
        cmd.process_group(0);
    }

    if let Some(log_path) = &options.log_path {
        let _ = write_log_header(log_path, &display, &options).await;
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            let (exit_code, message) = classify_spawn_error(&err);
            let result = ExecResult {
                command: display,
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: false,
                error: Some(message),
                log_path: options.log_path.clone(),
            };
            if let Some(log_path) = &options.log_path {
                let _ = write_log_footer(log_path, &result).await;
            }
            return result;
        }
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let wait_and_read = async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let stdout_fut = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stdout_buf).await;
            }
        };
        let stderr_fut = async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr_buf).await;
            }
        };
        let (status, (), ()) = tokio::join!(child.wait(), stdout_fut, stderr_fut);
        (status, stdout_buf, stderr_buf)
    };

    let pid = child.id();

    let (exit_code, stdout, stderr, timed_out, error) =
        match tokio::time::timeout(options.timeout, wait_and_read).await {
            Ok((status, stdout_buf, stderr_buf)) => {
                let exit_code = status
                    .ok()
                    .and_then(|s| s.code())
                    .unwrap_or(-1);
                (
                    exit_code,
                    String::from_utf8_lossy(&stdout_buf).into_owned(),
                    String::from_utf8_lossy(&stderr_buf).into_owned(),
                    false,
                    None,
                )
            }
            Err(_) => {
                kill_process_group(pid);
                let _ = child.kill().await;
                (
                    -1,
                    String::new(),
                    String::new(),
                    true,
                    Some(format!(
                        "command timed out after {}s",
                        options.timeout.as_secs()
                    )),
                )
            }
        };

    let result = ExecResult {
        command: display,
        exit_code,
        stdout: truncate_output(&stdout, MAX_STORED_OUTPUT),
        stderr: truncate_output(&stderr, MAX_STORED_OUTPUT),
        duration_ms: start.elapsed().as_millis() as u64,
        timed_out,
        error,
        log_path: options.log_path.clone(),
    };

    if let Some(log_path) = &options.log_path {
        let _ = write_log_footer(log_path, &result).await;
    }

    result
}

fn classify_spawn_error(err: &std::io::Error) -> (i32, String) {
    match err.kind() {
        std::io::ErrorKind::NotFound => (127, format!("command not found: {err}")),
        std::io::ErrorKind::PermissionDenied => (126, format!("permission denied: {err}")),
        _ => (-1, err.to_string()),
    }
}

async fn write_log_header(
    log_path: &PathBuf,
    command: &str,
    options: &RunCommandOptions,
) -> Result<(), ExecError> {
    if let Some(parent) = log_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let mut file = tokio::fs::File::create(log_path)
        .await
        .map_err(|e| ExecError::LogWrite(log_path.clone(), e))?;
    let header = format!(
        "# Command: {command}\n# Started: {}\n# CWD: {}\n# Timeout: {}s\n\n",
        Utc::now().to_rfc3339(),
        options
            .cwd
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string()),
        options.timeout.as_secs(),
    );
    file.write_all(header.as_bytes())
        .await
        .map_err(|e| ExecError::LogWrite(log_path.clone(), e))?;
    Ok(())
}

async fn write_log_footer(log_path: &PathBuf, result: &ExecResult) -> Result<(), ExecError> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_path)
        .await
        .map_err(|e| ExecError::LogWrite(log_path.clone(), e))?;
    let mut footer = String::new();
    footer.push_str("# STDOUT:\n");
    footer.push_str(&result.stdout);
    footer.push_str("\n\n# STDERR:\n");
    footer.push_str(&result.stderr);
    footer.push_str(&format!(
        "\n\n# Ended: {}\n# Duration: {}ms\n# Exit code: {}\n",
        Utc::now().to_rfc3339(),
        result.duration_ms,
        result.exit_code
    ));
    if result.timed_out {
        footer.push_str("# TIMED OUT\n");
    }
    if let Some(error) = &result.error {
        footer.push_str(&format!("# Error: {error}\n"));
    }
    file.write_all(footer.as_bytes())
        .await
        .map_err(|e| ExecError::LogWrite(log_path.clone(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_output_below_limit_is_unchanged() {
        let out = "short output";
        assert_eq!(truncate_output(out, 1000), out);
    }

    #[test]
    fn truncate_output_above_limit_keeps_head_and_tail() {
        let out = "a".repeat(100) + &"b".repeat(100);
        let truncated = truncate_output(&out, 100);
        assert!(truncated.starts_with("aaaa"));
        assert!(truncated.ends_with("bbbb"));
        assert!(truncated.contains("truncated"));
    }

    #[test]
    fn truncate_lines_below_threshold_is_unchanged() {
        let out = (0..5).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        assert_eq!(truncate_lines(&out, 10, 10), out);
    }

    #[test]
    fn truncate_lines_above_threshold_keeps_head_and_tail() {
        let out = (0..40).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let truncated = truncate_lines(&out, 10, 10);
        assert!(truncated.starts_with("line 0"));
        assert!(truncated.ends_with("line 39"));
        assert!(truncated.contains("omitted"));
    }

    #[tokio::test]
    async fn run_command_captures_exit_code_and_stdout() {
        let result = run_command(
            CommandSpec::Shell("echo hello".to_string()),
            RunCommandOptions::default(),
        )
        .await;
        assert!(result.success());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn run_command_reports_nonzero_exit() {
        let result = run_command(
            CommandSpec::Shell("exit 3".to_string()),
            RunCommandOptions::default(),
        )
        .await;
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn run_command_classifies_missing_binary() {
        let result = run_command(
            CommandSpec::Argv(vec!["definitely-not-a-real-binary-xyz".to_string()]),
            RunCommandOptions::default(),
        )
        .await;
        assert_eq!(result.exit_code, 127);
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let mut options = RunCommandOptions::default();
        options.timeout = Duration::from_millis(100);
        let result = run_command(CommandSpec::Shell("sleep 5".to_string()), options).await;
        assert!(result.timed_out);
    }
}
