//! Claude CLI invocation: the concrete agent sub-CLI contract from the
//! spec's external-interfaces section.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;

use crate::exec::{run_command, CommandSpec, RunCommandOptions};

pub const DEFAULT_CLAUDE_CMD: &str = "claude";

#[derive(Debug, Clone)]
pub struct ClaudeResult {
    pub success: bool,
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub timed_out: bool,
    pub log_path: Option<PathBuf>,
}

impl ClaudeResult {
    /// Display-friendly truncation: 2500 characters from each end, a
    /// flat marker in between. The on-disk log keeps the full output;
    /// this is only for what gets echoed to the user/terminal.
    pub fn truncated_output(&self) -> String {
        let chars: Vec<char> = self.output.chars().collect();
        if chars.len() <= 5000 {
            return self.output.clone();
        }
        let head: String = chars[..2500].iter().collect();
        let tail: String = chars[chars.len() - 2500..].iter().collect();
        format!("{head}\n\n... [truncated] ...\n\n{tail}")
    }
}

/// Options accepted by one Claude CLI invocation, mirroring the fixed
/// sub-CLI contract: `<cmd> --print [-m <model>] [--allowedTools <csv>]
/// [--max-turns <n>] -p <prompt>`.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub timeout: Option<Duration>,
    pub task_id: Option<String>,
}

pub struct ClaudeRunner {
    claude_cmd: String,
    default_timeout: Duration,
    logs_dir: Option<PathBuf>,
    repo_root: PathBuf,
}

impl ClaudeRunner {
    pub fn new(
        claude_cmd: Option<String>,
        default_timeout: Duration,
        logs_dir: Option<PathBuf>,
        repo_root: PathBuf,
    ) -> Self {
        let claude_cmd = claude_cmd
            .or_else(|| std::env::var("RALPH_CLAUDE_CMD").ok())
            .unwrap_or_else(|| DEFAULT_CLAUDE_CMD.to_string());
        Self {
            claude_cmd,
            default_timeout,
            logs_dir,
            repo_root,
        }
    }

    fn build_argv(&self, prompt: &str, opts: &InvokeOptions) -> Vec<String> {
        let mut argv: Vec<String> = shell_split(&self.claude_cmd);
        argv.push("--print".to_string());
        if let Some(model) = &opts.model {
            argv.push("-m".to_string());
            argv.push(model.clone());
        }
        if !opts.allowed_tools.is_empty() {
            argv.push("--allowedTools".to_string());
            argv.push(opts.allowed_tools.join(","));
        }
        if let Some(max_turns) = opts.max_turns {
            argv.push("--max-turns".to_string());
            argv.push(max_turns.to_string());
        }
        argv.push("-p".to_string());
        argv.push(prompt.to_string());
        argv
    }

    pub async fn invoke(&self, prompt: &str, role: &str, opts: InvokeOptions) -> ClaudeResult {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let argv = self.build_argv(prompt, &opts);

        let log_path = self.logs_dir.as_ref().map(|dir| {
            let timestamp = Local::now().format("%H%M%S");
            let name = match &opts.task_id {
                Some(task_id) => format!("{task_id}-{role}-{timestamp}.log"),
                None => format!("{role}-{timestamp}.log"),
            };
            dir.join(name)
        });

        tracing::info!(role, task_id = ?opts.task_id, "invoking agent");

        let run_options = RunCommandOptions {
            cwd: Some(self.repo_root.clone()),
            timeout,
            env: Vec::new(),
            log_path: log_path.clone(),
        };

        let exec_result = run_command(CommandSpec::Argv(argv), run_options).await;

        ClaudeResult {
            success: exec_result.success(),
            output: exec_result.stdout.clone(),
            exit_code: exec_result.exit_code,
            duration_ms: exec_result.duration_ms,
            error: exec_result.error.clone(),
            timed_out: exec_result.timed_out,
            log_path,
        }
    }
}

/// Minimal whitespace-aware split, enough for the simple base commands
/// this is ever configured with (`claude`, `npx @anthropic/claude`, a
/// wrapper script path). Does not implement full shell quoting.
fn shell_split(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(std::string::ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ClaudeRunner {
        ClaudeRunner::new(
            Some("claude".to_string()),
            Duration::from_secs(1800),
            None,
            PathBuf::from("."),
        )
    }

    #[test]
    fn build_argv_minimal() {
        let argv = runner().build_argv("do the thing", &InvokeOptions::default());
        assert_eq!(
            argv,
            vec!["claude", "--print", "-p", "do the thing"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn build_argv_with_all_options() {
        let opts = InvokeOptions {
            model: Some("sonnet".to_string()),
            allowed_tools: vec!["Read".to_string(), "Edit".to_string()],
            max_turns: Some(5),
            timeout: None,
            task_id: None,
        };
        let argv = runner().build_argv("prompt", &opts);
        assert_eq!(
            argv,
            vec![
                "claude",
                "--print",
                "-m",
                "sonnet",
                "--allowedTools",
                "Read,Edit",
                "--max-turns",
                "5",
                "-p",
                "prompt"
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
        );
    }

    #[test]
    fn truncated_output_short_is_unchanged() {
        let result = ClaudeResult {
            success: true,
            output: "short".to_string(),
            exit_code: 0,
            duration_ms: 0,
            error: None,
            timed_out: false,
            log_path: None,
        };
        assert_eq!(result.truncated_output(), "short");
    }

    #[test]
    fn env_override_is_used_when_no_explicit_cmd() {
        std::env::set_var("RALPH_CLAUDE_CMD", "my-claude-wrapper");
        let runner = ClaudeRunner::new(None, Duration::from_secs(1), None, PathBuf::from("."));
        let argv = runner.build_argv("p", &InvokeOptions::default());
        assert_eq!(argv[0], "my-claude-wrapper");
        std::env::remove_var("RALPH_CLAUDE_CMD");
    }
}
