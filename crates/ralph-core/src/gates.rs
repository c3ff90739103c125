//! Quality gate execution: build gates (fast, run every iteration) and
//! full gates (complete verification, run before declaring a task done).

use std::path::{Path, PathBuf};
use std::time::Duration;

use ralph_adapters::exec::{run_command, truncate_lines, CommandSpec, ExecResult, RunCommandOptions};

use crate::config::{GateSpec, GatesConfig, RalphConfig};
use crate::timeline::TimelineLogger;

#[derive(Debug, Clone)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub fatal: bool,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GatesResult {
    pub gate_type: String,
    pub passed: bool,
    pub results: Vec<GateResult>,
    pub fatal_failure: Option<GateResult>,
}

impl GatesResult {
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed && !r.skipped).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.passed && !r.skipped).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.results.iter().filter(|r| r.skipped).count()
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.results.iter().map(|r| r.duration_ms).sum()
    }
}

pub struct GateRunner<'a> {
    config: &'a RalphConfig,
    repo_root: PathBuf,
    logs_dir: Option<PathBuf>,
    timeline: Option<&'a TimelineLogger>,
}

fn gates_for(gates: &GatesConfig, gate_type: &str) -> &[GateSpec] {
    match gate_type {
        "build" => &gates.build,
        _ => &gates.full,
    }
}

impl<'a> GateRunner<'a> {
    pub fn new(
        config: &'a RalphConfig,
        repo_root: PathBuf,
        logs_dir: Option<PathBuf>,
        timeline: Option<&'a TimelineLogger>,
    ) -> Self {
        Self {
            config,
            repo_root,
            logs_dir,
            timeline,
        }
    }

    fn check_condition(&self, gate: &GateSpec) -> (bool, Option<String>) {
        let Some(when) = &gate.when else {
            return (true, None);
        };
        let condition_path = self.repo_root.join(when);
        if condition_path.exists() {
            (true, None)
        } else {
            (false, Some(format!("Condition not met: {when} does not exist")))
        }
    }

    async fn run_gate(&self, gate: &GateSpec, task_id: Option<&str>) -> GateResult {
        let (should_run, skip_reason) = self.check_condition(gate);
        if !should_run {
            return GateResult {
                name: gate.name.clone(),
                passed: true,
                exit_code: 0,
                duration_ms: 0,
                output: String::new(),
                error: None,
                timed_out: false,
                skipped: true,
                skip_reason,
                fatal: gate.fatal,
                log_path: None,
            };
        }

        let log_path = self
            .logs_dir
            .as_ref()
            .map(|dir| dir.join(format!("gate-{}.log", gate.name)));

        let exec_result: ExecResult = run_command(
            CommandSpec::Shell(gate.cmd.clone()),
            RunCommandOptions {
                cwd: Some(self.repo_root.clone()),
                timeout: Duration::from_secs(gate.timeout_seconds),
                log_path: log_path.clone(),
                ..Default::default()
            },
        )
        .await;

        let result = GateResult {
            name: gate.name.clone(),
            passed: exec_result.success(),
            exit_code: exec_result.exit_code,
            duration_ms: exec_result.duration_ms,
            output: exec_result.truncated_output(2000),
            error: exec_result.error.clone(),
            timed_out: exec_result.timed_out,
            fatal: gate.fatal,
            skipped: false,
            skip_reason: None,
            log_path,
        };

        if let Some(timeline) = self.timeline {
            if result.passed {
                timeline.gate_pass(&result.name, result.duration_ms, task_id);
            } else {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Exit code {}", result.exit_code));
                timeline.gate_fail(&result.name, &error, result.duration_ms, task_id, gate.fatal);
            }
        }

        result
    }

    pub async fn run_gates(
        &self,
        gate_type: &str,
        task_id: Option<&str>,
        stop_on_fatal: bool,
    ) -> GatesResult {
        let gates = gates_for(&self.config.gates, gate_type);
        if gates.is_empty() {
            return GatesResult {
                gate_type: gate_type.to_string(),
                passed: true,
                results: Vec::new(),
                fatal_failure: None,
            };
        }

        if let Some(timeline) = self.timeline {
            timeline.gates_run(gate_type, gates.len(), task_id);
        }

        let mut results = Vec::new();
        let mut fatal_failure = None;

        for gate in gates {
            let result = self.run_gate(gate, task_id).await;
            let is_fatal_failure = !result.passed && result.fatal && !result.skipped;
            results.push(result);
            if is_fatal_failure {
                fatal_failure = results.last().cloned();
                if stop_on_fatal {
                    break;
                }
            }
        }

        GatesResult {
            gate_type: gate_type.to_string(),
            passed: fatal_failure.is_none(),
            results,
            fatal_failure,
        }
    }

    pub async fn run_build_gates(&self, task_id: Option<&str>) -> GatesResult {
        self.run_gates("build", task_id, true).await
    }

    pub async fn run_full_gates(&self, task_id: Option<&str>) -> GatesResult {
        self.run_gates("full", task_id, true).await
    }
}

pub fn create_gate_runner<'a>(
    config: &'a RalphConfig,
    repo_root: &Path,
    logs_dir: Option<&Path>,
    timeline: Option<&'a TimelineLogger>,
) -> GateRunner<'a> {
    GateRunner::new(
        config,
        repo_root.to_path_buf(),
        logs_dir.map(Path::to_path_buf),
        timeline,
    )
}

pub fn format_gate_failure(result: &GateResult) -> String {
    let mut lines = vec![format!(
        "Gate '{}' failed (exit code {})",
        result.name, result.exit_code
    )];

    if result.timed_out {
        lines.push("  Timed out after timeout limit".to_string());
    }
    if let Some(error) = &result.error {
        lines.push(format!("  Error: {error}"));
    }
    if !result.output.is_empty() {
        lines.push(format!("  Output:\n{}", truncate_lines(&result.output, 10, 10)));
    }

    lines.join("\n")
}

pub fn format_gates_summary(result: &GatesResult) -> String {
    let mut lines = vec![format!(
        "Gates ({}): {} passed, {} failed, {} skipped",
        result.gate_type,
        result.passed_count(),
        result.failed_count(),
        result.skipped_count()
    )];

    for gate_result in &result.results {
        let (status, suffix) = if gate_result.skipped {
            (
                "skip",
                format!(
                    " (skipped: {})",
                    gate_result.skip_reason.as_deref().unwrap_or("unknown")
                ),
            )
        } else if gate_result.passed {
            ("pass", format!(" ({}ms)", gate_result.duration_ms))
        } else {
            ("fail", format!(" (failed, exit {})", gate_result.exit_code))
        };
        lines.push(format!("  [{status}] {}{suffix}", gate_result.name));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatesConfig, Limits, RalphConfig};
    use std::collections::HashMap;

    fn config_with_gates(build: Vec<GateSpec>, full: Vec<GateSpec>) -> RalphConfig {
        RalphConfig {
            task_source: PathBuf::from("prd.json"),
            gates: GatesConfig { build, full },
            agents: HashMap::new(),
            backend: None,
            frontend: None,
            test_paths: vec![],
            limits: Limits::default(),
            ui: None,
            repo_root: PathBuf::from("."),
            path: None,
        }
    }

    fn gate(name: &str, cmd: &str, fatal: bool, when: Option<&str>) -> GateSpec {
        GateSpec {
            name: name.to_string(),
            cmd: cmd.to_string(),
            timeout_seconds: 5,
            fatal,
            when: when.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn empty_gate_list_passes_trivially() {
        let config = config_with_gates(vec![], vec![]);
        let runner = GateRunner::new(&config, PathBuf::from("."), None, None);
        let result = runner.run_build_gates(None).await;
        assert!(result.passed);
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn fatal_failure_stops_subsequent_gates() {
        let config = config_with_gates(
            vec![
                gate("lint", "exit 1", true, None),
                gate("build", "echo should-not-run", true, None),
            ],
            vec![],
        );
        let runner = GateRunner::new(&config, PathBuf::from("."), None, None);
        let result = runner.run_build_gates(None).await;
        assert!(!result.passed);
        assert_eq!(result.results.len(), 1);
        assert!(result.fatal_failure.is_some());
    }

    #[tokio::test]
    async fn non_fatal_failure_continues() {
        let config = config_with_gates(
            vec![
                gate("lint", "exit 1", false, None),
                gate("build", "exit 0", true, None),
            ],
            vec![],
        );
        let runner = GateRunner::new(&config, PathBuf::from("."), None, None);
        let result = runner.run_build_gates(None).await;
        assert!(result.passed);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.failed_count(), 1);
    }

    #[tokio::test]
    async fn when_condition_skips_gate() {
        let config = config_with_gates(
            vec![gate("e2e", "echo never-runs", true, Some("definitely-missing-dir"))],
            vec![],
        );
        let runner = GateRunner::new(&config, PathBuf::from("."), None, None);
        let result = runner.run_build_gates(None).await;
        assert!(result.passed);
        assert!(result.results[0].skipped);
    }

    #[test]
    fn format_gate_failure_includes_name_and_exit_code() {
        let result = GateResult {
            name: "lint".to_string(),
            passed: false,
            exit_code: 1,
            duration_ms: 10,
            output: "err".to_string(),
            error: None,
            timed_out: false,
            skipped: false,
            skip_reason: None,
            fatal: true,
            log_path: None,
        };
        let formatted = format_gate_failure(&result);
        assert!(formatted.contains("lint"));
        assert!(formatted.contains("exit code 1"));
    }
}
