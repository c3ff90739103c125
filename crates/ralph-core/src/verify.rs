//! Post-completion verification: full gates, optional service startup,
//! UI test suites, and a bounded plan→implement→retest fix loop.
//!
//! UI test execution itself is modeled generically: a suite is whatever
//! shell command `ui.agent_browser`/`ui.robot` configures, run the same
//! way a gate is run. This crate does not ship a browser-automation or
//! Robot Framework driver of its own; it treats the configured command's
//! exit code as pass/fail, the same boundary the gate runner already
//! draws for arbitrary external tooling.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use ralph_adapters::claude::{ClaudeRunner, InvokeOptions};
use ralph_adapters::exec::{run_command, CommandSpec, RunCommandOptions};
use ralph_proto::RoleVerb;

use crate::config::{AgentRole, RalphConfig, UiSuiteConfig};
use crate::context::RunContext;
use crate::gates::{format_gates_summary, GateRunner, GatesResult};
use crate::prompts::{allowed_tools_for_role, build_ui_implementation_prompt, build_ui_planning_prompt};
use crate::service::ServiceManager;
use crate::session::{create_session, Session};
use crate::signal::find_signal;
use crate::timeline::TimelineLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyExitCode {
    Success = 0,
    ConfigError = 1,
    GateFailure = 4,
    UiTestFailure = 5,
    RobotTestFailure = 6,
    ServiceFailure = 9,
}

impl VerifyExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub gate_type: String,
    pub run_ui: Option<bool>,
    pub run_robot: Option<bool>,
    pub env: String,
    pub fix: bool,
    pub fix_iterations: u32,
    pub skip_services: bool,
    pub base_url: Option<String>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            gate_type: "full".to_string(),
            run_ui: None,
            run_robot: None,
            env: "dev".to_string(),
            fix: false,
            fix_iterations: 10,
            skip_services: false,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UiTestResult {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub screenshot_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UiTestSuiteResult {
    pub framework: String,
    pub results: Vec<UiTestResult>,
}

impl UiTestSuiteResult {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn failures(&self) -> Vec<UiTestResult> {
        self.results.iter().filter(|r| !r.passed).cloned().collect()
    }
}

fn format_failure_description(failure: &UiTestResult, framework: &str) -> String {
    format!(
        "[{framework}] {} failed: {}",
        failure.name,
        failure.error.as_deref().unwrap_or("no error detail available")
    )
}

#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    pub exit_code_value: i32,
    pub gates_result: Option<GatesResult>,
    pub services_started: bool,
    pub agent_browser_result: Option<UiTestSuiteResult>,
    pub robot_result: Option<UiTestSuiteResult>,
    pub fix_iterations: u32,
    pub total_duration_ms: u64,
    pub error: Option<String>,
    /// Set when the run ended because of SIGINT/SIGTERM (2 or 15). The
    /// CLI propagates this as the conventional `128 + signum` process
    /// exit code rather than `exit_code_value`'s generic value.
    pub aborted_signum: Option<i32>,
}

impl VerifyResult {
    pub fn all_passed(&self) -> bool {
        if let Some(gates) = &self.gates_result {
            if !gates.passed {
                return false;
            }
        }
        if let Some(ab) = &self.agent_browser_result {
            if !ab.passed() {
                return false;
            }
        }
        if let Some(robot) = &self.robot_result {
            if !robot.passed() {
                return false;
            }
        }
        true
    }
}

async fn run_ui_suite(suite_config: &UiSuiteConfig, framework: &str, base_url: &str) -> UiTestSuiteResult {
    let start = Instant::now();
    let mut argv = vec![suite_config.command.clone()];
    argv.extend(suite_config.args.iter().cloned());
    let result = run_command(
        CommandSpec::Argv(argv),
        RunCommandOptions {
            env: vec![("RALPH_BASE_URL".to_string(), base_url.to_string())],
            timeout: Duration::from_secs(600),
            ..Default::default()
        },
    )
    .await;

    UiTestSuiteResult {
        framework: framework.to_string(),
        results: vec![UiTestResult {
            name: framework.to_string(),
            passed: result.success(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: if result.success() {
                None
            } else {
                Some(result.truncated_output(2000))
            },
            screenshot_path: None,
        }],
    }
}

fn is_agent_browser_enabled(config: &RalphConfig) -> bool {
    config
        .ui
        .as_ref()
        .and_then(|ui| ui.agent_browser.as_ref())
        .is_some_and(|s| s.enabled)
}

fn is_robot_enabled(config: &RalphConfig) -> bool {
    config.ui.as_ref().and_then(|ui| ui.robot.as_ref()).is_some_and(|s| s.enabled)
}

pub struct VerifyEngine<'a> {
    config: &'a RalphConfig,
    session: &'a mut Session,
    timeline: &'a TimelineLogger,
    gates: &'a GateRunner<'a>,
    services: &'a ServiceManager<'a>,
    claude: Option<&'a ClaudeRunner>,
    options: VerifyOptions,
    run_agent_browser: bool,
    run_robot: bool,
}

impl<'a> VerifyEngine<'a> {
    pub fn new(
        config: &'a RalphConfig,
        session: &'a mut Session,
        timeline: &'a TimelineLogger,
        gates: &'a GateRunner<'a>,
        services: &'a ServiceManager<'a>,
        claude: Option<&'a ClaudeRunner>,
        options: VerifyOptions,
    ) -> Self {
        let run_agent_browser = options.run_ui.unwrap_or_else(|| is_agent_browser_enabled(config));
        let run_robot = options.run_robot.unwrap_or_else(|| is_robot_enabled(config));
        Self {
            config,
            session,
            timeline,
            gates,
            services,
            claude,
            options,
            run_agent_browser,
            run_robot,
        }
    }

    async fn run_gates(&self) -> GatesResult {
        if self.options.gate_type == "none" {
            return GatesResult {
                gate_type: "none".to_string(),
                passed: true,
                results: vec![],
                fatal_failure: None,
            };
        }
        self.gates.run_gates(&self.options.gate_type, None, true).await
    }

    async fn start_services(&self) -> bool {
        let results = self
            .services
            .start_all(self.options.env == "prod")
            .await;
        results.values().all(|r| r.success)
    }

    async fn get_base_url(&self) -> Option<String> {
        if let Some(url) = &self.options.base_url {
            return Some(url.clone());
        }
        self.services.get_base_url(true).await
    }

    async fn run_agent_browser_tests(&self, base_url: &str) -> UiTestSuiteResult {
        let suite_config = self
            .config
            .ui
            .as_ref()
            .and_then(|ui| ui.agent_browser.clone())
            .unwrap_or_default();
        run_ui_suite(&suite_config, "agent_browser", base_url).await
    }

    async fn run_robot_tests(&self, base_url: &str) -> UiTestSuiteResult {
        let suite_config = self.config.ui.as_ref().and_then(|ui| ui.robot.clone()).unwrap_or_default();
        run_ui_suite(&suite_config, "robot", base_url).await
    }

    async fn run_ui_fix_loop(&self, mut failures: Vec<UiTestResult>, framework: &str, base_url: &str) -> bool {
        let Some(claude) = self.claude else {
            return false;
        };
        if failures.is_empty() {
            return false;
        }
        let Some(session_token) = self.session.session_token().map(str::to_string) else {
            return false;
        };

        let max_iterations = self.options.fix_iterations;
        self.timeline.fix_loop_start(framework, max_iterations);

        for iteration in 1..=max_iterations {
            let failure_descriptions: Vec<String> = failures
                .iter()
                .map(|f| format_failure_description(f, framework))
                .collect();

            let plan_prompt = build_ui_planning_prompt(&failure_descriptions, &session_token, framework);
            let planning_config = self.config.get_agent_config(AgentRole::Planning);
            let plan_result = claude
                .invoke(
                    &plan_prompt,
                    "planning",
                    InvokeOptions {
                        model: planning_config.model.clone(),
                        allowed_tools: allowed_tools_for_role(AgentRole::Planning),
                        timeout: planning_config.timeout.map(Duration::from_secs),
                        ..Default::default()
                    },
                )
                .await;

            if !plan_result.success {
                self.timeline.fix_loop_iteration(framework, iteration, "planning_failed");
                continue;
            }

            let plan_verb = if framework == "robot" { RoleVerb::RobotPlan } else { RoleVerb::UiPlan };
            let plan_status = find_signal(&plan_result.output, plan_verb, &session_token);
            if !plan_status.is_valid() {
                self.timeline.fix_loop_iteration(framework, iteration, "invalid_plan_signal");
                continue;
            }
            let plan_body = plan_status.signal().unwrap().body.clone();

            let impl_prompt = build_ui_implementation_prompt(&plan_body, &session_token, framework);
            let impl_config = self.config.get_agent_config(AgentRole::Implementation);
            let impl_result = claude
                .invoke(
                    &impl_prompt,
                    "ui_implementation",
                    InvokeOptions {
                        model: impl_config.model.clone(),
                        allowed_tools: allowed_tools_for_role(AgentRole::Implementation),
                        timeout: impl_config.timeout.map(Duration::from_secs),
                        ..Default::default()
                    },
                )
                .await;

            if !impl_result.success {
                self.timeline.fix_loop_iteration(framework, iteration, "implementation_failed");
                continue;
            }

            let fix_verb = if framework == "robot" { RoleVerb::RobotFixDone } else { RoleVerb::UiFixDone };
            let fix_status = find_signal(&impl_result.output, fix_verb, &session_token);
            if !fix_status.is_valid() {
                self.timeline.fix_loop_iteration(framework, iteration, "invalid_fix_signal");
                continue;
            }

            let retest_result = if framework == "robot" {
                self.run_robot_tests(base_url).await
            } else {
                self.run_agent_browser_tests(base_url).await
            };

            if retest_result.passed() {
                self.timeline.fix_loop_end(framework, true, iteration);
                return true;
            }

            failures = retest_result.failures();
            self.timeline.fix_loop_iteration(framework, iteration, "tests_still_failing");
        }

        self.timeline.fix_loop_end(framework, false, max_iterations);
        false
    }

    /// Races the whole verify run against SIGINT/SIGTERM. A signal landing
    /// mid health-poll or mid UI-suite still leaves no service running:
    /// `ServiceManager::run_with_abort` stops every tracked service and
    /// sweeps stray pid files before this returns.
    pub async fn run(&self) -> VerifyResult {
        match self.services.run_with_abort(self.run_inner()).await {
            Ok(result) => result,
            Err(signum) => VerifyResult {
                exit_code_value: VerifyExitCode::Success.as_i32(),
                aborted_signum: Some(signum),
                error: Some("aborted by signal".to_string()),
                ..Default::default()
            },
        }
    }

    async fn run_inner(&self) -> VerifyResult {
        let start = Instant::now();

        let gates_result = self.run_gates().await;
        if !gates_result.passed {
            return VerifyResult {
                exit_code_value: VerifyExitCode::GateFailure.as_i32(),
                gates_result: Some(gates_result),
                total_duration_ms: start.elapsed().as_millis() as u64,
                error: Some("Gate failure".to_string()),
                ..Default::default()
            };
        }

        let mut services_started = false;
        if !self.options.skip_services && (self.run_agent_browser || self.run_robot) {
            services_started = self.start_services().await;
            if !services_started && self.options.base_url.is_none() {
                self.services.stop_all().await;
                return VerifyResult {
                    exit_code_value: VerifyExitCode::ServiceFailure.as_i32(),
                    gates_result: Some(gates_result),
                    services_started: false,
                    total_duration_ms: start.elapsed().as_millis() as u64,
                    error: Some("Service startup failed".to_string()),
                    ..Default::default()
                };
            }
        }

        let base_url = self.get_base_url().await;

        let mut agent_browser_result = None;
        let mut robot_result = None;
        let mut fix_iterations = 0u32;

        if let Some(base_url) = &base_url {
            if self.run_agent_browser {
                let mut result = self.run_agent_browser_tests(base_url).await;
                if !result.passed() && self.options.fix {
                    if self.run_ui_fix_loop(result.failures(), "agent_browser", base_url).await {
                        result = self.run_agent_browser_tests(base_url).await;
                        fix_iterations += 1;
                    }
                }
                agent_browser_result = Some(result);
            }

            if self.run_robot {
                let mut result = self.run_robot_tests(base_url).await;
                if !result.passed() && self.options.fix {
                    if self.run_ui_fix_loop(result.failures(), "robot", base_url).await {
                        result = self.run_robot_tests(base_url).await;
                        fix_iterations += 1;
                    }
                }
                robot_result = Some(result);
            }
        }

        if services_started {
            self.services.stop_all().await;
        }

        let total_duration_ms = start.elapsed().as_millis() as u64;

        let mut exit_code_value = VerifyExitCode::Success.as_i32();
        let mut error = None;
        if let Some(ab) = &agent_browser_result {
            if !ab.passed() {
                exit_code_value = VerifyExitCode::UiTestFailure.as_i32();
                error = Some("UI test failures".to_string());
            }
        }
        if let Some(robot) = &robot_result {
            if !robot.passed() {
                exit_code_value = VerifyExitCode::RobotTestFailure.as_i32();
                error = Some("Robot Framework test failures".to_string());
            }
        }

        VerifyResult {
            exit_code_value,
            gates_result: Some(gates_result),
            services_started,
            agent_browser_result,
            robot_result,
            fix_iterations,
            total_duration_ms,
            error,
            aborted_signum: None,
        }
    }
}

/// Runs verification standalone: creates its own session (`task_source
/// = "verify"`, no pending tasks) and ends it once the run finishes,
/// status depending on whether the run succeeded.
pub async fn run_verify(ctx: &RunContext, options: VerifyOptions) -> VerifyResult {
    let mut session = match create_session(
        "verify",
        "verify",
        ctx.config.path.as_ref().and_then(|p| p.to_str()),
        &[],
        Some(ctx.session_dir()),
        ctx.repo_root.clone(),
    ) {
        Ok(session) => session,
        Err(e) => {
            return VerifyResult {
                exit_code_value: VerifyExitCode::ConfigError.as_i32(),
                error: Some(e.to_string()),
                ..Default::default()
            };
        }
    };

    let timeline = TimelineLogger::new(session.timeline_path(), session.session_id().map(str::to_string));
    let gates = GateRunner::new(&ctx.config, ctx.repo_root.clone(), Some(session.logs_dir()), Some(&timeline));
    let services = match ServiceManager::new(&ctx.config, Some(&ctx.session_dir()), &options.env, Some(&timeline)) {
        Ok(services) => services,
        Err(e) => {
            return VerifyResult {
                exit_code_value: VerifyExitCode::ServiceFailure.as_i32(),
                error: Some(e.to_string()),
                ..Default::default()
            };
        }
    };
    let claude = if options.fix {
        Some(ClaudeRunner::new(
            ctx.claude_cmd_override.clone(),
            Duration::from_secs(ctx.config.limits.agent_timeout),
            Some(session.logs_dir()),
            ctx.repo_root.clone(),
        ))
    } else {
        None
    };

    let engine = VerifyEngine::new(&ctx.config, &mut session, &timeline, &gates, &services, claude.as_ref(), options);
    let result = engine.run().await;

    let status = if result.aborted_signum.is_some() {
        "aborted"
    } else if result.exit_code_value == VerifyExitCode::Success.as_i32() {
        "completed"
    } else {
        "failed"
    };
    let _ = session.end_session(status, result.error.as_deref());

    result
}

/// Runs verification reusing an already-open session/timeline, handed off
/// from the task loop's post-completion step. Does not end the session —
/// the caller owns that lifecycle.
pub async fn run_post_verify<'a>(
    config: &'a RalphConfig,
    session: &'a mut Session,
    timeline: &'a TimelineLogger,
    options: VerifyOptions,
) -> VerifyResult {
    let gates = GateRunner::new(config, config.repo_root.clone(), Some(session.logs_dir()), Some(timeline));
    let services = match ServiceManager::new(config, Some(&session.session_dir), &options.env, Some(timeline)) {
        Ok(services) => services,
        Err(e) => {
            return VerifyResult {
                exit_code_value: VerifyExitCode::ServiceFailure.as_i32(),
                error: Some(e.to_string()),
                ..Default::default()
            };
        }
    };
    let claude = if options.fix {
        Some(ClaudeRunner::new(
            None,
            Duration::from_secs(config.limits.agent_timeout),
            Some(session.logs_dir()),
            config.repo_root.clone(),
        ))
    } else {
        None
    };

    let engine = VerifyEngine::new(config, session, timeline, &gates, &services, claude.as_ref(), options);
    engine.run().await
}

pub fn format_verify_summary(result: &VerifyResult) -> String {
    let mut lines = Vec::new();
    if let Some(gates) = &result.gates_result {
        lines.push(format_gates_summary(gates));
    }
    if let Some(ab) = &result.agent_browser_result {
        lines.push(format!("UI Tests: {}/{} passed", ab.passed_count(), ab.results.len()));
    }
    if let Some(robot) = &result.robot_result {
        lines.push(format!("Robot Tests: {}/{} passed", robot.passed_count(), robot.results.len()));
    }
    if result.fix_iterations > 0 {
        lines.push(format!("Fix iterations: {}", result.fix_iterations));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_result_all_passed_is_true_with_no_suites_run() {
        let result = VerifyResult {
            exit_code_value: 0,
            gates_result: Some(GatesResult {
                gate_type: "full".to_string(),
                passed: true,
                results: vec![],
                fatal_failure: None,
            }),
            ..Default::default()
        };
        assert!(result.all_passed());
    }

    #[test]
    fn verify_result_fails_when_any_suite_fails() {
        let result = VerifyResult {
            exit_code_value: 5,
            gates_result: Some(GatesResult {
                gate_type: "full".to_string(),
                passed: true,
                results: vec![],
                fatal_failure: None,
            }),
            agent_browser_result: Some(UiTestSuiteResult {
                framework: "agent_browser".to_string(),
                results: vec![UiTestResult {
                    name: "agent_browser".to_string(),
                    passed: false,
                    duration_ms: 10,
                    error: Some("boom".to_string()),
                    screenshot_path: None,
                }],
            }),
            ..Default::default()
        };
        assert!(!result.all_passed());
    }

    #[test]
    fn ui_suite_result_failures_only_returns_failed_tests() {
        let suite = UiTestSuiteResult {
            framework: "robot".to_string(),
            results: vec![
                UiTestResult {
                    name: "a".to_string(),
                    passed: true,
                    duration_ms: 1,
                    error: None,
                    screenshot_path: None,
                },
                UiTestResult {
                    name: "b".to_string(),
                    passed: false,
                    duration_ms: 1,
                    error: Some("x".to_string()),
                    screenshot_path: None,
                },
            ],
        };
        assert_eq!(suite.failures().len(), 1);
        assert_eq!(suite.failures()[0].name, "b");
    }
}
