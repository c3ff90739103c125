//! The verified task loop: implementation -> test-writing (guardrailed)
//! -> gates -> review, repeated per task until review approves or
//! `max_iterations` is exhausted.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ralph_adapters::claude::{ClaudeRunner, InvokeOptions};
use ralph_proto::{ExitCode, RoleVerb};

use crate::config::{load_config, AgentRole, RalphConfig};
use crate::context::RunContext;
use crate::gates::{format_gate_failure, GateRunner};
use crate::guardrail::FilePathGuardrail;
use crate::prompts::{
    allowed_tools_for_role, build_implementation_prompt, build_review_prompt, build_test_writing_prompt,
    feedback_for_bad_signal, feedback_for_gate_failure, feedback_for_review_rejection, TaskContext,
};
use crate::session::{create_session, load_session, Session};
use crate::signal::find_first_valid;
use crate::tasks::{get_pending_tasks, load_prd, mark_task_complete, save_prd, PrdData, Task};
use crate::timeline::TimelineLogger;
use crate::verify::{run_post_verify, VerifyOptions};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub prd_json: Option<PathBuf>,
    pub task_id: Option<String>,
    pub from_task_id: Option<String>,
    pub max_iterations: Option<u32>,
    pub gate_type: String,
    pub dry_run: bool,
    pub resume: bool,
    pub post_verify: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            prd_json: None,
            task_id: None,
            from_task_id: None,
            max_iterations: None,
            gate_type: "full".to_string(),
            dry_run: false,
            resume: false,
            post_verify: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRunResult {
    pub task_id: String,
    pub completed: bool,
    pub iterations: u32,
    pub duration_ms: u64,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub exit_code: i32,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_pending: usize,
    pub total_duration_ms: u64,
    pub task_results: Vec<TaskRunResult>,
    pub error: Option<String>,
    pub session_id: Option<String>,
    /// Set when the run ended because of SIGINT/SIGTERM (2 or 15). The
    /// CLI propagates this as the conventional `128 + signum` process
    /// exit code rather than `exit_code`'s generic `UserAbort` value.
    pub aborted_signum: Option<i32>,
}

impl RunResult {
    fn with_exit_code(exit_code: ExitCode) -> Self {
        Self {
            exit_code: exit_code.as_i32(),
            ..Default::default()
        }
    }
}

pub struct RunEngine<'a> {
    config: &'a RalphConfig,
    prd: &'a mut PrdData,
    prd_path: &'a Path,
    session: &'a mut Session,
    timeline: &'a TimelineLogger,
    claude: &'a ClaudeRunner,
    gates: &'a GateRunner<'a>,
    guardrail: &'a FilePathGuardrail<'a>,
    options: RunOptions,
    agents_md_content: String,
}

impl<'a> RunEngine<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a RalphConfig,
        prd: &'a mut PrdData,
        prd_path: &'a Path,
        session: &'a mut Session,
        timeline: &'a TimelineLogger,
        claude: &'a ClaudeRunner,
        gates: &'a GateRunner<'a>,
        guardrail: &'a FilePathGuardrail<'a>,
        options: RunOptions,
        agents_md_content: String,
    ) -> Self {
        Self {
            config,
            prd,
            prd_path,
            session,
            timeline,
            claude,
            gates,
            guardrail,
            options,
            agents_md_content,
        }
    }

    fn max_iterations(&self) -> u32 {
        self.options.max_iterations.unwrap_or(self.config.limits.max_iterations)
    }

    async fn invoke(&self, prompt: &str, role: &str, agent_role: AgentRole, task_id: &str) -> ralph_adapters::claude::ClaudeResult {
        let agent_config = self.config.get_agent_config(agent_role);
        let allowed_tools = if agent_config.allowed_tools.is_empty() {
            allowed_tools_for_role(agent_role)
        } else {
            agent_config.allowed_tools.clone()
        };
        self.timeline.agent_start(task_id, role, agent_config.model.as_deref());
        let result = self
            .claude
            .invoke(
                prompt,
                role,
                InvokeOptions {
                    model: agent_config.model.clone(),
                    allowed_tools,
                    timeout: agent_config.timeout.map(Duration::from_secs),
                    task_id: Some(task_id.to_string()),
                    ..Default::default()
                },
            )
            .await;
        if !result.success {
            self.timeline.agent_failed(
                task_id,
                role,
                result.error.as_deref().unwrap_or("agent invocation failed"),
                Some(result.duration_ms),
            );
        }
        result
    }

    async fn run_implementation(&self, task: &Task, session_token: &str, feedback: Option<&str>) -> (bool, String, Option<String>) {
        let context = TaskContext {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            notes: task.notes.clone(),
            previous_feedback: feedback.map(str::to_string),
        };
        let prompt = build_implementation_prompt(&context, session_token, &self.prd.description, &self.agents_md_content);

        let result = self.invoke(&prompt, "implementation", AgentRole::Implementation, &task.id).await;
        if !result.success {
            let error = result.error.unwrap_or_else(|| "unknown error".to_string());
            return (false, result.output, Some(format!("The Claude CLI invocation failed: {error}")));
        }

        match find_first_valid(&result.output, &[RoleVerb::TaskDone], session_token) {
            Some((_, status)) if status.is_valid() => {
                self.timeline.agent_complete(&task.id, "implementation", "task-done", result.duration_ms);
                (true, result.output, None)
            }
            _ => {
                let feedback = feedback_for_bad_signal("implementation", "task-done", session_token);
                (false, result.output, Some(feedback))
            }
        }
    }

    async fn run_test_writing(&self, task: &Task, session_token: &str) -> (bool, String, Option<String>) {
        let before_snapshot = self.guardrail.snapshot_state().await;

        let context = TaskContext {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            notes: task.notes.clone(),
            previous_feedback: None,
        };
        let prompt = build_test_writing_prompt(&context, session_token, &self.config.test_paths, &self.prd.description);

        let result = self.invoke(&prompt, "test_writing", AgentRole::TestWriting, &task.id).await;

        // Always check and revert, whether or not the agent itself succeeded.
        let guardrail_result = self.guardrail.check_and_revert(&before_snapshot, Some(&task.id)).await;
        if !guardrail_result.passed {
            tracing::warn!(
                task_id = %task.id,
                reverted = guardrail_result.reverted_files.len(),
                "guardrail reverted disallowed file changes"
            );
        }

        if !result.success {
            let error = result.error.unwrap_or_else(|| "unknown error".to_string());
            return (false, result.output, Some(format!("The Claude CLI invocation failed: {error}")));
        }

        match find_first_valid(&result.output, &[RoleVerb::TestsDone], session_token) {
            Some((_, status)) if status.is_valid() => {
                self.timeline.agent_complete(&task.id, "test_writing", "tests-done", result.duration_ms);
                (true, result.output, None)
            }
            _ => {
                let feedback = feedback_for_bad_signal("test_writing", "tests-done", session_token);
                (false, result.output, Some(feedback))
            }
        }
    }

    async fn run_gates_phase(&self, task_id: &str) -> (bool, Option<String>) {
        if self.options.gate_type == "none" {
            return (true, None);
        }
        let result = self.gates.run_gates(&self.options.gate_type, Some(task_id), true).await;
        if result.passed {
            return (true, None);
        }
        let fatal = result.fatal_failure.as_ref().expect("failed gate run reports a fatal failure");
        (false, Some(feedback_for_gate_failure(&format_gate_failure(fatal))))
    }

    async fn run_review(&self, task: &Task, session_token: &str) -> (bool, bool, String, Option<String>) {
        let context = TaskContext {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            notes: task.notes.clone(),
            previous_feedback: None,
        };
        let prompt = build_review_prompt(&context, session_token, &self.prd.description);

        let result = self.invoke(&prompt, "review", AgentRole::Review, &task.id).await;
        if !result.success {
            let error = result.error.unwrap_or_else(|| "unknown error".to_string());
            return (false, false, result.output, Some(format!("The Claude CLI invocation failed: {error}")));
        }

        match find_first_valid(&result.output, &[RoleVerb::ReviewApproved, RoleVerb::ReviewRejected], session_token) {
            Some((RoleVerb::ReviewApproved, status)) if status.is_valid() => {
                self.timeline.agent_complete(&task.id, "review", "review-approved", result.duration_ms);
                (true, true, result.output, None)
            }
            Some((RoleVerb::ReviewRejected, status)) if status.is_valid() => {
                let body = status.signal().map(|s| s.body.clone()).unwrap_or_default();
                self.timeline.agent_complete(&task.id, "review", "review-rejected", result.duration_ms);
                (true, false, result.output, Some(body))
            }
            _ => {
                let feedback = feedback_for_bad_signal("review", "review-approved", session_token);
                (false, false, result.output, Some(feedback))
            }
        }
    }

    async fn run_task(&mut self, task: &Task) -> TaskRunResult {
        let start = Instant::now();
        let session_token = self
            .session
            .session_token()
            .expect("session initialized before run_task")
            .to_string();

        let _ = self.session.start_task(&task.id);
        self.timeline.task_start(&task.id, &task.title);

        let max_iterations = self.max_iterations();
        let mut iteration = 0u32;
        let mut feedback: Option<String> = None;
        let mut review_feedback: Option<String> = None;

        while iteration < max_iterations {
            iteration += 1;
            let _ = self.session.increment_iterations(&task.id);

            let combined_feedback = feedback.as_deref().or(review_feedback.as_deref());
            let (impl_ok, _impl_output, impl_feedback) =
                self.run_implementation(task, &session_token, combined_feedback).await;
            if !impl_ok {
                feedback = impl_feedback;
                continue;
            }

            if task.requires_tests {
                let (test_ok, _test_output, test_feedback) = self.run_test_writing(task, &session_token).await;
                if !test_ok {
                    feedback = test_feedback;
                    continue;
                }
            }

            let (gates_ok, gate_feedback) = self.run_gates_phase(&task.id).await;
            if !gates_ok {
                feedback = gate_feedback;
                continue;
            }

            let (review_valid, is_approved, _review_output, rejection_feedback) =
                self.run_review(task, &session_token).await;
            if !review_valid {
                feedback = rejection_feedback;
                continue;
            }

            if !is_approved {
                review_feedback = rejection_feedback.map(feedback_for_review_rejection);
                feedback = None;
                continue;
            }

            let duration_ms = start.elapsed().as_millis() as u64;
            let _ = mark_task_complete(self.prd, &task.id, None);
            let _ = save_prd(self.prd, self.prd_path);
            let _ = self.session.complete_task(&task.id);
            self.timeline.task_complete(&task.id, iteration, duration_ms);

            return TaskRunResult {
                task_id: task.id.clone(),
                completed: true,
                iterations: iteration,
                duration_ms,
                failure_reason: None,
            };
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let failure_reason = format!("Max iterations ({max_iterations}) reached");
        let _ = self.session.fail_task(&task.id, &failure_reason);
        self.timeline.task_failed(&task.id, &failure_reason, iteration);

        TaskRunResult {
            task_id: task.id.clone(),
            completed: false,
            iterations: iteration,
            duration_ms,
            failure_reason: Some(failure_reason),
        }
    }

    pub async fn run(&mut self) -> RunResult {
        let start = Instant::now();

        let pending_tasks = match get_pending_tasks(self.prd, self.options.task_id.as_deref(), self.options.from_task_id.as_deref()) {
            Ok(tasks) => tasks,
            Err(e) => {
                return RunResult {
                    error: Some(e.to_string()),
                    ..RunResult::with_exit_code(ExitCode::TaskSourceError)
                };
            }
        };

        let session_id = self.session.session_id().map(str::to_string);

        if pending_tasks.is_empty() {
            // Diverges from leaving the ledger untouched: an invocation with
            // nothing to do still gets a complete session_start/session_end
            // pair in the timeline, so a reader of the audit trail never sees
            // a session that silently never started.
            self.timeline.session_start(0, self.config.path.as_ref().and_then(|p| p.to_str()));
            self.timeline.session_end("completed", 0, 0, Some(0));
            return RunResult {
                session_id,
                ..RunResult::with_exit_code(ExitCode::Success)
            };
        }

        self.timeline
            .session_start(pending_tasks.len(), self.config.path.as_ref().and_then(|p| p.to_str()));

        if self.options.dry_run {
            return RunResult {
                tasks_pending: pending_tasks.len(),
                session_id,
                ..RunResult::with_exit_code(ExitCode::Success)
            };
        }

        let mut task_results = Vec::new();
        let mut tasks_completed = 0usize;
        let mut tasks_failed = 0usize;

        let shutdown = crate::service::wait_for_shutdown_signal();
        tokio::pin!(shutdown);

        let mut aborted_signum = None;
        for task in &pending_tasks {
            tokio::select! {
                biased;
                signum = &mut shutdown => {
                    aborted_signum = Some(signum);
                    break;
                }
                result = self.run_task(task) => {
                    let completed = result.completed;
                    task_results.push(result);
                    if completed {
                        tasks_completed += 1;
                    } else {
                        tasks_failed += 1;
                        break;
                    }
                }
            }
        }

        if let Some(signum) = aborted_signum {
            let _ = self.session.end_session("aborted", None);
            return RunResult {
                tasks_completed,
                task_results,
                session_id,
                aborted_signum: Some(signum),
                ..RunResult::with_exit_code(ExitCode::UserAbort)
            };
        }

        if let Err(e) = self.session.verify_checksum() {
            let _ = self.session.end_session("failed", Some(&e.to_string()));
            return RunResult {
                tasks_completed,
                tasks_failed: tasks_failed + 1,
                task_results,
                error: Some(e.to_string()),
                session_id,
                ..RunResult::with_exit_code(ExitCode::ChecksumTampering)
            };
        }

        let tasks_pending = pending_tasks.len() - tasks_completed - tasks_failed;

        let mut post_verify_failed = false;
        let mut post_verify_aborted_signum = None;
        if self.options.post_verify && tasks_failed == 0 && tasks_completed > 0 {
            let verify_options = VerifyOptions {
                gate_type: self.options.gate_type.clone(),
                env: "dev".to_string(),
                fix: true,
                fix_iterations: self.config.limits.fix_iterations,
                ..VerifyOptions::default()
            };
            let post_verify_result = run_post_verify(self.config, self.session, self.timeline, verify_options).await;
            if post_verify_result.aborted_signum.is_some() {
                post_verify_aborted_signum = post_verify_result.aborted_signum;
            } else if !post_verify_result.all_passed() {
                post_verify_failed = true;
                tasks_failed = 1;
            }
        }

        if let Some(signum) = post_verify_aborted_signum {
            let _ = self.session.end_session("aborted", None);
            return RunResult {
                tasks_completed,
                tasks_pending,
                task_results,
                session_id,
                aborted_signum: Some(signum),
                ..RunResult::with_exit_code(ExitCode::UserAbort)
            };
        }

        let total_duration_ms = start.elapsed().as_millis() as u64;
        let final_status = if tasks_failed == 0 { "completed" } else { "failed" };
        let _ = self.session.end_session(final_status, None);
        self.timeline
            .session_end(final_status, tasks_completed, pending_tasks.len(), Some(total_duration_ms));

        let exit_code = if tasks_failed > 0 && !post_verify_failed {
            ExitCode::TaskExecutionFailed
        } else if post_verify_failed {
            ExitCode::PostVerificationFailed
        } else {
            ExitCode::Success
        };

        RunResult {
            exit_code: exit_code.as_i32(),
            tasks_completed,
            tasks_failed,
            tasks_pending,
            total_duration_ms,
            task_results,
            error: None,
            session_id,
            aborted_signum: None,
        }
    }
}

/// Loads config and the task list, resolves or creates the session, wires
/// up every component, and runs the loop to completion. The single entry
/// point the CLI's `run` subcommand calls into.
pub async fn run_tasks(ctx: &RunContext, options: RunOptions) -> RunResult {
    let prd_path = options
        .prd_json
        .clone()
        .unwrap_or_else(|| ctx.config.task_source.clone());

    let mut prd: PrdData = match load_prd(&prd_path) {
        Ok(prd) => prd,
        Err(e) => {
            return RunResult {
                error: Some(e.to_string()),
                ..RunResult::with_exit_code(ExitCode::TaskSourceError)
            };
        }
    };

    let pending_ids: Vec<String> = match get_pending_tasks(&prd, None, None) {
        Ok(tasks) => tasks.into_iter().map(|t| t.id).collect(),
        Err(e) => {
            return RunResult {
                error: Some(e.to_string()),
                ..RunResult::with_exit_code(ExitCode::TaskSourceError)
            };
        }
    };

    let session_dir = ctx.session_dir();
    let config_path_str = ctx.config.path.as_ref().and_then(|p| p.to_str()).map(str::to_string);

    let mut session = if options.resume && session_dir.join("session.json").exists() {
        match load_session(Some(session_dir.clone()), ctx.repo_root.clone(), true) {
            Ok(session) => session,
            Err(e) => {
                return RunResult {
                    error: Some(e.to_string()),
                    ..RunResult::with_exit_code(ExitCode::ChecksumTampering)
                };
            }
        }
    } else {
        match create_session(
            &prd_path.to_string_lossy(),
            "prd_json",
            config_path_str.as_deref(),
            &pending_ids,
            Some(session_dir),
            ctx.repo_root.clone(),
        ) {
            Ok(session) => session,
            Err(e) => {
                return RunResult {
                    error: Some(e.to_string()),
                    ..RunResult::with_exit_code(ExitCode::TaskSourceError)
                };
            }
        }
    };

    let timeline = TimelineLogger::new(session.timeline_path(), session.session_id().map(str::to_string));
    let claude_cmd = ctx.claude_cmd_override.clone();
    let claude = ClaudeRunner::new(
        claude_cmd,
        Duration::from_secs(ctx.config.limits.agent_timeout),
        Some(session.logs_dir()),
        ctx.repo_root.clone(),
    );
    let gates = GateRunner::new(&ctx.config, ctx.repo_root.clone(), Some(session.logs_dir()), Some(&timeline));
    let guardrail = FilePathGuardrail::new(ctx.config.test_paths.clone(), ctx.repo_root.clone(), Some(&timeline));

    let mut engine = RunEngine::new(
        &ctx.config,
        &mut prd,
        &prd_path,
        &mut session,
        &timeline,
        &claude,
        &gates,
        &guardrail,
        options,
        ctx.agents_md_content().to_string(),
    );

    engine.run().await
}

/// Loads config fresh from `config_path` and runs the task loop, for
/// callers that don't already hold a [`RunContext`].
pub async fn run_tasks_from_config_path(config_path: Option<&Path>, options: RunOptions) -> RunResult {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            return RunResult {
                error: Some(e.to_string()),
                ..RunResult::with_exit_code(ExitCode::ConfigError)
            };
        }
    };
    let ctx = RunContext::new(config);
    run_tasks(&ctx, options).await
}
