//! `ralph` — the binary front door onto the verified task loop engine.
//!
//! Argument parsing and subcommand dispatch are deliberately thin: this
//! binary validates flags, builds a [`RunContext`], and hands off to
//! `ralph_core::engine`/`ralph_core::verify`. Everything that matters —
//! the loop, the ledger, the guardrail, the gates — lives in
//! `ralph-core`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ralph_core::config::load_config;
use ralph_core::context::RunContext;
use ralph_core::engine::{run_tasks, RunOptions};
use ralph_core::verify::{format_verify_summary, run_verify, VerifyOptions};

#[derive(Parser)]
#[command(name = "ralph")]
#[command(about = "Verified task loop orchestrator for autonomous agent-driven development")]
struct Cli {
    /// Path to `ralph.yml`. Defaults to `./ralph.yml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the task list through the verified loop.
    Run {
        /// Path to the task list (`prd.json`). Defaults to `task_source` in `ralph.yml`.
        #[arg(long)]
        prd: Option<PathBuf>,

        /// Run only this task id, in isolation.
        #[arg(long)]
        task_id: Option<String>,

        /// Run every pending task from this task id onward.
        #[arg(long)]
        from_task_id: Option<String>,

        /// Override `limits.max_iterations`.
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Which gate list to run after the test-writing phase.
        #[arg(long, default_value = "full", value_parser = ["none", "build", "full"])]
        gate_type: String,

        /// Print what would run without invoking any agent or gate.
        #[arg(long)]
        dry_run: bool,

        /// Reuse an existing `.ralph-session/` in `running` state.
        #[arg(long)]
        resume: bool,

        /// Skip the post-completion verify driver handoff.
        #[arg(long)]
        no_post_verify: bool,
    },

    /// Run the post-completion verify driver standalone.
    Verify {
        /// Which gate list to run.
        #[arg(long, default_value = "full", value_parser = ["none", "build", "full"])]
        gate_type: String,

        /// Which service start commands to use.
        #[arg(long, default_value = "dev", value_parser = ["dev", "prod"])]
        env: String,

        /// Enter the bounded plan->implement->retest fix loop on UI test failure.
        #[arg(long)]
        fix: bool,

        /// Cap on fix sub-loop iterations. Defaults to `limits.fix_iterations`.
        #[arg(long)]
        fix_iterations: Option<u32>,

        /// Skip starting backend/frontend services (UI suites assumed already reachable).
        #[arg(long)]
        skip_services: bool,

        /// Base URL to use instead of the service manager's resolved URL.
        #[arg(long)]
        base_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(1);
        }
    };
    let ctx = RunContext::new(config);

    match cli.command {
        Commands::Run {
            prd,
            task_id,
            from_task_id,
            max_iterations,
            gate_type,
            dry_run,
            resume,
            no_post_verify,
        } => {
            let options = RunOptions {
                prd_json: prd,
                task_id,
                from_task_id,
                max_iterations,
                gate_type,
                dry_run,
                resume,
                post_verify: !no_post_verify,
            };
            let result = run_tasks(&ctx, options).await;
            eprintln!(
                "tasks completed={} failed={} pending={} duration_ms={}",
                result.tasks_completed, result.tasks_failed, result.tasks_pending, result.total_duration_ms
            );
            if let Some(session_id) = &result.session_id {
                eprintln!("session: {session_id} (.ralph-session/)");
            }
            if let Some(error) = &result.error {
                eprintln!("error: {error}");
            }
            if let Some(signum) = result.aborted_signum {
                return exit_code_from(128 + signum);
            }
            exit_code_from(result.exit_code)
        }
        Commands::Verify {
            gate_type,
            env,
            fix,
            fix_iterations,
            skip_services,
            base_url,
        } => {
            let options = VerifyOptions {
                gate_type,
                run_ui: None,
                run_robot: None,
                env,
                fix,
                fix_iterations: fix_iterations.unwrap_or(ctx.config.limits.fix_iterations),
                skip_services,
                base_url,
            };
            let result = run_verify(&ctx, options).await;
            eprintln!("{}", format_verify_summary(&result));
            if let Some(error) = &result.error {
                eprintln!("error: {error}");
            }
            if let Some(signum) = result.aborted_signum {
                return exit_code_from(128 + signum);
            }
            exit_code_from(result.exit_code_value)
        }
    }
}

fn exit_code_from(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(255))
}
