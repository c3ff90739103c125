//! Subprocess execution substrate shared by the gate runner, the service
//! lifecycle manager, and the agent runner.

pub mod claude;
pub mod exec;

pub use claude::{ClaudeResult, ClaudeRunner, InvokeOptions};
pub use exec::{run_command, CommandSpec, ExecError, ExecResult, RunCommandOptions};
