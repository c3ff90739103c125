//! Shared wire types for Ralph Orchestrator.
//!
//! Types here carry no I/O of their own; they are the vocabulary shared
//! between `ralph-core`, `ralph-adapters`, and `ralph-cli`.

mod event_type;
mod exit_code;
mod role_verb;

pub use event_type::EventType;
pub use exit_code::ExitCode;
pub use role_verb::RoleVerb;
