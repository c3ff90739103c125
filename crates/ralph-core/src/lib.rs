//! Core orchestration: configuration, task source, session ledger,
//! guardrail, gate runner, service lifecycle, agent prompts, the
//! verified task loop engine, and the verify driver.

pub mod config;
pub mod context;
pub mod engine;
pub mod gates;
pub mod guardrail;
pub mod prompts;
pub mod service;
pub mod session;
pub mod signal;
pub mod tasks;
pub mod timeline;
pub mod verify;

pub use context::RunContext;
