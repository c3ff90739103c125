//! Immutable run context: the handful of values every component needs
//! (repo root, loaded config, environment overrides) built once at
//! startup instead of threaded through as loose globals.

use std::path::PathBuf;

use crate::config::RalphConfig;

/// Built once per `ralph run` / `ralph verify` invocation and passed by
/// reference to every component that needs it. Nothing in here is
/// mutated after construction; per-task mutable state lives in
/// [`crate::session::Session`] instead.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub repo_root: PathBuf,
    pub config: RalphConfig,
    pub claude_cmd_override: Option<String>,
    pub session_dir_override: Option<PathBuf>,
    pub agents_md: Option<String>,
}

impl RunContext {
    pub fn new(config: RalphConfig) -> Self {
        let repo_root = config.repo_root.clone();
        let claude_cmd_override = std::env::var("RALPH_CLAUDE_CMD").ok();
        let session_dir_override = std::env::var("RALPH_SESSION_DIR").ok().map(PathBuf::from);
        let agents_md = std::fs::read_to_string(repo_root.join("AGENTS.md")).ok();
        Self {
            repo_root,
            config,
            claude_cmd_override,
            session_dir_override,
            agents_md,
        }
    }

    pub fn session_dir(&self) -> PathBuf {
        self.session_dir_override
            .clone()
            .unwrap_or_else(|| self.repo_root.join(".ralph-session"))
    }

    pub fn agents_md_content(&self) -> &str {
        self.agents_md.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatesConfig, Limits};
    use std::collections::HashMap;

    fn config(repo_root: PathBuf) -> RalphConfig {
        RalphConfig {
            task_source: repo_root.join("prd.json"),
            gates: GatesConfig::default(),
            agents: HashMap::new(),
            backend: None,
            frontend: None,
            test_paths: vec![],
            limits: Limits::default(),
            ui: None,
            repo_root,
            path: None,
        }
    }

    #[test]
    fn session_dir_defaults_under_repo_root() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var("RALPH_SESSION_DIR");
        let ctx = RunContext::new(config(dir.path().to_path_buf()));
        assert_eq!(ctx.session_dir(), dir.path().join(".ralph-session"));
    }

    #[test]
    fn session_dir_override_env_wins() {
        let dir = tempfile::tempdir().unwrap();
        let override_dir = dir.path().join("custom-session");
        std::env::set_var("RALPH_SESSION_DIR", &override_dir);
        let ctx = RunContext::new(config(dir.path().to_path_buf()));
        assert_eq!(ctx.session_dir(), override_dir);
        std::env::remove_var("RALPH_SESSION_DIR");
    }

    #[test]
    fn missing_agents_md_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var("RALPH_SESSION_DIR");
        let ctx = RunContext::new(config(dir.path().to_path_buf()));
        assert_eq!(ctx.agents_md_content(), "");
    }
}
