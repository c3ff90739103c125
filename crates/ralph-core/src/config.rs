//! `ralph.yml` configuration: gates, agents, services, test paths, limits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Implementation,
    TestWriting,
    Review,
    Fix,
    Planning,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub timeout: Option<u64>,
}

fn default_fatal() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub cmd: String,
    pub timeout_seconds: u64,
    #[serde(default = "default_fatal")]
    pub fatal: bool,
    pub when: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatesConfig {
    #[serde(default)]
    pub build: Vec<GateSpec>,
    #[serde(default)]
    pub full: Vec<GateSpec>,
}

fn default_health_paths() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_health_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub port: u16,
    pub start_dev: Option<String>,
    pub start_prod: Option<String>,
    pub serve_dev: Option<String>,
    pub serve_prod: Option<String>,
    pub build: Option<String>,
    #[serde(default = "default_health_paths")]
    pub health: Vec<String>,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
}

fn default_agent_timeout() -> u64 {
    1800
}

fn default_fix_iterations() -> u32 {
    10
}

fn default_max_iterations() -> u32 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout: u64,
    #[serde(default = "default_fix_iterations")]
    pub fix_iterations: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            agent_timeout: default_agent_timeout(),
            fix_iterations: default_fix_iterations(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiSuiteConfig {
    #[serde(default)]
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiConfig {
    pub agent_browser: Option<UiSuiteConfig>,
    pub robot: Option<UiSuiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphConfig {
    pub task_source: PathBuf,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default)]
    pub agents: HashMap<AgentRole, AgentConfig>,
    pub backend: Option<ServiceConfig>,
    pub frontend: Option<ServiceConfig>,
    #[serde(default)]
    pub test_paths: Vec<String>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub ui: Option<UiConfig>,

    /// Repo root the config was loaded relative to. Not part of the YAML
    /// shape; filled in by `load_config`.
    #[serde(skip)]
    pub repo_root: PathBuf,
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl RalphConfig {
    pub fn get_agent_config(&self, role: AgentRole) -> AgentConfig {
        self.agents.get(&role).cloned().unwrap_or_default()
    }

    pub fn agent_timeout_for(&self, role: AgentRole) -> std::time::Duration {
        let configured = self
            .agents
            .get(&role)
            .and_then(|c| c.timeout)
            .unwrap_or(self.limits.agent_timeout);
        std::time::Duration::from_secs(configured)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.task_source.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("task_source must not be empty".into()));
        }
        for gate in self.gates.build.iter().chain(self.gates.full.iter()) {
            if gate.cmd.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "gate '{}' has an empty cmd",
                    gate.name
                )));
            }
        }
        if self.limits.max_iterations < 1 {
            return Err(ConfigError::Invalid(
                "limits.max_iterations must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Loads and validates `ralph.yml`. `path` defaults to `ralph.yml` in the
/// current directory when `None`.
pub fn load_config(path: Option<&Path>) -> Result<RalphConfig, ConfigError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("ralph.yml"));
    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }
    let contents =
        std::fs::read_to_string(&path).map_err(|e| ConfigError::Read(path.clone(), e))?;
    let mut config: RalphConfig = serde_yaml::from_str(&contents)?;

    let repo_root = path
        .parent()
        .map(Path::to_path_buf)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));

    if config.task_source.is_relative() {
        config.task_source = repo_root.join(&config.task_source);
    }
    config.repo_root = repo_root;
    config.path = Some(path);

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("ralph.yml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
task_source: prd.json
gates:
  build: []
  full: []
test_paths:
  - "tests/**"
"#,
        );
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.limits.max_iterations, 200);
        assert_eq!(config.test_paths, vec!["tests/**".to_string()]);
    }

    #[test]
    fn rejects_empty_gate_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
task_source: prd.json
gates:
  build:
    - name: lint
      cmd: ""
      timeout_seconds: 10
  full: []
"#,
        );
        assert!(matches!(
            load_config(Some(&path)),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let result = load_config(Some(Path::new("/nonexistent/ralph.yml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn gate_fatal_defaults_true() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
task_source: prd.json
gates:
  build:
    - name: lint
      cmd: "echo ok"
      timeout_seconds: 10
  full: []
"#,
        );
        let config = load_config(Some(&path)).unwrap();
        assert!(config.gates.build[0].fatal);
    }
}
