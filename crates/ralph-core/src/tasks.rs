//! The task list (`prd.json`): loading, querying, and atomically
//! persisting task completion.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskSourceError {
    #[error("task list not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read task list {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse task list: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("task id {0} not found among pending tasks")]
    TaskIdNotPending(String),
    #[error("task id {0} not found")]
    TaskIdNotFound(String),
    #[error("failed to write task list {0}: {1}")]
    Write(PathBuf, std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    #[serde(rename = "acceptanceCriteria", default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "acceptanceCriteria", default)]
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(rename = "requiresTests", default = "default_true")]
    pub requires_tests: bool,
    #[serde(rename = "affectsFrontend", default)]
    pub affects_frontend: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<Subtask>,
}

fn default_true() -> bool {
    true
}

impl Task {
    pub fn is_complete(&self) -> bool {
        self.passes
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrdMetadata {
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "sourceFile", skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdData {
    pub project: String,
    pub description: String,
    pub tasks: Vec<Task>,
    #[serde(rename = "branchName", skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default = "default_version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "is_default_metadata")]
    pub metadata: PrdMetadata,

    #[serde(skip)]
    path: Option<PathBuf>,
}

fn default_version() -> Option<String> {
    Some("1".to_string())
}

fn is_default_metadata(m: &PrdMetadata) -> bool {
    m.created_at.is_none()
        && m.updated_at.is_none()
        && m.source.is_none()
        && m.source_file.is_none()
        && m.author.is_none()
}

impl PrdData {
    pub fn get_task_by_id(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn get_task_by_id_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn get_completed_tasks(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.passes).collect()
    }

    /// Pending tasks sorted by `(priority asc, id asc)` — the task list's
    /// total order.
    fn sorted_pending(&self) -> Vec<&Task> {
        let mut pending: Vec<&Task> = self.tasks.iter().filter(|t| !t.passes).collect();
        pending.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        pending
    }
}

/// Resolves the set of tasks a run should execute, honoring `--task-id`
/// (runs just that task, in isolation, regardless of other pending
/// tasks' state — matching the one available reference implementation)
/// and `--from-task-id` (starts the priority-ordered pending slice at
/// that task).
pub fn get_pending_tasks(
    prd: &PrdData,
    task_id: Option<&str>,
    from_task_id: Option<&str>,
) -> Result<Vec<Task>, TaskSourceError> {
    if let Some(task_id) = task_id {
        return match prd.get_task_by_id(task_id) {
            Some(task) if !task.passes => Ok(vec![task.clone()]),
            Some(_) => Ok(Vec::new()),
            None => Err(TaskSourceError::TaskIdNotFound(task_id.to_string())),
        };
    }

    let pending = prd.sorted_pending();

    if let Some(from_task_id) = from_task_id {
        let start = pending
            .iter()
            .position(|t| t.id == from_task_id)
            .ok_or_else(|| TaskSourceError::TaskIdNotPending(from_task_id.to_string()))?;
        return Ok(pending[start..].iter().map(|t| (**t).clone()).collect());
    }

    Ok(pending.into_iter().cloned().collect())
}

pub fn load_prd(path: &Path) -> Result<PrdData, TaskSourceError> {
    if !path.exists() {
        return Err(TaskSourceError::NotFound(path.to_path_buf()));
    }
    let contents =
        std::fs::read_to_string(path).map_err(|e| TaskSourceError::Read(path.to_path_buf(), e))?;
    let mut prd: PrdData = serde_json::from_str(&contents)?;
    prd.path = Some(path.to_path_buf());
    Ok(prd)
}

/// Writes `prd.json` atomically: render to a temp file in the same
/// directory, then rename over the target. The source writes in place;
/// this is the Design-Notes-mandated improvement.
pub fn save_prd(prd: &mut PrdData, path: &Path) -> Result<(), TaskSourceError> {
    prd.metadata.updated_at = Some(crate::session::utc_now_iso());
    let json = serde_json::to_string_pretty(prd)? + "\n";

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| TaskSourceError::Write(path.to_path_buf(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| TaskSourceError::Write(path.to_path_buf(), e))?;
    Ok(())
}

pub fn mark_task_complete(
    prd: &mut PrdData,
    task_id: &str,
    notes: Option<&str>,
) -> Result<(), TaskSourceError> {
    let task = prd
        .get_task_by_id_mut(task_id)
        .ok_or_else(|| TaskSourceError::TaskIdNotFound(task_id.to_string()))?;
    task.passes = true;
    if let Some(notes) = notes {
        task.notes = notes.to_string();
    }
    Ok(())
}

pub fn update_task_notes(
    prd: &mut PrdData,
    task_id: &str,
    notes: &str,
) -> Result<(), TaskSourceError> {
    let task = prd
        .get_task_by_id_mut(task_id)
        .ok_or_else(|| TaskSourceError::TaskIdNotFound(task_id.to_string()))?;
    task.notes = notes.to_string();
    Ok(())
}

pub fn validate_task_id(task_id: &str) -> bool {
    let re = Regex::new(r"^T-[0-9]{3,}$").unwrap();
    re.is_match(task_id)
}

pub fn generate_next_task_id(prd: &PrdData) -> String {
    let max = prd
        .tasks
        .iter()
        .filter_map(|t| t.id.strip_prefix("T-"))
        .filter_map(|n| n.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("T-{:03}", max + 1)
}

/// Builds a new task, defaulting `task_id` via [`generate_next_task_id`]
/// and `priority` to the current max + 1, and appends it to `prd.tasks`.
/// Persisting the result is the caller's responsibility via [`save_prd`].
#[allow(clippy::too_many_arguments)]
pub fn create_task(
    prd: &mut PrdData,
    title: &str,
    description: &str,
    acceptance_criteria: Vec<String>,
    priority: Option<i64>,
    task_id: Option<String>,
    requires_tests: bool,
    affects_frontend: bool,
) -> Task {
    let task_id = task_id.unwrap_or_else(|| generate_next_task_id(prd));
    let priority = priority.unwrap_or_else(|| prd.tasks.iter().map(|t| t.priority).max().unwrap_or(0) + 1);

    let task = Task {
        id: task_id,
        title: title.to_string(),
        description: description.to_string(),
        acceptance_criteria,
        priority,
        passes: false,
        notes: String::new(),
        requires_tests,
        affects_frontend,
        subtasks: Vec::new(),
    };

    prd.tasks.push(task.clone());
    task
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prd() -> PrdData {
        PrdData {
            project: "demo".to_string(),
            description: "demo project".to_string(),
            tasks: vec![
                Task {
                    id: "T-002".to_string(),
                    title: "second".to_string(),
                    description: String::new(),
                    acceptance_criteria: vec![],
                    priority: 2,
                    passes: false,
                    notes: String::new(),
                    requires_tests: true,
                    affects_frontend: false,
                    subtasks: vec![],
                },
                Task {
                    id: "T-001".to_string(),
                    title: "first".to_string(),
                    description: String::new(),
                    acceptance_criteria: vec![],
                    priority: 1,
                    passes: false,
                    notes: String::new(),
                    requires_tests: true,
                    affects_frontend: false,
                    subtasks: vec![],
                },
            ],
            branch_name: None,
            version: Some("1".to_string()),
            metadata: PrdMetadata::default(),
            path: None,
        }
    }

    #[test]
    fn pending_tasks_sorted_by_priority_then_id() {
        let prd = sample_prd();
        let pending = get_pending_tasks(&prd, None, None).unwrap();
        assert_eq!(pending[0].id, "T-001");
        assert_eq!(pending[1].id, "T-002");
    }

    #[test]
    fn task_id_runs_in_isolation_regardless_of_earlier_incomplete_tasks() {
        let prd = sample_prd();
        // T-002 has lower priority ordering than T-001 but both are
        // pending; requesting T-002 directly must return only T-002.
        let pending = get_pending_tasks(&prd, Some("T-002"), None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "T-002");
    }

    #[test]
    fn task_id_on_completed_task_returns_empty() {
        let mut prd = sample_prd();
        prd.tasks[0].passes = true;
        let pending = get_pending_tasks(&prd, Some("T-002"), None).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn from_task_id_slices_remaining_pending() {
        let prd = sample_prd();
        let pending = get_pending_tasks(&prd, None, Some("T-002")).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "T-002");
    }

    #[test]
    fn from_task_id_missing_errors() {
        let prd = sample_prd();
        assert!(get_pending_tasks(&prd, None, Some("T-999")).is_err());
    }

    #[test]
    fn validate_task_id_matches_pattern() {
        assert!(validate_task_id("T-001"));
        assert!(validate_task_id("T-1234"));
        assert!(!validate_task_id("T-1"));
        assert!(!validate_task_id("X-001"));
    }

    #[test]
    fn generate_next_task_id_increments_max() {
        let prd = sample_prd();
        assert_eq!(generate_next_task_id(&prd), "T-003");
    }

    #[test]
    fn mark_task_complete_sets_passes() {
        let mut prd = sample_prd();
        mark_task_complete(&mut prd, "T-001", Some("done")).unwrap();
        let task = prd.get_task_by_id("T-001").unwrap();
        assert!(task.passes);
        assert_eq!(task.notes, "done");
    }

    #[test]
    fn create_task_defaults_id_and_priority() {
        let mut prd = sample_prd();
        let task = create_task(
            &mut prd,
            "third",
            "a new task",
            vec!["does the thing".to_string()],
            None,
            None,
            true,
            false,
        );
        assert_eq!(task.id, "T-003");
        assert_eq!(task.priority, 3);
        assert!(!task.passes);
        assert_eq!(prd.tasks.len(), 3);
        assert_eq!(prd.get_task_by_id("T-003").unwrap().title, "third");
    }

    #[test]
    fn create_task_honors_explicit_id_and_priority() {
        let mut prd = sample_prd();
        let task = create_task(
            &mut prd,
            "explicit",
            "desc",
            vec![],
            Some(10),
            Some("T-050".to_string()),
            false,
            true,
        );
        assert_eq!(task.id, "T-050");
        assert_eq!(task.priority, 10);
        assert!(!task.requires_tests);
        assert!(task.affects_frontend);
    }

    #[test]
    fn save_prd_is_atomic_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        let mut prd = sample_prd();
        save_prd(&mut prd, &path).unwrap();
        assert!(path.exists());
        let reloaded = load_prd(&path).unwrap();
        assert_eq!(reloaded.tasks.len(), 2);
        assert!(reloaded.metadata.updated_at.is_some());
    }
}
