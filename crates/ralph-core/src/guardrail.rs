//! File-path guardrail for the test-writing phase: enumerates what Git
//! sees changed, classifies each change against `test_paths`, and
//! reverts anything the test-writing agent was not allowed to touch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::timeline::{TimelineFields, TimelineLogger};
use ralph_adapters::exec::{run_command, CommandSpec, RunCommandOptions};
use ralph_proto::EventType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub change_type: char,
}

impl FileChange {
    pub fn is_new(&self) -> bool {
        matches!(self.change_type, 'A' | '?')
    }
}

#[derive(Debug, Clone, Default)]
pub struct GuardrailResult {
    pub passed: bool,
    pub allowed_changes: Vec<FileChange>,
    pub violations: Vec<FileChange>,
    pub reverted_files: Vec<String>,
}

pub struct FilePathGuardrail<'a> {
    test_paths: Vec<String>,
    repo_root: PathBuf,
    timeline: Option<&'a TimelineLogger>,
}

impl<'a> FilePathGuardrail<'a> {
    pub fn new(test_paths: Vec<String>, repo_root: PathBuf, timeline: Option<&'a TimelineLogger>) -> Self {
        let test_paths = test_paths
            .into_iter()
            .map(|p| p.trim_start_matches("./").to_string())
            .collect();
        Self {
            test_paths,
            repo_root,
            timeline,
        }
    }

    fn is_internal_artifact(&self, file_path: &str) -> bool {
        let p = file_path.strip_prefix("./").unwrap_or(file_path);
        p.starts_with(".ralph-session/")
            || p == ".ralph-session"
            || p.starts_with(".ralph/")
            || p == ".ralph"
            || p.starts_with(".git/")
            || p == ".git"
    }

    /// A `.md` file lying inside the base directory of any `test_paths`
    /// pattern is always a violation, regardless of whether the pattern
    /// would otherwise match it.
    fn is_markdown_in_test_dir(&self, file_path: &str) -> bool {
        let file_path = file_path.strip_prefix("./").unwrap_or(file_path);
        if !file_path.to_lowercase().ends_with(".md") {
            return false;
        }
        for pattern in &self.test_paths {
            let base_dir = if let Some((base, _)) = pattern.split_once("**") {
                base.trim_end_matches('/')
            } else if pattern.contains('/') {
                pattern.split('/').next().unwrap_or("")
            } else {
                continue;
            };
            if !base_dir.is_empty() && file_path.starts_with(&format!("{base_dir}/")) {
                return true;
            }
        }
        false
    }

    pub fn is_allowed(&self, file_path: &str) -> bool {
        let file_path = file_path.strip_prefix("./").unwrap_or(file_path);
        for pattern in &self.test_paths {
            if let Some((base, suffix)) = pattern.split_once("**") {
                let base_trimmed = base.trim_end_matches('/');
                if file_path.starts_with(base_trimmed) {
                    if suffix.is_empty() {
                        return true;
                    }
                    let remainder = file_path[base_trimmed.len()..].trim_start_matches('/');
                    let suffix_pattern = suffix.trim_start_matches('/');
                    if fnmatch(remainder, suffix_pattern)
                        || fnmatch(file_path, &format!("{base}*{suffix}"))
                    {
                        return true;
                    }
                }
            }

            if fnmatch(file_path, pattern) {
                return true;
            }

            if let Some(dir_prefix) = pattern.strip_suffix("/**") {
                if file_path.starts_with(&format!("{dir_prefix}/")) || file_path.starts_with(dir_prefix)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Walks `repo_root` top to bottom, skipping internal artifact
    /// directories, and reports every file found as an untracked change.
    /// Used only when git itself is unavailable: diffing two of these
    /// walks (a before-snapshot and an after-snapshot) still finds
    /// whatever files newly appeared, and since every entry here carries
    /// `change_type: '?'`, `revert_file` reverts them by deletion only —
    /// never attempting a `git checkout` against a repo that just failed.
    fn walk_repo_files(&self) -> Vec<FileChange> {
        let mut out = Vec::new();
        let mut stack = vec![self.repo_root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(relative) = path.strip_prefix(&self.repo_root) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                if self.is_internal_artifact(&relative) {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push(FileChange {
                        path: relative,
                        change_type: '?',
                    });
                }
            }
        }
        out
    }

    /// Runs the three git plumbing calls, tolerating each independently.
    /// When all three fail — git itself is unavailable, not merely one
    /// plumbing call erroring on an otherwise-working repo — falls back
    /// to [`Self::walk_repo_files`] so every new write outside
    /// `test_paths` is still caught and reverted by deletion only.
    pub async fn get_file_changes(&self) -> (Vec<FileChange>, Vec<FileChange>) {
        let mut staged = Vec::new();
        let mut unstaged = Vec::new();
        let mut staged_failed = false;
        let mut unstaged_failed = false;
        let mut untracked_failed = false;

        let staged_result = run_command(
            CommandSpec::Argv(vec![
                "git".into(),
                "diff".into(),
                "--name-status".into(),
                "--cached".into(),
            ]),
            RunCommandOptions {
                cwd: Some(self.repo_root.clone()),
                timeout: Duration::from_secs(30),
                ..Default::default()
            },
        )
        .await;
        if staged_result.success() {
            staged.extend(parse_name_status(&staged_result.stdout));
        } else {
            staged_failed = true;
        }

        let unstaged_result = run_command(
            CommandSpec::Argv(vec!["git".into(), "diff".into(), "--name-status".into()]),
            RunCommandOptions {
                cwd: Some(self.repo_root.clone()),
                timeout: Duration::from_secs(30),
                ..Default::default()
            },
        )
        .await;
        if unstaged_result.success() {
            unstaged.extend(parse_name_status(&unstaged_result.stdout));
        } else {
            unstaged_failed = true;
        }

        let untracked_result = run_command(
            CommandSpec::Argv(vec![
                "git".into(),
                "ls-files".into(),
                "--others".into(),
                "--exclude-standard".into(),
            ]),
            RunCommandOptions {
                cwd: Some(self.repo_root.clone()),
                timeout: Duration::from_secs(30),
                ..Default::default()
            },
        )
        .await;
        if untracked_result.success() {
            for line in untracked_result.stdout.lines() {
                if !line.is_empty() {
                    unstaged.push(FileChange {
                        path: line.to_string(),
                        change_type: '?',
                    });
                }
            }
        } else {
            untracked_failed = true;
        }

        if staged_failed && unstaged_failed && untracked_failed {
            staged.clear();
            unstaged = self.walk_repo_files();
            if let Some(timeline) = self.timeline {
                timeline.log(
                    EventType::AgentFailed,
                    TimelineFields::default().role("guardrail").error(
                        "git unavailable: degrading to a full filesystem scan, \
                         reverting every new write outside test_paths by deletion only",
                    ),
                );
            }
        }

        (staged, unstaged)
    }

    pub async fn snapshot_state(&self) -> HashSet<String> {
        let (staged, unstaged) = self.get_file_changes().await;
        staged
            .into_iter()
            .chain(unstaged)
            .map(|c| c.path)
            .collect()
    }

    /// Classifies every change new since `before_snapshot`, reverts
    /// violations, and logs them. Never fails the calling phase by
    /// itself.
    pub async fn check_and_revert(
        &self,
        before_snapshot: &HashSet<String>,
        task_id: Option<&str>,
    ) -> GuardrailResult {
        let (staged, unstaged) = self.get_file_changes().await;
        let all_changes: Vec<FileChange> = staged.into_iter().chain(unstaged).collect();
        let new_changes: Vec<FileChange> = all_changes
            .into_iter()
            .filter(|c| !before_snapshot.contains(&c.path))
            .collect();

        let mut allowed_changes = Vec::new();
        let mut violations = Vec::new();

        for change in new_changes {
            if self.is_internal_artifact(&change.path) {
                allowed_changes.push(change);
            } else if self.is_markdown_in_test_dir(&change.path) {
                violations.push(change);
            } else if self.is_allowed(&change.path) {
                allowed_changes.push(change);
            } else {
                violations.push(change);
            }
        }

        let mut reverted_files = Vec::new();
        for violation in &violations {
            if self.revert_file(violation).await {
                reverted_files.push(violation.path.clone());
            }
        }

        if !violations.is_empty() {
            if let Some(timeline) = self.timeline {
                timeline.log(
                    EventType::AgentFailed,
                    TimelineFields::default()
                        .task_id(task_id.unwrap_or_default())
                        .role("guardrail")
                        .error(&format!(
                            "guardrail violation: {} unauthorized file changes",
                            violations.len()
                        ))
                        .details(serde_json::json!({
                            "violations": violations.iter().map(|v| v.path.clone()).collect::<Vec<_>>(),
                            "reverted": reverted_files,
                        })),
                );
            }
        }

        GuardrailResult {
            passed: violations.is_empty(),
            allowed_changes,
            violations,
            reverted_files,
        }
    }

    async fn revert_file(&self, change: &FileChange) -> bool {
        let file_path = self.repo_root.join(&change.path);
        if change.is_new() {
            if file_path.exists() {
                return std::fs::remove_file(&file_path).is_ok();
            }
            return true;
        }

        let result = run_command(
            CommandSpec::Argv(vec![
                "git".into(),
                "checkout".into(),
                "--".into(),
                change.path.clone(),
            ]),
            RunCommandOptions {
                cwd: Some(self.repo_root.clone()),
                timeout: Duration::from_secs(30),
                ..Default::default()
            },
        )
        .await;
        result.success()
    }
}

fn parse_name_status(output: &str) -> Vec<FileChange> {
    output
        .trim()
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, '\t');
            let status = parts.next()?;
            let path = parts.next()?;
            Some(FileChange {
                path: path.to_string(),
                change_type: status.chars().next().unwrap_or('M'),
            })
        })
        .collect()
}

/// A small glob matcher supporting `*` and `?`, enough for the shell-
/// style `test_paths` patterns this guardrail is configured with (no `[...]`
/// character classes are used anywhere in the corpus this was grounded on).
fn fnmatch(text: &str, pattern: &str) -> bool {
    fn matches(t: &[u8], p: &[u8]) -> bool {
        match (t.first(), p.first()) {
            (_, Some(b'*')) => matches(t, &p[1..]) || (!t.is_empty() && matches(&t[1..], p)),
            (Some(_), Some(b'?')) => matches(&t[1..], &p[1..]),
            (Some(tc), Some(pc)) if tc == pc => matches(&t[1..], &p[1..]),
            (None, None) => true,
            _ => false,
        }
    }
    matches(text.as_bytes(), pattern.as_bytes())
}

pub fn create_guardrail<'a>(
    test_paths: &[String],
    repo_root: &Path,
    timeline: Option<&'a TimelineLogger>,
) -> FilePathGuardrail<'a> {
    FilePathGuardrail::new(test_paths.to_vec(), repo_root.to_path_buf(), timeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail() -> FilePathGuardrail<'static> {
        FilePathGuardrail::new(
            vec!["tests/**".to_string(), "*.spec.ts".to_string()],
            PathBuf::from("."),
            None,
        )
    }

    #[test]
    fn internal_artifacts_are_never_violations() {
        let g = guardrail();
        assert!(g.is_internal_artifact(".ralph-session/logs/x.log"));
        assert!(g.is_internal_artifact(".git/HEAD"));
        assert!(g.is_internal_artifact(".ralph"));
        assert!(!g.is_internal_artifact("src/main.rs"));
    }

    #[test]
    fn markdown_in_test_dir_is_always_a_violation() {
        let g = guardrail();
        assert!(g.is_markdown_in_test_dir("tests/NOTES.md"));
        assert!(!g.is_markdown_in_test_dir("tests/test_x.py"));
        assert!(!g.is_markdown_in_test_dir("README.md"));
    }

    #[test]
    fn glob_star_star_matches_nested_paths() {
        let g = guardrail();
        assert!(g.is_allowed("tests/unit/test_x.py"));
        assert!(g.is_allowed("tests/test_x.py"));
        assert!(!g.is_allowed("src/main.py"));
    }

    #[test]
    fn standalone_glob_matches() {
        let g = guardrail();
        assert!(g.is_allowed("component.spec.ts"));
        assert!(!g.is_allowed("component.ts"));
    }

    #[tokio::test]
    async fn check_and_revert_deletes_disallowed_new_file_keeps_allowed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tests")).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("tests/test_x.py"), "ok").unwrap();
        std::fs::write(dir.path().join("src/main.py"), "bad").unwrap();
        std::fs::write(dir.path().join("tests/NOTES.md"), "bad md").unwrap();

        let g = FilePathGuardrail::new(
            vec!["tests/**".to_string()],
            dir.path().to_path_buf(),
            None,
        );
        // No git repo here, so get_file_changes degrades to a filesystem
        // walk (exercised separately below); construct FileChange values
        // by hand here to test classification and revert directly.
        let violations = vec![
            FileChange {
                path: "src/main.py".to_string(),
                change_type: '?',
            },
            FileChange {
                path: "tests/NOTES.md".to_string(),
                change_type: '?',
            },
        ];
        for v in &violations {
            assert!(g.revert_file(v).await);
        }
        assert!(!dir.path().join("src/main.py").exists());
        assert!(!dir.path().join("tests/NOTES.md").exists());
        assert!(dir.path().join("tests/test_x.py").exists());
    }

    #[tokio::test]
    async fn degraded_mode_without_git_repo_deletes_new_file_outside_test_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tests")).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("tests/test_x.py"), "ok").unwrap();

        let g = FilePathGuardrail::new(
            vec!["tests/**".to_string()],
            dir.path().to_path_buf(),
            None,
        );
        // Snapshot before the agent writes anything; no `.git` directory
        // exists here, so all three plumbing calls fail and this falls
        // back to a filesystem walk.
        let before = g.snapshot_state().await;

        std::fs::write(dir.path().join("src/new_file.py"), "unauthorized").unwrap();

        let result = g.check_and_revert(&before, None).await;
        assert!(!result.passed);
        assert_eq!(result.reverted_files, vec!["src/new_file.py".to_string()]);
        assert!(!dir.path().join("src/new_file.py").exists());
        assert!(dir.path().join("tests/test_x.py").exists());
    }
}
