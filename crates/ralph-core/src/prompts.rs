//! Agent prompt construction. Each builder composes a prompt from named
//! section methods and closes it with the exact tag the corresponding
//! phase requires back.

use crate::config::AgentRole;

/// The task-shaped context every phase's prompt is built from.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub notes: String,
    pub previous_feedback: Option<String>,
}

fn criteria_section(criteria: &[String]) -> String {
    if criteria.is_empty() {
        return String::new();
    }
    let items: String = criteria.iter().map(|c| format!("- {c}\n")).collect();
    format!("\nAcceptance criteria:\n{items}")
}

fn feedback_section(feedback: Option<&str>) -> String {
    match feedback {
        Some(feedback) if !feedback.trim().is_empty() => {
            format!("\nFeedback from the previous attempt:\n{feedback}\n")
        }
        _ => String::new(),
    }
}

fn notes_section(notes: &str) -> String {
    if notes.trim().is_empty() {
        String::new()
    } else {
        format!("\nExisting notes:\n{notes}\n")
    }
}

fn agents_md_section(agents_md_content: &str) -> String {
    if agents_md_content.trim().is_empty() {
        String::new()
    } else {
        format!("\nProject conventions (AGENTS.md):\n{agents_md_content}\n")
    }
}

/// Builds the implementation phase's prompt: task details, project
/// context, `AGENTS.md` if present, and feedback from a prior rejected
/// iteration when this is iteration >= 2.
pub fn build_implementation_prompt(
    task: &TaskContext,
    session_token: &str,
    project_description: &str,
    agents_md_content: &str,
) -> String {
    format!(
        r#"You are the implementation agent for task {id}: {title}

Project: {project_description}

Task description:
{description}
{criteria}{notes}{agents_md}{feedback}
Implement this task completely. Do not write or modify tests — a
separate test-writing phase handles that.

When the implementation is complete, end your final message with exactly:
<task-done session="{session_token}">a one-line summary of what you did</task-done>
"#,
        id = task.task_id,
        title = task.title,
        description = task.description,
        criteria = criteria_section(&task.acceptance_criteria),
        notes = notes_section(&task.notes),
        agents_md = agents_md_section(agents_md_content),
        feedback = feedback_section(task.previous_feedback.as_deref()),
        session_token = session_token,
    )
}

/// Builds the test-writing phase's prompt: task details, the allowed
/// `test_paths` patterns spelled out verbatim so the agent knows exactly
/// where it may write.
pub fn build_test_writing_prompt(
    task: &TaskContext,
    session_token: &str,
    test_paths: &[String],
    project_description: &str,
) -> String {
    let allowed_paths: String = test_paths.iter().map(|p| format!("- {p}\n")).collect();
    format!(
        r#"You are the test-writing agent for task {id}: {title}

Project: {project_description}

Task description:
{description}
{criteria}
Write tests that verify this task's acceptance criteria. You may ONLY
create or modify files matching one of these path patterns:
{allowed_paths}
Any change outside these patterns will be automatically reverted. Do not
modify implementation source files.

When the tests are written, end your final message with exactly:
<tests-done session="{session_token}">a one-line summary of the tests you wrote</tests-done>
"#,
        id = task.task_id,
        title = task.title,
        description = task.description,
        criteria = criteria_section(&task.acceptance_criteria),
        allowed_paths = allowed_paths,
        session_token = session_token,
    )
}

/// Builds the review phase's prompt: task details and acceptance
/// criteria, asking for either `review-approved` or `review-rejected`
/// whose body becomes the next iteration's feedback.
pub fn build_review_prompt(task: &TaskContext, session_token: &str, project_description: &str) -> String {
    format!(
        r#"You are the review agent for task {id}: {title}

Project: {project_description}

Task description:
{description}
{criteria}
Review the current state of the implementation and tests against the
acceptance criteria above. Be strict: reject anything that does not
fully satisfy them.

If the task is complete and correct, end your final message with exactly:
<review-approved session="{session_token}">a one-line summary of why this passes</review-approved>

Otherwise, end your final message with exactly:
<review-rejected session="{session_token}">a specific, actionable description of what is missing or wrong</review-rejected>
"#,
        id = task.task_id,
        title = task.title,
        description = task.description,
        criteria = criteria_section(&task.acceptance_criteria),
        session_token = session_token,
    )
}

/// Builds the UI (or Robot) fix loop's planning-phase prompt: the
/// concatenated failure descriptions and the session token.
pub fn build_ui_planning_prompt(failure_descriptions: &[String], session_token: &str, framework: &str) -> String {
    let failures: String = failure_descriptions
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{}. {f}\n", i + 1))
        .collect();
    let plan_tag = if framework == "robot" { "robot-plan" } else { "ui-plan" };
    format!(
        r#"The following {framework} test failures were observed:

{failures}
Produce a concrete plan to fix these failures. Do not make any changes yet.

End your final message with exactly:
<{plan_tag} session="{session_token}">your plan</{plan_tag}>
"#
    )
}

/// Builds the UI (or Robot) fix loop's implementation-phase prompt: the
/// plan body from the planning phase and the session token.
pub fn build_ui_implementation_prompt(plan_body: &str, session_token: &str, framework: &str) -> String {
    let fix_tag = if framework == "robot" {
        "robot-fix-done"
    } else {
        "ui-fix-done"
    };
    format!(
        r#"Implement the following plan to fix the failing {framework} tests:

{plan_body}

When the fix is complete, end your final message with exactly:
<{fix_tag} session="{session_token}">a one-line summary of the fix</{fix_tag}>
"#
    )
}

pub fn feedback_for_bad_signal(phase: &str, expected_tag: &str, session_token: &str) -> String {
    format!(
        r#"Your previous response for the {phase} phase did not end with a
valid signal. You must end your final message with exactly:
<{expected_tag} session="{session_token}">...</{expected_tag}>

with no other attribute on the tag, and no nested `<{expected_tag}>` tag
inside the body."#
    )
}

pub fn feedback_for_gate_failure(formatted_gate_failure: &str) -> String {
    format!("The quality gates failed:\n{formatted_gate_failure}\n\nFix the failures above and try again.")
}

pub fn feedback_for_review_rejection(body: &str) -> String {
    format!("The reviewer rejected this attempt:\n{body}\n\nAddress the feedback above and try again.")
}

pub fn allowed_tools_for_role(role: AgentRole) -> Vec<String> {
    match role {
        AgentRole::Implementation => vec!["Read".into(), "Edit".into(), "Write".into(), "Bash".into()],
        AgentRole::TestWriting => vec!["Read".into(), "Edit".into(), "Write".into(), "Bash".into()],
        AgentRole::Review => vec!["Read".into(), "Bash".into()],
        AgentRole::Fix => vec!["Read".into(), "Edit".into(), "Write".into(), "Bash".into()],
        AgentRole::Planning => vec!["Read".into(), "Bash".into()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskContext {
        TaskContext {
            task_id: "T-001".to_string(),
            title: "Add login".to_string(),
            description: "Implement the login form".to_string(),
            acceptance_criteria: vec!["Shows an error on bad password".to_string()],
            notes: String::new(),
            previous_feedback: None,
        }
    }

    #[test]
    fn implementation_prompt_contains_task_and_required_tag() {
        let prompt = build_implementation_prompt(&task(), "ralph-tok", "demo project", "");
        assert!(prompt.contains("T-001"));
        assert!(prompt.contains("Add login"));
        assert!(prompt.contains(r#"<task-done session="ralph-tok">"#));
    }

    #[test]
    fn implementation_prompt_omits_feedback_section_on_first_iteration() {
        let prompt = build_implementation_prompt(&task(), "ralph-tok", "demo", "");
        assert!(!prompt.contains("Feedback from the previous attempt"));
    }

    #[test]
    fn implementation_prompt_includes_feedback_on_retry() {
        let mut t = task();
        t.previous_feedback = Some("missing error message".to_string());
        let prompt = build_implementation_prompt(&t, "ralph-tok", "demo", "");
        assert!(prompt.contains("missing error message"));
    }

    #[test]
    fn test_writing_prompt_lists_allowed_paths() {
        let prompt = build_test_writing_prompt(
            &task(),
            "ralph-tok",
            &["tests/**".to_string()],
            "demo",
        );
        assert!(prompt.contains("tests/**"));
        assert!(prompt.contains(r#"<tests-done session="ralph-tok">"#));
    }

    #[test]
    fn review_prompt_offers_both_outcomes() {
        let prompt = build_review_prompt(&task(), "ralph-tok", "demo");
        assert!(prompt.contains("review-approved"));
        assert!(prompt.contains("review-rejected"));
    }

    #[test]
    fn ui_planning_prompt_uses_robot_tag_for_robot_framework() {
        let prompt = build_ui_planning_prompt(&["button missing".to_string()], "ralph-tok", "robot");
        assert!(prompt.contains("robot-plan"));
        assert!(!prompt.contains("<ui-plan"));
    }

    #[test]
    fn ui_implementation_prompt_uses_ui_tag_by_default() {
        let prompt = build_ui_implementation_prompt("click the button", "ralph-tok", "agent_browser");
        assert!(prompt.contains("ui-fix-done"));
    }
}
