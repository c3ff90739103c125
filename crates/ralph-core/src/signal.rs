//! Hand-written lexer for the nine-tag signal grammar:
//! `<role-verb session="token">body</role-verb>`.
//!
//! Deliberately not a general markup parser (per the design notes this
//! is built from): it recognizes exactly the nine role-verb tag names
//! and exactly one attribute, `session`, and rejects anything with an
//! extra attribute or a nested tag of the same name.

use ralph_proto::RoleVerb;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub role_verb: RoleVerb,
    pub session: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalStatus {
    /// No well-formed tag for this role-verb was found at all.
    Missing,
    /// A well-formed tag was found but its `session` attribute did not
    /// match the expected token.
    WrongToken(Signal),
    /// A well-formed tag was found with the expected token.
    Valid(Signal),
}

impl SignalStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignalStatus::Valid(_))
    }

    pub fn signal(&self) -> Option<&Signal> {
        match self {
            SignalStatus::Valid(s) | SignalStatus::WrongToken(s) => Some(s),
            SignalStatus::Missing => None,
        }
    }
}

/// Scans `output` for the first well-formed occurrence of `role_verb`'s
/// tag and checks it against `expected_session`.
pub fn find_signal(output: &str, role_verb: RoleVerb, expected_session: &str) -> SignalStatus {
    match scan_for_tag(output, role_verb) {
        Some(signal) if signal.session == expected_session => SignalStatus::Valid(signal),
        Some(signal) => SignalStatus::WrongToken(signal),
        None => SignalStatus::Missing,
    }
}

/// Returns the first of `candidates` that is present and valid, in the
/// order given — used by the review phase, which accepts either
/// `review-approved` or `review-rejected`.
pub fn find_first_valid(
    output: &str,
    candidates: &[RoleVerb],
    expected_session: &str,
) -> Option<(RoleVerb, SignalStatus)> {
    for &verb in candidates {
        let status = find_signal(output, verb, expected_session);
        if !matches!(status, SignalStatus::Missing) {
            return Some((verb, status));
        }
    }
    None
}

/// Scans for the first well-formed `<tag session="...">body</tag>` block
/// for the given role-verb's literal tag name. Rejects a candidate open
/// tag carrying any attribute other than `session`, and rejects a body
/// that itself contains a nested opening tag of the same name before the
/// matching close tag (same-name nesting is explicitly disallowed).
fn scan_for_tag(output: &str, role_verb: RoleVerb) -> Option<Signal> {
    let tag = role_verb.tag_name();
    let open_prefix = format!("<{tag}");
    let close_tag = format!("</{tag}>");

    let mut search_from = 0usize;
    while let Some(rel_start) = output[search_from..].find(&open_prefix) {
        let start = search_from + rel_start;
        // Ensure this is a tag boundary, not e.g. "<task-done-extra".
        let after_prefix = start + open_prefix.len();
        let next_char = output[after_prefix..].chars().next();
        if !matches!(next_char, Some(' ') | Some('>')) {
            search_from = after_prefix;
            continue;
        }

        let Some(rel_gt) = output[after_prefix..].find('>') else {
            return None;
        };
        let attrs_str = &output[after_prefix..after_prefix + rel_gt];
        let body_start = after_prefix + rel_gt + 1;

        let Some(rel_close) = output[body_start..].find(&close_tag) else {
            search_from = body_start;
            continue;
        };
        let body_end = body_start + rel_close;
        let body = &output[body_start..body_end];

        // Reject same-name nested opening tag inside the body.
        if body.contains(&open_prefix) {
            search_from = body_start + rel_close + close_tag.len();
            continue;
        }

        match parse_session_attr(attrs_str) {
            Some(session) => {
                return Some(Signal {
                    role_verb,
                    session,
                    body: body.to_string(),
                });
            }
            None => {
                search_from = body_start + rel_close + close_tag.len();
                continue;
            }
        }
    }
    None
}

/// Parses the attribute string between the tag name and `>`. Valid iff
/// it is exactly `session="<value>"` (whitespace-trimmed) with no other
/// attribute present.
fn parse_session_attr(attrs: &str) -> Option<String> {
    let trimmed = attrs.trim();
    let rest = trimmed.strip_prefix("session=")?;
    let rest = rest.trim_start();
    let mut chars = rest.chars();
    if chars.next() != Some('"') {
        return None;
    }
    let remainder = &rest[1..];
    let end = remainder.find('"')?;
    let value = &remainder[..end];
    let after = remainder[end + 1..].trim();
    if !after.is_empty() {
        // Extra attribute or trailing content after the closing quote.
        return None;
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_simple_valid_signal() {
        let output = r#"work done <task-done session="ralph-tok">ok</task-done> bye"#;
        let status = find_signal(output, RoleVerb::TaskDone, "ralph-tok");
        assert!(status.is_valid());
        assert_eq!(status.signal().unwrap().body, "ok");
    }

    #[test]
    fn wrong_token_is_detected_distinctly() {
        let output = r#"<task-done session="wrong">ok</task-done>"#;
        let status = find_signal(output, RoleVerb::TaskDone, "ralph-tok");
        assert_eq!(
            status,
            SignalStatus::WrongToken(Signal {
                role_verb: RoleVerb::TaskDone,
                session: "wrong".to_string(),
                body: "ok".to_string(),
            })
        );
    }

    #[test]
    fn missing_signal_is_missing() {
        let output = "no signal here";
        assert_eq!(
            find_signal(output, RoleVerb::TaskDone, "ralph-tok"),
            SignalStatus::Missing
        );
    }

    #[test]
    fn rejects_tag_with_extra_attribute() {
        let output = r#"<task-done session="ralph-tok" extra="x">ok</task-done>"#;
        assert_eq!(
            find_signal(output, RoleVerb::TaskDone, "ralph-tok"),
            SignalStatus::Missing
        );
    }

    #[test]
    fn rejects_same_name_nested_tag() {
        let output =
            r#"<task-done session="ralph-tok">outer <task-done session="ralph-tok">inner</task-done> tail</task-done>"#;
        // The outer open tag's body contains a same-name nested open tag
        // before any close tag at this scan position, so it's rejected;
        // scanning continues and finds the well-formed inner occurrence.
        let status = find_signal(output, RoleVerb::TaskDone, "ralph-tok");
        assert!(status.is_valid());
        assert_eq!(status.signal().unwrap().body, "inner");
    }

    #[test]
    fn does_not_confuse_prefix_tag_names() {
        // tests-done must not match a scan for task-done.
        let output = r#"<tests-done session="ralph-tok">ok</tests-done>"#;
        assert_eq!(
            find_signal(output, RoleVerb::TaskDone, "ralph-tok"),
            SignalStatus::Missing
        );
    }

    #[test]
    fn first_well_formed_match_wins_per_role_verb() {
        let output = r#"<task-done session="wrong">first</task-done> then <task-done session="ralph-tok">second</task-done>"#;
        let status = find_signal(output, RoleVerb::TaskDone, "ralph-tok");
        // First occurrence is used even though it has the wrong token;
        // it is reported as WrongToken rather than skipped in favor of
        // a later, valid one.
        assert_eq!(
            status,
            SignalStatus::WrongToken(Signal {
                role_verb: RoleVerb::TaskDone,
                session: "wrong".to_string(),
                body: "first".to_string(),
            })
        );
    }

    #[test]
    fn find_first_valid_prefers_order_given() {
        let output = r#"<review-rejected session="ralph-tok">needs work</review-rejected>"#;
        let (verb, status) = find_first_valid(
            output,
            &[RoleVerb::ReviewApproved, RoleVerb::ReviewRejected],
            "ralph-tok",
        )
        .unwrap();
        assert_eq!(verb, RoleVerb::ReviewRejected);
        assert!(status.is_valid());
    }
}
