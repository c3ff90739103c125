use std::fmt;

/// The nine signal tag names an agent may echo back. Every other tag name
/// is simply not a signal — the lexer in `ralph-core::signal` never tries
/// to interpret anything outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleVerb {
    TaskDone,
    TestsDone,
    ReviewApproved,
    ReviewRejected,
    FixDone,
    UiPlan,
    UiFixDone,
    RobotPlan,
    RobotFixDone,
}

impl RoleVerb {
    pub const ALL: [RoleVerb; 9] = [
        RoleVerb::TaskDone,
        RoleVerb::TestsDone,
        RoleVerb::ReviewApproved,
        RoleVerb::ReviewRejected,
        RoleVerb::FixDone,
        RoleVerb::UiPlan,
        RoleVerb::UiFixDone,
        RoleVerb::RobotPlan,
        RoleVerb::RobotFixDone,
    ];

    /// The literal tag name as it appears in agent output, e.g. `task-done`.
    pub fn tag_name(self) -> &'static str {
        match self {
            RoleVerb::TaskDone => "task-done",
            RoleVerb::TestsDone => "tests-done",
            RoleVerb::ReviewApproved => "review-approved",
            RoleVerb::ReviewRejected => "review-rejected",
            RoleVerb::FixDone => "fix-done",
            RoleVerb::UiPlan => "ui-plan",
            RoleVerb::UiFixDone => "ui-fix-done",
            RoleVerb::RobotPlan => "robot-plan",
            RoleVerb::RobotFixDone => "robot-fix-done",
        }
    }

    pub fn from_tag_name(name: &str) -> Option<RoleVerb> {
        Self::ALL.into_iter().find(|verb| verb.tag_name() == name)
    }
}

impl fmt::Display for RoleVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_round_trip() {
        for verb in RoleVerb::ALL {
            assert_eq!(RoleVerb::from_tag_name(verb.tag_name()), Some(verb));
        }
    }

    #[test]
    fn unknown_tag_is_none() {
        assert_eq!(RoleVerb::from_tag_name("event"), None);
        assert_eq!(RoleVerb::from_tag_name("task-done-extra"), None);
    }
}
