use serde::{Deserialize, Serialize};

/// The fixed set of timeline event kinds. Every line appended to
/// `logs/timeline.jsonl` carries one of these as its `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionEnd,
    TaskStart,
    TaskComplete,
    TaskFailed,
    AgentStart,
    AgentComplete,
    AgentFailed,
    GatesRun,
    GatePass,
    GateFail,
    ServiceStart,
    ServiceReady,
    ServiceFailed,
    UiTestStart,
    UiTestPass,
    UiTestFail,
    FixLoopStart,
    FixLoopIteration,
    FixLoopEnd,
    ChecksumVerified,
    ChecksumFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&EventType::TaskComplete).unwrap();
        assert_eq!(json, "\"task_complete\"");
        let json = serde_json::to_string(&EventType::ChecksumFailed).unwrap();
        assert_eq!(json, "\"checksum_failed\"");
    }

    #[test]
    fn round_trips() {
        for variant in [
            EventType::SessionStart,
            EventType::GateFail,
            EventType::FixLoopIteration,
        ] {
            let json = serde_json::to_string(&variant).unwrap();
            let back: EventType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, variant);
        }
    }
}
