//! Append-only JSONL event log at `.ralph-session/logs/timeline.jsonl`.
//!
//! Every mutation the engine makes to session/task state is mirrored here
//! as a durable, human-greppable audit trail, independent of the checksum-
//! sealed `task-status.json` (which exists to deter tampering, not to be
//! read sequentially).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use ralph_proto::EventType;
use serde_json::{json, Value};

fn utc_now_iso() -> String {
    crate::session::utc_now_iso()
}

#[derive(Debug, Clone)]
pub struct TimelineLogger {
    timeline_path: PathBuf,
    session_id: Option<String>,
}

impl TimelineLogger {
    pub fn new(timeline_path: PathBuf, session_id: Option<String>) -> Self {
        if let Some(parent) = timeline_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if !timeline_path.exists() {
            let _ = std::fs::File::create(&timeline_path);
        }
        Self {
            timeline_path,
            session_id,
        }
    }

    /// Generic event builder. Only the fields actually supplied end up in
    /// the written line; two events of different kinds never carry a
    /// field of null noise.
    #[allow(clippy::too_many_arguments)]
    pub fn log(&self, event: EventType, fields: TimelineFields) -> Value {
        let mut map = BTreeMap::new();
        map.insert("ts".to_string(), json!(utc_now_iso()));
        map.insert("event".to_string(), json!(event));
        if let Some(session_id) = &self.session_id {
            map.insert("session_id".to_string(), json!(session_id));
        }
        if let Some(task_id) = fields.task_id {
            map.insert("task_id".to_string(), json!(task_id));
        }
        if let Some(role) = fields.role {
            map.insert("role".to_string(), json!(role));
        }
        if let Some(signal) = fields.signal {
            map.insert("signal".to_string(), json!(signal));
        }
        if let Some(gate) = fields.gate {
            map.insert("gate".to_string(), json!(gate));
        }
        if let Some(service) = fields.service {
            map.insert("service".to_string(), json!(service));
        }
        if let Some(status) = fields.status {
            map.insert("status".to_string(), json!(status));
        }
        if let Some(duration_ms) = fields.duration_ms {
            map.insert("duration_ms".to_string(), json!(duration_ms));
        }
        if let Some(error) = fields.error {
            map.insert("error".to_string(), json!(error));
        }
        if let Some(details) = fields.details {
            map.insert("details".to_string(), details);
        }

        let value = Value::Object(map.into_iter().collect());
        self.append_line(&value);
        value
    }

    fn append_line(&self, value: &Value) {
        let Ok(mut file) = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.timeline_path)
        else {
            return;
        };
        let line = format!("{value}\n");
        let _ = file.write_all(line.as_bytes());
    }

    pub fn session_start(&self, task_count: usize, config_path: Option<&str>) -> Value {
        self.log(
            EventType::SessionStart,
            TimelineFields::default().details(json!({
                "task_count": task_count,
                "config_path": config_path,
            })),
        )
    }

    pub fn session_end(
        &self,
        status: &str,
        completed_count: usize,
        total_count: usize,
        duration_ms: Option<u64>,
    ) -> Value {
        self.log(
            EventType::SessionEnd,
            TimelineFields::default()
                .status(status)
                .duration_ms(duration_ms)
                .details(json!({
                    "completed_count": completed_count,
                    "total_count": total_count,
                })),
        )
    }

    pub fn task_start(&self, task_id: &str, title: &str) -> Value {
        self.log(
            EventType::TaskStart,
            TimelineFields::default()
                .task_id(task_id)
                .details(json!({"title": title})),
        )
    }

    pub fn task_complete(&self, task_id: &str, iterations: u32, duration_ms: u64) -> Value {
        self.log(
            EventType::TaskComplete,
            TimelineFields::default()
                .task_id(task_id)
                .duration_ms(Some(duration_ms))
                .details(json!({"iterations": iterations})),
        )
    }

    pub fn task_failed(&self, task_id: &str, reason: &str, iterations: u32) -> Value {
        self.log(
            EventType::TaskFailed,
            TimelineFields::default()
                .task_id(task_id)
                .error(reason)
                .details(json!({"iterations": iterations})),
        )
    }

    pub fn agent_start(&self, task_id: &str, role: &str, model: Option<&str>) -> Value {
        self.log(
            EventType::AgentStart,
            TimelineFields::default()
                .task_id(task_id)
                .role(role)
                .details(model.map(|m| json!({"model": m})).unwrap_or(Value::Null)),
        )
    }

    pub fn agent_complete(&self, task_id: &str, role: &str, signal: &str, duration_ms: u64) -> Value {
        self.log(
            EventType::AgentComplete,
            TimelineFields::default()
                .task_id(task_id)
                .role(role)
                .signal(signal)
                .duration_ms(Some(duration_ms)),
        )
    }

    pub fn agent_failed(&self, task_id: &str, role: &str, error: &str, duration_ms: Option<u64>) -> Value {
        self.log(
            EventType::AgentFailed,
            TimelineFields::default()
                .task_id(task_id)
                .role(role)
                .error(error)
                .duration_ms(duration_ms),
        )
    }

    pub fn gates_run(&self, gate_type: &str, gate_count: usize, task_id: Option<&str>) -> Value {
        self.log(
            EventType::GatesRun,
            TimelineFields {
                task_id: task_id.map(str::to_string),
                ..Default::default()
            }
            .details(json!({"gate_type": gate_type, "gate_count": gate_count})),
        )
    }

    pub fn gate_pass(&self, gate_name: &str, duration_ms: u64, task_id: Option<&str>) -> Value {
        self.log(
            EventType::GatePass,
            TimelineFields {
                task_id: task_id.map(str::to_string),
                ..Default::default()
            }
            .gate(gate_name)
            .status("pass")
            .duration_ms(Some(duration_ms)),
        )
    }

    pub fn gate_fail(
        &self,
        gate_name: &str,
        error: &str,
        duration_ms: u64,
        task_id: Option<&str>,
        fatal: bool,
    ) -> Value {
        self.log(
            EventType::GateFail,
            TimelineFields {
                task_id: task_id.map(str::to_string),
                ..Default::default()
            }
            .gate(gate_name)
            .status("fail")
            .error(error)
            .duration_ms(Some(duration_ms))
            .details(json!({"fatal": fatal})),
        )
    }

    pub fn service_start(&self, service: &str, port: u16) -> Value {
        self.log(
            EventType::ServiceStart,
            TimelineFields::default()
                .service(service)
                .details(json!({"port": port})),
        )
    }

    pub fn service_ready(&self, service: &str, url: &str, duration_ms: u64) -> Value {
        self.log(
            EventType::ServiceReady,
            TimelineFields::default()
                .service(service)
                .status("ready")
                .duration_ms(Some(duration_ms))
                .details(json!({"url": url})),
        )
    }

    pub fn service_failed(&self, service: &str, error: &str, duration_ms: Option<u64>) -> Value {
        self.log(
            EventType::ServiceFailed,
            TimelineFields::default()
                .service(service)
                .status("failed")
                .error(error)
                .duration_ms(duration_ms),
        )
    }

    pub fn ui_test_start(&self, test_name: &str, framework: &str) -> Value {
        self.log(
            EventType::UiTestStart,
            TimelineFields::default().details(json!({"test_name": test_name, "framework": framework})),
        )
    }

    pub fn ui_test_pass(&self, test_name: &str, duration_ms: u64) -> Value {
        self.log(
            EventType::UiTestPass,
            TimelineFields::default()
                .status("pass")
                .duration_ms(Some(duration_ms))
                .details(json!({"test_name": test_name})),
        )
    }

    pub fn ui_test_fail(
        &self,
        test_name: &str,
        error: &str,
        screenshot: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Value {
        let mut details = json!({"test_name": test_name});
        if let Some(screenshot) = screenshot {
            details["screenshot"] = json!(screenshot);
        }
        self.log(
            EventType::UiTestFail,
            TimelineFields::default()
                .status("fail")
                .error(error)
                .duration_ms(duration_ms)
                .details(details),
        )
    }

    pub fn fix_loop_start(&self, loop_type: &str, max_iterations: u32) -> Value {
        self.log(
            EventType::FixLoopStart,
            TimelineFields::default()
                .details(json!({"loop_type": loop_type, "max_iterations": max_iterations})),
        )
    }

    pub fn fix_loop_iteration(&self, loop_type: &str, iteration: u32, status: &str) -> Value {
        self.log(
            EventType::FixLoopIteration,
            TimelineFields::default()
                .status(status)
                .details(json!({"loop_type": loop_type, "iteration": iteration})),
        )
    }

    pub fn fix_loop_end(&self, loop_type: &str, success: bool, iterations: u32) -> Value {
        self.log(
            EventType::FixLoopEnd,
            TimelineFields::default()
                .status(if success { "success" } else { "failed" })
                .details(json!({"loop_type": loop_type, "iterations": iterations, "success": success})),
        )
    }

    pub fn checksum_verified(&self) -> Value {
        self.log(EventType::ChecksumVerified, TimelineFields::default().status("verified"))
    }

    pub fn checksum_failed(&self, error: &str) -> Value {
        self.log(
            EventType::ChecksumFailed,
            TimelineFields::default().status("failed").error(error),
        )
    }

    /// Reads every event, silently skipping lines that fail to parse as
    /// JSON (crash-tolerance: a partial line left by a mid-write crash
    /// must not poison the whole read).
    pub fn read_events(&self) -> Vec<Value> {
        let Ok(contents) = std::fs::read_to_string(&self.timeline_path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn events_by_type(&self, event_type: EventType) -> Vec<Value> {
        let target = serde_json::to_value(event_type).unwrap();
        self.read_events()
            .into_iter()
            .filter(|e| e.get("event") == Some(&target))
            .collect()
    }

    pub fn events_for_task(&self, task_id: &str) -> Vec<Value> {
        self.read_events()
            .into_iter()
            .filter(|e| e.get("task_id").and_then(Value::as_str) == Some(task_id))
            .collect()
    }
}

#[derive(Debug, Default, Clone)]
pub struct TimelineFields {
    pub task_id: Option<String>,
    pub role: Option<String>,
    pub signal: Option<String>,
    pub gate: Option<String>,
    pub service: Option<String>,
    pub status: Option<String>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub details: Option<Value>,
}

impl TimelineFields {
    pub fn task_id(mut self, v: &str) -> Self {
        self.task_id = Some(v.to_string());
        self
    }
    pub fn role(mut self, v: &str) -> Self {
        self.role = Some(v.to_string());
        self
    }
    pub fn signal(mut self, v: &str) -> Self {
        self.signal = Some(v.to_string());
        self
    }
    pub fn gate(mut self, v: &str) -> Self {
        self.gate = Some(v.to_string());
        self
    }
    pub fn service(mut self, v: &str) -> Self {
        self.service = Some(v.to_string());
        self
    }
    pub fn status(mut self, v: &str) -> Self {
        self.status = Some(v.to_string());
        self
    }
    pub fn duration_ms(mut self, v: Option<u64>) -> Self {
        self.duration_ms = v;
        self
    }
    pub fn error(mut self, v: &str) -> Self {
        self.error = Some(v.to_string());
        self
    }
    pub fn details(mut self, v: Value) -> Self {
        if !v.is_null() {
            self.details = Some(v);
        }
        self
    }
}

pub fn create_timeline_logger(session_dir: &Path, session_id: Option<String>) -> TimelineLogger {
    TimelineLogger::new(session_dir.join("logs").join("timeline.jsonl"), session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = create_timeline_logger(dir.path(), Some("sess-1".to_string()));
        logger.session_start(3, Some("ralph.yml"));
        logger.task_start("T-001", "do the thing");
        let events = logger.read_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], json!("session_start"));
        assert_eq!(events[1]["task_id"], json!("T-001"));
    }

    #[test]
    fn skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("timeline.jsonl");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{\"ts\":\"x\",\"event\":\"task_start\"}\nnot json\n").unwrap();
        let logger = TimelineLogger::new(path, None);
        let events = logger.read_events();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn filters_by_event_type() {
        let dir = tempfile::tempdir().unwrap();
        let logger = create_timeline_logger(dir.path(), None);
        logger.gate_pass("lint", 100, Some("T-001"));
        logger.gate_fail("build", "exit 1", 200, Some("T-001"), true);
        let passes = logger.events_by_type(EventType::GatePass);
        assert_eq!(passes.len(), 1);
    }

    #[test]
    fn filters_by_task() {
        let dir = tempfile::tempdir().unwrap();
        let logger = create_timeline_logger(dir.path(), None);
        logger.task_start("T-001", "a");
        logger.task_start("T-002", "b");
        assert_eq!(logger.events_for_task("T-001").len(), 1);
    }
}
