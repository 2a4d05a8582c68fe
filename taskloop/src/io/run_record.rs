//! Run records written to `<record_dir>/<run_id>.json`.
//!
//! A record is a product artifact, independent of `RUST_LOG`: it captures the
//! plan, every executed step and how the run ended.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{ActionRecord, Answer, StopReason, Task};

/// Fresh id of the form `run-YYYYmmdd_HHMMSS-xxxxxxxx`.
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "run-{}-{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub query: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub tasks: Vec<Task>,
    pub session_log: Vec<ActionRecord>,
    pub stop: StopReason,
    pub steps: u32,
    pub answer: Answer,
}

pub fn record_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.json"))
}

pub fn write_run_record(dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create record dir {}", dir.display()))?;
    let path = record_path(dir, &record.run_id);
    let mut buf = serde_json::to_string_pretty(record)?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write run record {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ActionArgs, ActionCall, ActionResult};
    use serde_json::Value;

    #[test]
    fn run_ids_are_unique_and_prefixed() {
        let a = new_run_id();
        let b = new_run_id();
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
    }

    #[test]
    fn writes_record_with_stop_reason_and_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("records");
        let now = Utc::now();
        let record = RunRecord {
            run_id: "run-test".to_string(),
            session_id: None,
            query: "price of SOL".to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            tasks: vec![Task::new(1, "get price")],
            session_log: vec![ActionRecord {
                task_id: 1,
                call: ActionCall::new("lookup", ActionArgs::new()),
                result: ActionResult::ok("142"),
            }],
            stop: StopReason::BudgetExhausted,
            steps: 1,
            answer: Answer {
                text: "142".to_string(),
                partial: true,
            },
        };

        let path = write_run_record(&dir, &record).expect("write");
        assert_eq!(path, dir.join("run-test.json"));

        let written: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(written["stop"], "budget_exhausted");
        assert_eq!(written["session_log"][0]["result"]["output"], "142");
        assert!(written.get("session_id").is_none());
    }
}
