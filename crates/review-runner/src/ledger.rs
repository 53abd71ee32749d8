use crate::adapter::EXIT_INTERRUPTED;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use review_core::{atomic_write_json_pretty, iso_seconds};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub const RUN_LOG_FILE: &str = "run.log";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const MERGED_OUTPUT_FILE: &str = "holistic_findings_merged.json";
pub const PROMPTS_DIR: &str = "prompts";
pub const RESULTS_DIR: &str = "results";
pub const LOGS_DIR: &str = "logs";

pub fn prompt_path(run_dir: &Path, index: usize) -> PathBuf {
    run_dir.join(PROMPTS_DIR).join(format!("batch-{}.md", index + 1))
}

pub fn result_path(run_dir: &Path, index: usize) -> PathBuf {
    run_dir.join(RESULTS_DIR).join(format!("batch-{}.raw.txt", index + 1))
}

pub fn log_path(run_dir: &Path, index: usize) -> PathBuf {
    run_dir.join(LOGS_DIR).join(format!("batch-{}.log", index + 1))
}

/// Append-only, timestamped run log. Lines are `<rfc3339> <event> <fields>`.
pub struct RunLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open run log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("run log writer lock poisoned"))?;
        writeln!(writer, "{} {}", iso_seconds(Utc::now()), message)?;
        writer.flush()?;
        Ok(())
    }

    /// Like `append`, but a failed write only warns.
    pub fn note(&self, message: &str) {
        if let Err(err) = self.append(message) {
            warn!(log = %self.path.display(), error = %err, "failed to append run log");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    MissingOutput,
    ParseFailed,
    Interrupted,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTask {
    pub position: usize,
    pub status: BatchStatus,
    pub prompt_path: String,
    pub result_path: String,
    pub log_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
}

/// Per-batch state for one run, keyed by 0-based index.
#[derive(Debug, Clone, Default)]
pub struct BatchLedger {
    tasks: BTreeMap<usize, BatchTask>,
}

impl BatchLedger {
    pub fn new(run_dir: &Path, selected: &[usize]) -> Self {
        let tasks = selected
            .iter()
            .enumerate()
            .map(|(pos, idx)| {
                (
                    *idx,
                    BatchTask {
                        position: pos + 1,
                        status: BatchStatus::Pending,
                        prompt_path: prompt_path(run_dir, *idx).display().to_string(),
                        result_path: result_path(run_dir, *idx).display().to_string(),
                        log_path: log_path(run_dir, *idx).display().to_string(),
                        exit_code: None,
                        started_at: None,
                        completed_at: None,
                        elapsed_seconds: None,
                    },
                )
            })
            .collect();
        Self { tasks }
    }

    pub fn get(&self, index: usize) -> Option<&BatchTask> {
        self.tasks.get(&index)
    }

    pub fn position(&self, index: usize) -> usize {
        self.tasks.get(&index).map(|t| t.position).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn set_status(&mut self, index: usize, status: BatchStatus) {
        if let Some(task) = self.tasks.get_mut(&index) {
            task.status = status;
        }
    }

    pub fn mark_started(&mut self, index: usize, now: &str) {
        if let Some(task) = self.tasks.get_mut(&index) {
            task.status = BatchStatus::Running;
            task.started_at = Some(now.to_string());
        }
    }

    pub fn mark_done(&mut self, index: usize, code: i32, elapsed_seconds: u64, now: &str) {
        if let Some(task) = self.tasks.get_mut(&index) {
            task.status = match code {
                0 => BatchStatus::Succeeded,
                EXIT_INTERRUPTED => BatchStatus::Interrupted,
                _ => BatchStatus::Failed,
            };
            task.exit_code = Some(code);
            task.elapsed_seconds = Some(elapsed_seconds);
            task.completed_at = Some(now.to_string());
        }
    }

    /// Move every non-terminal task to `interrupted`; returns how many moved.
    pub fn interrupt_unfinished(&mut self) -> usize {
        let mut moved = 0;
        for task in self.tasks.values_mut() {
            if !task.status.is_terminal() {
                task.status = BatchStatus::Interrupted;
                moved += 1;
            }
        }
        moved
    }

    /// Summary view keyed by the 1-based index string.
    pub fn to_summary_map(&self) -> BTreeMap<String, BatchTask> {
        self.tasks
            .iter()
            .map(|(idx, task)| ((idx + 1).to_string(), task.clone()))
            .collect()
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// `run_summary.json`. Batch indexes are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created_at: String,
    pub run_stamp: String,
    pub runner: String,
    pub parallel: bool,
    pub selected_batches: Vec<usize>,
    pub successful_batches: Vec<usize>,
    pub failed_batches: Vec<usize>,
    pub allow_partial: bool,
    pub max_parallel_batches: usize,
    pub batch_timeout_seconds: u64,
    pub batch_max_retries: u32,
    pub batch_retry_backoff_seconds: f64,
    pub batch_heartbeat_seconds: Option<f64>,
    pub batch_stall_warning_seconds: Option<u64>,
    pub batch_stall_kill_seconds: u64,
    pub immutable_packet: String,
    pub blind_packet: String,
    pub run_dir: String,
    pub logs_dir: String,
    pub run_log: String,
    #[serde(default)]
    pub batches: BTreeMap<String, BatchTask>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interruption_reason: Option<String>,
}

impl RunSummary {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read run summary {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("run summary is not valid: {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("reviewlab_ledger_{}_{}", label, nanos))
    }

    #[test]
    fn run_log_appends_timestamped_lines() {
        let root = temp_root("log");
        let log = RunLog::open(&root.join(RUN_LOG_FILE)).expect("open");
        log.append("run-start runner=codex").expect("append");
        log.note("run-path /tmp/x");
        let reopened = RunLog::open(&root.join(RUN_LOG_FILE)).expect("reopen");
        reopened.append("run-finished dry-run").expect("append");

        let text = fs::read_to_string(root.join(RUN_LOG_FILE)).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" run-start runner=codex"));
        assert!(lines[0].contains('T') && lines[0].split(' ').next().unwrap_or("").ends_with('Z'));
        assert!(lines[2].ends_with("run-finished dry-run"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn ledger_tracks_status_and_interrupts_only_unfinished() {
        let run_dir = Path::new("/runs/20260101_000000");
        let mut ledger = BatchLedger::new(run_dir, &[4, 0, 2]);
        assert_eq!(ledger.position(0), 2);
        ledger.mark_started(4, "t0");
        ledger.mark_done(4, 0, 12, "t1");
        ledger.set_status(0, BatchStatus::Queued);
        assert_eq!(ledger.interrupt_unfinished(), 2);

        let map = ledger.to_summary_map();
        assert_eq!(map["5"].status, BatchStatus::Succeeded);
        assert_eq!(map["5"].elapsed_seconds, Some(12));
        assert_eq!(map["1"].status, BatchStatus::Interrupted);
        assert_eq!(map["3"].status, BatchStatus::Interrupted);
        assert!(map["1"].prompt_path.ends_with("prompts/batch-1.md"));
        assert!(map["3"].result_path.ends_with("results/batch-3.raw.txt"));
    }

    #[test]
    fn interrupted_exit_code_is_recorded_as_interrupted() {
        let mut ledger = BatchLedger::new(Path::new("/runs/x"), &[0, 1]);
        ledger.mark_done(0, EXIT_INTERRUPTED, 3, "t1");
        ledger.mark_done(1, 2, 3, "t1");
        let map = ledger.to_summary_map();
        assert_eq!(map["1"].status, BatchStatus::Interrupted);
        assert_eq!(map["1"].exit_code, Some(130));
        assert_eq!(map["2"].status, BatchStatus::Failed);
    }

    #[test]
    fn summary_round_trips_and_omits_interruption_when_clean() {
        let root = temp_root("summary");
        let summary = RunSummary {
            created_at: "2026-01-01T00:00:00Z".to_string(),
            run_stamp: "20260101_000000".to_string(),
            runner: "codex".to_string(),
            parallel: false,
            selected_batches: vec![1, 2],
            successful_batches: vec![1],
            failed_batches: vec![2],
            allow_partial: true,
            max_parallel_batches: 1,
            batch_timeout_seconds: 60,
            batch_max_retries: 1,
            batch_retry_backoff_seconds: 2.0,
            batch_heartbeat_seconds: None,
            batch_stall_warning_seconds: None,
            batch_stall_kill_seconds: 120,
            immutable_packet: "/p.json".to_string(),
            blind_packet: "/b.json".to_string(),
            run_dir: root.display().to_string(),
            logs_dir: root.join(LOGS_DIR).display().to_string(),
            run_log: root.join(RUN_LOG_FILE).display().to_string(),
            batches: BTreeMap::new(),
            interrupted: false,
            interruption_reason: None,
        };
        let path = root.join(RUN_SUMMARY_FILE);
        summary.write(&path).expect("write");
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert!(raw.get("interrupted").is_none());
        assert_eq!(raw["batch_heartbeat_seconds"], serde_json::Value::Null);
        assert_eq!(RunSummary::load(&path).expect("load"), summary);
        let _ = fs::remove_dir_all(root);
    }
}
