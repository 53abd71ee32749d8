use crate::adapter::{TRANSIENT_RUNNER_PHRASES, USAGE_LIMIT_PHRASES};
use crate::ledger::log_path;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

const AUTH_PHRASES: [&str; 7] = [
    "not authenticated",
    "authentication failed",
    "unauthorized",
    "forbidden",
    "login required",
    "please login",
    "access token",
];
const BACKEND_UNREACHABLE_HINTS: [&str; 5] = [
    "/backend-api/codex/responses",
    "chatgpt.com",
    "nodename nor servname provided",
    "name or service not known",
    "temporary failure in name resolution",
];
const SANDBOX_PHRASES: [&str; 2] = [
    "could not update path: operation not permitted",
    "operation not permitted (os error 1)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    UsageLimit,
    StreamDisconnect,
    RunnerMissing,
    RunnerAuth,
    RunnerException,
    Unknown,
    MissingLog,
    LogReadError,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::UsageLimit => "usage_limit",
            Self::StreamDisconnect => "stream_disconnect",
            Self::RunnerMissing => "runner_missing",
            Self::RunnerAuth => "runner_auth",
            Self::RunnerException => "runner_exception",
            Self::Unknown => "unknown",
            Self::MissingLog => "missing_log",
            Self::LogReadError => "log_read_error",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::UsageLimit => "usage limit",
            Self::StreamDisconnect => "stream disconnect",
            Self::RunnerMissing => "runner missing",
            Self::RunnerAuth => "runner auth",
            Self::RunnerException => "runner exception",
            Self::Unknown => "unknown",
            Self::MissingLog => "missing log",
            Self::LogReadError => "log read error",
        }
    }
}

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| text.contains(p))
}

fn looks_like_missing_runner(text: &str) -> bool {
    text.contains("codex not found")
        || (text.contains("no such file or directory") && text.contains("$ codex "))
        || (text.contains("errno 2") && text.contains("codex"))
}

/// Classify a failed batch from its log text. First match wins.
pub fn classify_failure(log_text: &str) -> FailureCategory {
    let text = log_text.to_lowercase();
    if text.contains("timeout after") {
        FailureCategory::Timeout
    } else if contains_any(&text, &USAGE_LIMIT_PHRASES) {
        FailureCategory::UsageLimit
    } else if contains_any(&text, &TRANSIENT_RUNNER_PHRASES) {
        FailureCategory::StreamDisconnect
    } else if looks_like_missing_runner(&text) {
        FailureCategory::RunnerMissing
    } else if contains_any(&text, &AUTH_PHRASES) {
        FailureCategory::RunnerAuth
    } else if text.contains("runner exception") || text.contains("runner error:") {
        FailureCategory::RunnerException
    } else {
        FailureCategory::Unknown
    }
}

fn read_log(logs_parent: &Path, index: usize) -> Result<String, FailureCategory> {
    let path = log_path(logs_parent, index);
    if !path.exists() {
        return Err(FailureCategory::MissingLog);
    }
    fs::read_to_string(&path).map_err(|_| FailureCategory::LogReadError)
}

fn push_unique(hints: &mut Vec<String>, hint: &str) {
    if !hints.iter().any(|h| h == hint) {
        hints.push(hint.to_string());
    }
}

/// Environment hints inferred from the text of one failed batch log.
pub fn failure_hints_for(log_text: &str, hints: &mut Vec<String>) {
    let text = log_text.to_lowercase();
    if looks_like_missing_runner(&text) {
        push_unique(
            hints,
            "codex CLI not found on PATH. Install Codex CLI and verify `codex --version`.",
        );
    }
    if contains_any(&text, &AUTH_PHRASES) {
        push_unique(
            hints,
            "codex runner appears unauthenticated. Run `codex login` and retry.",
        );
    }
    if contains_any(&text, &USAGE_LIMIT_PHRASES) {
        push_unique(
            hints,
            "Codex usage quota is exhausted for this account. Wait for reset or add credits, then rerun failed batches.",
        );
    }
    if contains_any(&text, &TRANSIENT_RUNNER_PHRASES) {
        push_unique(
            hints,
            "Transient Codex connectivity issue detected. Retry with `--batch-max-retries 2 --batch-retry-backoff-seconds 2` and, if needed, lower concurrency via `--max-parallel-batches 1`.",
        );
    }
    if text.contains("error sending request for url") && contains_any(&text, &BACKEND_UNREACHABLE_HINTS) {
        push_unique(
            hints,
            "Codex runner cannot reach its backend from this environment. Check outbound HTTPS/DNS/proxy access, or use the external session flow: `reviewlab session start --runner claude`.",
        );
        if contains_any(&text, &SANDBOX_PHRASES) {
            push_unique(
                hints,
                "Logs suggest the run executed in a restricted sandbox. Re-run `reviewlab run-batches` from a host shell with outbound network access.",
            );
        }
    }
}

pub fn retry_command(packet_path: &Path, failed_one_based: &[usize]) -> String {
    let csv = failed_one_based
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "review --run-batches --packet {} --only-batches {}",
        packet_path.display(),
        csv
    )
}

/// Everything an operator needs to retry failed batches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub failed_batches: Vec<usize>,
    pub categories: BTreeMap<FailureCategory, usize>,
    pub retry_command: String,
    pub log_paths: Vec<String>,
    pub tuning: Vec<String>,
    pub hints: Vec<String>,
}

impl FailureReport {
    /// `failed` is 0-based; `run_dir` holds the `logs/` directory.
    pub fn build(failed: &[usize], packet_path: &Path, run_dir: &Path) -> Self {
        let mut indexes: Vec<usize> = failed.to_vec();
        indexes.sort_unstable();
        indexes.dedup();

        let mut categories: BTreeMap<FailureCategory, usize> = BTreeMap::new();
        let mut hints = Vec::new();
        for index in &indexes {
            let category = match read_log(run_dir, *index) {
                Ok(text) => {
                    failure_hints_for(&text, &mut hints);
                    classify_failure(&text)
                }
                Err(category) => category,
            };
            *categories.entry(category).or_insert(0) += 1;
        }

        let mut tuning = Vec::new();
        if categories.contains_key(&FailureCategory::Timeout) {
            tuning.push(
                "Timeout tuning: lower concurrency with `--max-parallel-batches 1..3` or increase `--batch-timeout-seconds` for long-running reviews."
                    .to_string(),
            );
        }
        if categories.contains_key(&FailureCategory::StreamDisconnect) {
            tuning.push(
                "Connectivity tuning: enable retries with `--batch-max-retries 2` and `--batch-retry-backoff-seconds 2`, then retry failed batches."
                    .to_string(),
            );
        }

        let one_based: Vec<usize> = indexes.iter().map(|i| i + 1).collect();
        Self {
            retry_command: retry_command(packet_path, &one_based),
            log_paths: indexes
                .iter()
                .map(|i| log_path(run_dir, *i).display().to_string())
                .collect(),
            failed_batches: one_based,
            categories,
            tuning,
            hints,
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Failed batches: {:?}", self.failed_batches)?;
        if !self.categories.is_empty() {
            let segments: Vec<String> = self
                .categories
                .iter()
                .map(|(category, count)| format!("{}={}", category.label(), count))
                .collect();
            writeln!(f, "Failure categories: {}", segments.join(", "))?;
        }
        for line in &self.tuning {
            writeln!(f, "{}", line)?;
        }
        writeln!(f, "Retry command:")?;
        writeln!(f, "  {}", self.retry_command)?;
        for path in &self.log_paths {
            writeln!(f, "  log: {}", path)?;
        }
        if !self.hints.is_empty() {
            writeln!(f, "Environment hints:")?;
            for hint in &self.hints {
                writeln!(f, "  {}", hint)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_run_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("reviewlab_failures_{}_{}", label, nanos));
        fs::create_dir_all(root.join("logs")).expect("mkdir");
        root
    }

    #[test]
    fn classification_follows_precedence() {
        assert_eq!(classify_failure("TIMEOUT after 60s\nconnection reset"), FailureCategory::Timeout);
        assert_eq!(
            classify_failure("You've hit your usage limit; connection reset"),
            FailureCategory::UsageLimit
        );
        assert_eq!(
            classify_failure("stream disconnected before completion"),
            FailureCategory::StreamDisconnect
        );
        assert_eq!(
            classify_failure("$ codex exec\nRUNNER ERROR:\ncodex: No such file or directory (os error 2)"),
            FailureCategory::RunnerMissing
        );
        assert_eq!(classify_failure("401 Unauthorized"), FailureCategory::RunnerAuth);
        assert_eq!(classify_failure("segfault"), FailureCategory::Unknown);
    }

    #[test]
    fn report_counts_categories_and_builds_retry_command() {
        let run_dir = temp_run_dir("report");
        fs::write(log_path(&run_dir, 0), "ATTEMPT 1/1\n\nTIMEOUT after 10s\n").expect("log");
        fs::write(log_path(&run_dir, 3), "error: not authenticated").expect("log");
        let report = FailureReport::build(&[3, 0, 1, 3], Path::new("/state/packet.json"), &run_dir);

        assert_eq!(report.failed_batches, vec![1, 2, 4]);
        assert_eq!(report.categories.get(&FailureCategory::Timeout), Some(&1));
        assert_eq!(report.categories.get(&FailureCategory::MissingLog), Some(&1));
        assert_eq!(report.categories.get(&FailureCategory::RunnerAuth), Some(&1));
        assert_eq!(
            report.retry_command,
            "review --run-batches --packet /state/packet.json --only-batches 1,2,4"
        );
        assert_eq!(report.log_paths.len(), 3);
        assert_eq!(report.tuning.len(), 1);
        assert!(report.hints.iter().any(|h| h.contains("codex login")));
        let rendered = report.to_string();
        assert!(rendered.contains("Failure categories: timeout=1, runner auth=1, missing log=1"));
        let _ = fs::remove_dir_all(run_dir);
    }
}
