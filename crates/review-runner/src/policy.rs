use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const REASONING_EFFORT_ENV: &str = "REVIEWLAB_CODEX_REASONING_EFFORT";
pub const REASONING_EFFORTS: [&str; 4] = ["low", "medium", "high", "xhigh"];
const DEFAULT_REASONING_EFFORT: &str = "low";

pub const DEFAULT_MAX_PARALLEL_BATCHES: usize = 3;
pub const DEFAULT_HEARTBEAT_SECONDS: f64 = 15.0;
pub const MIN_HEARTBEAT_SECONDS: f64 = 0.1;
pub const DEFAULT_BATCH_TIMEOUT_SECONDS: u64 = 2 * 60 * 60;
pub const DEFAULT_BATCH_MAX_RETRIES: u32 = 1;
pub const DEFAULT_RETRY_BACKOFF_SECONDS: f64 = 2.0;
pub const DEFAULT_STALL_KILL_SECONDS: u64 = 120;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("{0} must be >= 1")]
    BelowOne(&'static str),
    #[error("{0} must be a positive number")]
    NotPositive(&'static str),
    #[error("{0} must be a non-negative number")]
    Negative(&'static str),
    #[error("unsupported runner '{0}' (supported: codex, claude)")]
    UnknownRunner(String),
}

/// Agent CLI used to execute batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Runner {
    #[default]
    Codex,
    Claude,
}

impl Runner {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "codex" => Ok(Self::Codex),
            "claude" => Ok(Self::Claude),
            _ => Err(PolicyError::UnknownRunner(raw.to_string())),
        }
    }

    /// Only codex can be driven as a local subprocess; claude reviews go
    /// through the external session flow.
    pub fn supports_local_batches(self) -> bool {
        matches!(self, Self::Codex)
    }
}

impl fmt::Display for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw, possibly absent execution knobs as they arrive from the CLI.
#[derive(Debug, Clone, Default)]
pub struct PolicyInputs {
    pub parallel: bool,
    pub max_parallel_batches: Option<usize>,
    pub heartbeat_seconds: Option<f64>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_backoff_seconds: Option<f64>,
    pub stall_warning_seconds: Option<u64>,
    pub stall_kill_seconds: Option<u64>,
}

/// Resolved runtime knobs for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPolicy {
    pub parallel: bool,
    pub max_workers: usize,
    pub heartbeat_seconds: f64,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_backoff_seconds: f64,
    pub stall_warning_seconds: u64,
    pub stall_kill_seconds: u64,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            parallel: false,
            max_workers: DEFAULT_MAX_PARALLEL_BATCHES,
            heartbeat_seconds: DEFAULT_HEARTBEAT_SECONDS,
            timeout_seconds: DEFAULT_BATCH_TIMEOUT_SECONDS,
            max_retries: DEFAULT_BATCH_MAX_RETRIES,
            retry_backoff_seconds: DEFAULT_RETRY_BACKOFF_SECONDS,
            stall_warning_seconds: 0,
            stall_kill_seconds: DEFAULT_STALL_KILL_SECONDS,
        }
    }
}

impl RunPolicy {
    pub fn resolve(inputs: &PolicyInputs) -> Result<Self, PolicyError> {
        let defaults = Self::default();

        let max_workers = inputs.max_parallel_batches.unwrap_or(defaults.max_workers);
        if max_workers == 0 {
            return Err(PolicyError::BelowOne("max_parallel_batches"));
        }
        let heartbeat_seconds = match inputs.heartbeat_seconds {
            None => defaults.heartbeat_seconds,
            Some(v) if v.is_finite() && v > 0.0 => v.max(MIN_HEARTBEAT_SECONDS),
            Some(_) => return Err(PolicyError::NotPositive("batch_heartbeat_seconds")),
        };
        let timeout_seconds = inputs.timeout_seconds.unwrap_or(defaults.timeout_seconds);
        if timeout_seconds == 0 {
            return Err(PolicyError::BelowOne("batch_timeout_seconds"));
        }
        let retry_backoff_seconds = match inputs.retry_backoff_seconds {
            None => defaults.retry_backoff_seconds,
            Some(v) if v.is_finite() && v >= 0.0 => v,
            Some(_) => return Err(PolicyError::Negative("batch_retry_backoff_seconds")),
        };

        Ok(Self {
            parallel: inputs.parallel,
            max_workers,
            heartbeat_seconds,
            timeout_seconds,
            max_retries: inputs.max_retries.unwrap_or(defaults.max_retries),
            retry_backoff_seconds,
            stall_warning_seconds: inputs.stall_warning_seconds.unwrap_or(0),
            stall_kill_seconds: inputs
                .stall_kill_seconds
                .unwrap_or(defaults.stall_kill_seconds),
        })
    }

    pub fn max_parallel_workers(&self, total_batches: usize) -> usize {
        if total_batches == 0 || !self.parallel {
            return 1;
        }
        total_batches.min(self.max_workers).max(1)
    }

    /// Upper bound on wall time if every batch runs to its timeout.
    pub fn worst_case_minutes(&self, total_batches: usize) -> u64 {
        let workers = self.max_parallel_workers(total_batches) as u64;
        let waves = (total_batches.max(1) as u64).div_ceil(workers).max(1);
        (waves * self.timeout_seconds).div_ceil(60).max(1)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn stall_kill(&self) -> Option<Duration> {
        (self.stall_kill_seconds > 0).then(|| Duration::from_secs(self.stall_kill_seconds))
    }

    /// Cadence for live log snapshots while an attempt is running.
    pub fn live_log_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_seconds.clamp(1.0, 10.0))
    }
}

pub fn parse_reasoning_effort(raw: Option<&str>) -> &'static str {
    let token = raw.unwrap_or("").trim().to_ascii_lowercase();
    REASONING_EFFORTS
        .iter()
        .copied()
        .find(|effort| *effort == token)
        .unwrap_or(DEFAULT_REASONING_EFFORT)
}

pub fn reasoning_effort_from_env() -> &'static str {
    parse_reasoning_effort(env::var(REASONING_EFFORT_ENV).ok().as_deref())
}

/// Build one `codex exec` command line for a batch prompt.
pub fn codex_batch_command(
    prompt: &str,
    repo_root: &Path,
    output_file: &Path,
    effort: &str,
) -> Vec<String> {
    vec![
        "codex".to_string(),
        "exec".to_string(),
        "--ephemeral".to_string(),
        "-C".to_string(),
        repo_root.display().to_string(),
        "-s".to_string(),
        "workspace-write".to_string(),
        "-c".to_string(),
        "approval_policy=\"never\"".to_string(),
        "-c".to_string(),
        format!("model_reasoning_effort=\"{}\"", effort),
        "-o".to_string(),
        output_file.display().to_string(),
        prompt.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_inputs_are_absent() {
        let policy = RunPolicy::resolve(&PolicyInputs::default()).expect("resolve");
        assert_eq!(policy, RunPolicy::default());
        assert_eq!(policy.stall_kill(), Some(Duration::from_secs(120)));
        assert_eq!(policy.max_parallel_workers(5), 1);
    }

    #[test]
    fn heartbeat_is_floored_and_invalid_values_rejected() {
        let policy = RunPolicy::resolve(&PolicyInputs {
            heartbeat_seconds: Some(0.01),
            ..PolicyInputs::default()
        })
        .expect("resolve");
        assert_eq!(policy.heartbeat_seconds, MIN_HEARTBEAT_SECONDS);

        let err = RunPolicy::resolve(&PolicyInputs {
            heartbeat_seconds: Some(0.0),
            ..PolicyInputs::default()
        })
        .expect_err("zero heartbeat");
        assert_eq!(err, PolicyError::NotPositive("batch_heartbeat_seconds"));
        assert!(RunPolicy::resolve(&PolicyInputs {
            max_parallel_batches: Some(0),
            ..PolicyInputs::default()
        })
        .is_err());
        assert!(RunPolicy::resolve(&PolicyInputs {
            retry_backoff_seconds: Some(-1.0),
            ..PolicyInputs::default()
        })
        .is_err());
    }

    #[test]
    fn worst_case_counts_waves_of_workers() {
        let policy = RunPolicy::resolve(&PolicyInputs {
            parallel: true,
            max_parallel_batches: Some(2),
            timeout_seconds: Some(90),
            ..PolicyInputs::default()
        })
        .expect("resolve");
        assert_eq!(policy.max_parallel_workers(5), 2);
        assert_eq!(policy.max_parallel_workers(1), 1);
        // 3 waves * 90s = 270s -> 5 minutes
        assert_eq!(policy.worst_case_minutes(5), 5);
    }

    #[test]
    fn reasoning_effort_falls_back_to_low() {
        assert_eq!(parse_reasoning_effort(Some(" HIGH ")), "high");
        assert_eq!(parse_reasoning_effort(Some("extreme")), "low");
        assert_eq!(parse_reasoning_effort(None), "low");
    }

    #[test]
    fn codex_command_carries_output_and_effort() {
        let cmd = codex_batch_command(
            "review this",
            Path::new("/repo"),
            Path::new("/run/results/batch-1.raw.txt"),
            "medium",
        );
        assert_eq!(&cmd[..3], ["codex", "exec", "--ephemeral"]);
        assert!(cmd.contains(&"model_reasoning_effort=\"medium\"".to_string()));
        let out = cmd.iter().position(|c| c == "-o").expect("-o flag");
        assert_eq!(cmd[out + 1], "/run/results/batch-1.raw.txt");
        assert_eq!(cmd.last().map(String::as_str), Some("review this"));
        assert_eq!(Runner::parse("Codex"), Ok(Runner::Codex));
        assert!(Runner::parse("gpt").is_err());
    }
}
