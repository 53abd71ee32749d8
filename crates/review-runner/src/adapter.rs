use crate::policy::{codex_batch_command, RunPolicy};
use chrono::{DateTime, Utc};
use review_core::{atomic_write_bytes, iso_seconds, shell_join};
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const EXIT_INTERNAL_ERROR: i32 = 1;
pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_LAUNCH_FAILED: i32 = 127;
pub const EXIT_INTERRUPTED: i32 = 130;

pub const TRANSIENT_RUNNER_PHRASES: [&str; 10] = [
    "stream disconnected before completion",
    "error sending request for url",
    "connection reset by peer",
    "connection reset",
    "connection aborted",
    "temporarily unavailable",
    "network is unreachable",
    "connection refused",
    "timed out while",
    "no last agent message; wrote empty content",
];

pub const USAGE_LIMIT_PHRASES: [&str; 3] = [
    "you've hit your usage limit",
    "you have hit your usage limit",
    "codex/settings/usage",
];

const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(2);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn is_usage_limit(text: &str) -> bool {
    let lowered = text.to_lowercase();
    USAGE_LIMIT_PHRASES.iter().any(|p| lowered.contains(p))
}

/// Transient failures are retried; usage limits never are.
pub fn is_transient_failure(text: &str) -> bool {
    let lowered = text.to_lowercase();
    if USAGE_LIMIT_PHRASES.iter().any(|p| lowered.contains(p)) {
        return false;
    }
    TRANSIENT_RUNNER_PHRASES.iter().any(|p| lowered.contains(p))
}

/// True when the file holds a single valid JSON object.
pub fn output_has_json_object(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(text) => matches!(serde_json::from_str::<Value>(&text), Ok(Value::Object(_))),
        Err(_) => false,
    }
}

fn output_file_status(path: &Path) -> String {
    match fs::metadata(path) {
        Err(_) => format!("{} (missing)", path.display()),
        Ok(meta) => {
            let modified = meta
                .modified()
                .map(|t| iso_seconds(DateTime::<Utc>::from(t)))
                .unwrap_or_else(|_| "unknown".to_string());
            format!(
                "{} (exists; bytes={}; modified={})",
                path.display(),
                meta.len(),
                modified
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub command: &'a [String],
    pub output_path: &'a Path,
    pub timeout: Duration,
    pub stall_kill: Option<Duration>,
    pub progress_interval: Duration,
    /// Set on operator interrupt; the attempt is killed at the next poll.
    pub cancel: &'a AtomicBool,
}

/// Point-in-time view of a running attempt.
#[derive(Debug, Clone)]
pub struct LiveProgress<'a> {
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub elapsed: Duration,
    pub note: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    Exited(i32),
    TimedOut,
    Stalled,
    Cancelled,
    LaunchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub stdout: String,
    pub stderr: String,
}

impl AttemptOutcome {
    pub fn exited(code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            status: AttemptStatus::Exited(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn launch_failed(message: String) -> Self {
        Self {
            status: AttemptStatus::LaunchFailed(message),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Starts one attempt and blocks until it exits, times out, stalls, or is
/// cancelled.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        progress: &mut dyn FnMut(&LiveProgress<'_>),
    ) -> AttemptOutcome;
}

#[derive(Default)]
struct StreamBuffers {
    stdout: String,
    stderr: String,
}

struct StreamState {
    buffers: Mutex<StreamBuffers>,
    last_activity: Mutex<Instant>,
}

impl StreamState {
    fn new(start: Instant) -> Self {
        Self {
            buffers: Mutex::new(StreamBuffers::default()),
            last_activity: Mutex::new(start),
        }
    }

    fn last_activity(&self) -> Option<Instant> {
        self.last_activity.lock().ok().map(|at| *at)
    }

    fn snapshot(&self) -> (String, String) {
        match self.buffers.lock() {
            Ok(b) => (b.stdout.clone(), b.stderr.clone()),
            Err(_) => (String::new(), "[stream buffer lock poisoned]".to_string()),
        }
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

fn spawn_drain<R: Read + Send + 'static>(
    mut stream: R,
    kind: StreamKind,
    state: Arc<StreamState>,
    done_tx: mpsc::Sender<()>,
) {
    let label = match kind {
        StreamKind::Stdout => "reviewlab-drain-stdout",
        StreamKind::Stderr => "reviewlab-drain-stderr",
    };
    let spawned = thread::Builder::new().name(label.to_string()).spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    if let Ok(mut buffers) = state.buffers.lock() {
                        match kind {
                            StreamKind::Stdout => buffers.stdout.push_str(&chunk),
                            StreamKind::Stderr => buffers.stderr.push_str(&chunk),
                        }
                    }
                    if let Ok(mut at) = state.last_activity.lock() {
                        *at = Instant::now();
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if let Ok(mut buffers) = state.buffers.lock() {
                        buffers.stderr.push_str(&format!("\n[stream read error: {}]\n", err));
                    }
                    break;
                }
            }
        }
        let _ = done_tx.send(());
    });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to spawn stream drain thread");
    }
}

/// Tracks the output file's (size, mtime) signature to spot a silent hang.
struct StallTracker {
    signature: Option<(u64, u128)>,
    stable_since: Instant,
}

impl StallTracker {
    fn new(start: Instant) -> Self {
        Self {
            signature: None,
            stable_since: start,
        }
    }

    fn observe(&mut self, output_path: &Path, now: Instant, last_activity: Instant, threshold: Duration) -> bool {
        let current = fs::metadata(output_path).ok().map(|meta| {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis())
                .unwrap_or(0);
            (meta.len(), mtime)
        });
        if current != self.signature {
            self.signature = current;
            self.stable_since = now;
            return false;
        }
        now.duration_since(self.stable_since) >= threshold
            && now.duration_since(last_activity) >= threshold
    }
}

fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Streams a real subprocess: drains both pipes on background threads and
/// polls for exit, cancellation, the hard timeout and output inactivity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        progress: &mut dyn FnMut(&LiveProgress<'_>),
    ) -> AttemptOutcome {
        let Some((program, args)) = request.command.split_first() else {
            return AttemptOutcome::launch_failed("empty runner command".to_string());
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return AttemptOutcome::launch_failed(format!("{}: {}", program, err)),
        };

        let started = Instant::now();
        let state = Arc::new(StreamState::new(started));
        let (done_tx, done_rx) = mpsc::channel();
        let mut drains = 0usize;
        if let Some(stdout) = child.stdout.take() {
            spawn_drain(stdout, StreamKind::Stdout, state.clone(), done_tx.clone());
            drains += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(stderr, StreamKind::Stderr, state.clone(), done_tx.clone());
            drains += 1;
        }
        drop(done_tx);

        let poll = request.progress_interval.min(MAX_POLL_INTERVAL);
        let mut stall = StallTracker::new(started);
        let mut last_progress = started;
        let mut note: Option<String> = None;
        let status = loop {
            match child.try_wait() {
                Ok(Some(exit)) => break AttemptStatus::Exited(exit.code().unwrap_or(EXIT_INTERNAL_ERROR)),
                Ok(None) => {}
                Err(err) => {
                    terminate(&mut child);
                    break AttemptStatus::LaunchFailed(format!("failed to poll runner: {}", err));
                }
            }
            if request.cancel.load(Ordering::SeqCst) {
                note = Some("interrupted; runner terminated".to_string());
                terminate(&mut child);
                break AttemptStatus::Cancelled;
            }
            let now = Instant::now();
            if now.duration_since(started) >= request.timeout {
                note = Some(format!("timeout after {}s", request.timeout.as_secs()));
                terminate(&mut child);
                break AttemptStatus::TimedOut;
            }
            if let Some(threshold) = request.stall_kill {
                let last_activity = state.last_activity().unwrap_or(started);
                if stall.observe(request.output_path, now, last_activity, threshold) {
                    note = Some(format!(
                        "stall recovery triggered after {}s with stable output state",
                        threshold.as_secs()
                    ));
                    terminate(&mut child);
                    break AttemptStatus::Stalled;
                }
            }
            if now.duration_since(last_progress) >= request.progress_interval {
                let (stdout, stderr) = state.snapshot();
                progress(&LiveProgress {
                    stdout: &stdout,
                    stderr: &stderr,
                    elapsed: now.duration_since(started),
                    note: note.as_deref(),
                });
                last_progress = now;
            }
            thread::sleep(poll);
        };

        // A grandchild can keep a pipe open after the child dies; only wait briefly.
        let grace = if status == AttemptStatus::Cancelled {
            Duration::ZERO
        } else {
            STREAM_DRAIN_GRACE
        };
        let deadline = Instant::now() + grace;
        for _ in 0..drains {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if done_rx.recv_timeout(remaining).is_err() {
                debug!("stream drain did not finish before grace period");
                break;
            }
        }
        let (stdout, stderr) = state.snapshot();
        progress(&LiveProgress {
            stdout: &stdout,
            stderr: &stderr,
            elapsed: started.elapsed(),
            note: note.as_deref(),
        });
        AttemptOutcome {
            status,
            stdout,
            stderr,
        }
    }
}

/// Static configuration of one adapter, shared by every batch in a run.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub repo_root: PathBuf,
    pub reasoning_effort: String,
    pub timeout: Duration,
    pub stall_kill: Option<Duration>,
    pub max_retries: u32,
    pub retry_backoff_seconds: f64,
    pub live_log_interval: Duration,
}

impl AdapterSettings {
    pub fn from_policy(policy: &RunPolicy, repo_root: &Path, reasoning_effort: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            reasoning_effort: reasoning_effort.to_string(),
            timeout: policy.timeout(),
            stall_kill: policy.stall_kill(),
            max_retries: policy.max_retries,
            retry_backoff_seconds: policy.retry_backoff_seconds,
            live_log_interval: policy.live_log_interval(),
        }
    }
}

pub type SleepFn = dyn Fn(Duration) + Send + Sync;
pub type ClockFn = dyn Fn() -> DateTime<Utc> + Send + Sync;

/// Runs one batch through the agent CLI with retry, recovery, and a
/// per-batch log that always reflects the latest attempt.
#[derive(Clone)]
pub struct RunnerAdapter {
    settings: AdapterSettings,
    launcher: Arc<dyn Launcher>,
    sleep: Arc<SleepFn>,
    clock: Arc<ClockFn>,
}

impl RunnerAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            launcher: Arc::new(ProcessLauncher),
            sleep: Arc::new(thread::sleep),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_sleep(mut self, sleep: Arc<SleepFn>) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_clock(mut self, clock: Arc<ClockFn>) -> Self {
        self.clock = clock;
        self
    }

    fn backoff_delay(&self, attempt: u32) -> f64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.settings.retry_backoff_seconds.max(0.0) * (1u64 << shift) as f64
    }

    pub fn run(&self, prompt: &str, output_path: &Path, log_path: &Path) -> i32 {
        self.run_cancellable(prompt, output_path, log_path, &AtomicBool::new(false))
    }

    /// Like [`RunnerAdapter::run`], but a set `cancel` kills the running
    /// attempt and skips any remaining retries.
    pub fn run_cancellable(
        &self,
        prompt: &str,
        output_path: &Path,
        log_path: &Path,
        cancel: &AtomicBool,
    ) -> i32 {
        let command = codex_batch_command(
            prompt,
            &self.settings.repo_root,
            output_path,
            &self.settings.reasoning_effort,
        );
        let max_attempts = self.settings.max_retries.saturating_add(1);
        let mut sections: Vec<String> = Vec::new();

        for attempt in 1..=max_attempts {
            if cancel.load(Ordering::SeqCst) {
                sections.push(format!("INTERRUPTED before attempt {}/{}", attempt, max_attempts));
                write_log(log_path, &sections, None);
                return EXIT_INTERRUPTED;
            }
            let header = format!(
                "ATTEMPT {}/{}\n$ {}",
                attempt,
                max_attempts,
                shell_join(&command)
            );
            let started_at = iso_seconds((self.clock)());
            let request = LaunchRequest {
                command: &command,
                output_path,
                timeout: self.settings.timeout,
                stall_kill: self.settings.stall_kill,
                progress_interval: self.settings.live_log_interval,
                cancel,
            };
            let outcome = {
                let prefix = &sections;
                let mut write_live = |live: &LiveProgress<'_>| {
                    let snapshot = live_snapshot(&header, &started_at, output_path, live);
                    write_log(log_path, prefix, Some(&snapshot));
                };
                write_live(&LiveProgress {
                    stdout: "",
                    stderr: "",
                    elapsed: Duration::ZERO,
                    note: None,
                });
                self.launcher.launch(&request, &mut write_live)
            };

            let streams = format!("STDOUT:\n{}\n\nSTDERR:\n{}\n", outcome.stdout, outcome.stderr);
            match outcome.status {
                AttemptStatus::LaunchFailed(message) => {
                    sections.push(format!("{}\n\nRUNNER ERROR:\n{}\n", header, message));
                    write_log(log_path, &sections, None);
                    warn!(log = %log_path.display(), "runner launch failed");
                    return EXIT_LAUNCH_FAILED;
                }
                AttemptStatus::TimedOut => {
                    sections.push(format!(
                        "{}\n\nTIMEOUT after {}s\n\n{}",
                        header,
                        self.settings.timeout.as_secs(),
                        streams
                    ));
                    return self.finish_interrupted_attempt(output_path, log_path, sections, "timed-out");
                }
                AttemptStatus::Cancelled => {
                    sections.push(format!("{}\n\nINTERRUPTED; runner terminated.\n\n{}", header, streams));
                    write_log(log_path, &sections, None);
                    info!(log = %log_path.display(), "batch attempt interrupted");
                    return EXIT_INTERRUPTED;
                }
                AttemptStatus::Stalled => {
                    let threshold = self.settings.stall_kill.map(|d| d.as_secs()).unwrap_or(0);
                    sections.push(format!(
                        "{}\n\nSTALL RECOVERY after {}s of stable output and no stream activity.\n\n{}",
                        header, threshold, streams
                    ));
                    return self.finish_interrupted_attempt(output_path, log_path, sections, "stalled");
                }
                AttemptStatus::Exited(code) => {
                    sections.push(format!("{}\n\n{}", header, streams));
                    if code == 0 {
                        if !output_has_json_object(output_path) {
                            sections.push(
                                "Runner exited 0 but output file is missing or invalid; treating as execution failure."
                                    .to_string(),
                            );
                            write_log(log_path, &sections, None);
                            return EXIT_INTERNAL_ERROR;
                        }
                        write_log(log_path, &sections, None);
                        return 0;
                    }
                    let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
                    if !is_transient_failure(&combined) || attempt >= max_attempts {
                        write_log(log_path, &sections, None);
                        return code;
                    }
                    let delay = self.backoff_delay(attempt);
                    sections.push(format!(
                        "Transient runner failure detected; retrying in {:.1}s (attempt {}/{}).",
                        delay,
                        attempt + 1,
                        max_attempts
                    ));
                    write_log(log_path, &sections, None);
                    info!(attempt, delay_seconds = delay, "retrying transient runner failure");
                    if delay > 0.0 {
                        (self.sleep)(Duration::from_secs_f64(delay));
                    }
                }
            }
        }
        write_log(log_path, &sections, None);
        EXIT_INTERNAL_ERROR
    }

    fn finish_interrupted_attempt(
        &self,
        output_path: &Path,
        log_path: &Path,
        mut sections: Vec<String>,
        label: &str,
    ) -> i32 {
        if output_has_json_object(output_path) {
            sections.push(format!(
                "Recovered {} batch from JSON output file; continuing as success.",
                label
            ));
            write_log(log_path, &sections, None);
            return 0;
        }
        write_log(log_path, &sections, None);
        EXIT_TIMEOUT
    }
}

fn live_snapshot(header: &str, started_at: &str, output_path: &Path, live: &LiveProgress<'_>) -> String {
    let note = live
        .note
        .map(|n| format!("\nRUNNER NOTE: {}", n))
        .unwrap_or_default();
    format!(
        "{}\n\nSTATUS: running\nSTARTED AT: {}\nELAPSED: {}s\nOUTPUT FILE: {}{}\n\nSTDOUT (live):\n{}\n\nSTDERR (live):\n{}\n",
        header,
        started_at,
        live.elapsed.as_secs(),
        output_file_status(output_path),
        note,
        live.stdout,
        live.stderr
    )
}

fn write_log(log_path: &Path, sections: &[String], live: Option<&str>) {
    let mut parts: Vec<&str> = sections.iter().map(String::as_str).collect();
    if let Some(live) = live {
        parts.push(live);
    }
    if let Err(err) = atomic_write_bytes(log_path, parts.join("\n\n").as_bytes()) {
        warn!(log = %log_path.display(), error = %err, "failed to write batch log");
    }
}
