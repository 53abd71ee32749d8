use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use review_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, iso_seconds, run_stamp, sha256_file,
    state_layout, Packet, StateLayout,
};
use review_merge::{extract_payload, max_findings_for, merge, normalize, BatchResult, MergedResult};
use review_provenance::{
    import_review, parse_import_payload, write_packet_snapshot, AssessmentStore, BatchProvenance,
    ImportFlags, ImportOutcome, ProvenanceRoots,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

pub mod adapter;
pub mod failures;
pub mod ledger;
pub mod policy;
pub mod prompt;
pub mod scheduler;
pub mod selection;

pub use adapter::{
    AdapterSettings, AttemptOutcome, AttemptStatus, LaunchRequest, Launcher, LiveProgress,
    ProcessLauncher, RunnerAdapter, EXIT_INTERNAL_ERROR, EXIT_INTERRUPTED, EXIT_LAUNCH_FAILED,
    EXIT_TIMEOUT,
};
pub use failures::{classify_failure, retry_command, FailureCategory, FailureReport};
pub use ledger::{
    log_path, prompt_path, result_path, BatchLedger, BatchStatus, BatchTask, RunLog, RunSummary,
    LOGS_DIR, MERGED_OUTPUT_FILE, PROMPTS_DIR, RESULTS_DIR, RUN_LOG_FILE, RUN_SUMMARY_FILE,
};
pub use policy::{
    codex_batch_command, parse_reasoning_effort, reasoning_effort_from_env, PolicyError,
    PolicyInputs, RunPolicy, Runner, REASONING_EFFORT_ENV,
};
pub use prompt::render_batch_prompt;
pub use scheduler::{execute_batches, BatchTaskFn, Heartbeat, SchedulerEvent, SchedulerOptions};
pub use selection::{parse_selection, SelectionError};

const FULL_SWEEP_BATCH_NAME: &str = "full codebase sweep";
const INTERRUPT_REASON: &str = "keyboard_interrupt";
const STDOUT_MARKER: &str = "\nSTDOUT:\n";
const STDERR_MARKER: &str = "\n\nSTDERR:\n";

/// Anything that can run one batch prompt to an output file and report an
/// exit code. The production implementation is [`RunnerAdapter`].
pub trait BatchExecutor: Send + Sync {
    /// Returns the batch exit code. A set `cancel` should stop the batch.
    fn run(&self, prompt: &str, output_path: &Path, log_path: &Path, cancel: &AtomicBool) -> i32;
}

impl BatchExecutor for RunnerAdapter {
    fn run(&self, prompt: &str, output_path: &Path, log_path: &Path, cancel: &AtomicBool) -> i32 {
        self.run_cancellable(prompt, output_path, log_path, cancel)
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub state_dir: PathBuf,
    pub repo_root: PathBuf,
    pub packet_path: PathBuf,
    pub runner: Runner,
    pub policy: RunPolicy,
    /// 1-based CSV, or `None` for every batch.
    pub only_batches: Option<String>,
    pub dry_run: bool,
    pub allow_partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    DryRun,
    Completed,
    Partial,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub run_dir: PathBuf,
    pub summary_path: PathBuf,
    pub merged_path: Option<PathBuf>,
    /// 1-based.
    pub successful: Vec<usize>,
    /// 1-based.
    pub failed: Vec<usize>,
    pub failure_report: Option<FailureReport>,
    pub import: Option<ImportOutcome>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::DryRun | RunStatus::Completed | RunStatus::Partial => 0,
            RunStatus::Failed => 1,
            RunStatus::Interrupted => 130,
        }
    }
}

/// Everything one batch run needs, threaded explicitly through each phase.
struct RunContext {
    layout: StateLayout,
    stamp: String,
    created_at: String,
    runner: Runner,
    policy: RunPolicy,
    allow_partial: bool,
    packet: Packet,
    selected: Vec<usize>,
    immutable_packet: PathBuf,
    blind_packet: PathBuf,
    blind_sha256: String,
    run_dir: PathBuf,
    run_log: RunLog,
    ledger: BatchLedger,
}

impl RunContext {
    fn summary_path(&self) -> PathBuf {
        self.run_dir.join(RUN_SUMMARY_FILE)
    }

    fn summary(&self, successful: &[usize], failed: &[usize]) -> RunSummary {
        let parallel = self.policy.parallel;
        RunSummary {
            created_at: self.created_at.clone(),
            run_stamp: self.stamp.clone(),
            runner: self.runner.as_str().to_string(),
            parallel,
            selected_batches: one_based(&self.selected),
            successful_batches: one_based(successful),
            failed_batches: one_based(failed),
            allow_partial: self.allow_partial,
            max_parallel_batches: if parallel { self.policy.max_workers } else { 1 },
            batch_timeout_seconds: self.policy.timeout_seconds,
            batch_max_retries: self.policy.max_retries,
            batch_retry_backoff_seconds: self.policy.retry_backoff_seconds,
            batch_heartbeat_seconds: parallel.then_some(self.policy.heartbeat_seconds),
            batch_stall_warning_seconds: parallel.then_some(self.policy.stall_warning_seconds),
            batch_stall_kill_seconds: self.policy.stall_kill_seconds,
            immutable_packet: self.immutable_packet.display().to_string(),
            blind_packet: self.blind_packet.display().to_string(),
            run_dir: self.run_dir.display().to_string(),
            logs_dir: self.run_dir.join(LOGS_DIR).display().to_string(),
            run_log: self.run_log.path().display().to_string(),
            batches: self.ledger.to_summary_map(),
            interrupted: false,
            interruption_reason: None,
        }
    }

    fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.summary_path();
        summary.write(&path)?;
        self.run_log.note(&format!("run-summary {}", path.display()));
        Ok(path)
    }

    fn outcome(&self, status: RunStatus, successful: &[usize], failed: &[usize]) -> RunOutcome {
        RunOutcome {
            status,
            run_dir: self.run_dir.clone(),
            summary_path: self.summary_path(),
            merged_path: None,
            successful: one_based(successful),
            failed: one_based(failed),
            failure_report: None,
            import: None,
        }
    }

    fn handle_event(&mut self, event: &SchedulerEvent) {
        let total = self.selected.len();
        let now = iso_seconds(Utc::now());
        match event {
            SchedulerEvent::Queued { index, .. } => {
                self.ledger.set_status(*index, BatchStatus::Queued);
                self.run_log.note(&format!(
                    "batch-queued batch={} position={}/{}",
                    index + 1,
                    self.ledger.position(*index),
                    total
                ));
            }
            SchedulerEvent::Started { index, max_workers } => {
                self.ledger.mark_started(*index, &now);
                self.run_log.note(&format!(
                    "batch-start batch={} position={}/{} max_parallel={}",
                    index + 1,
                    self.ledger.position(*index),
                    total,
                    max_workers
                ));
            }
            SchedulerEvent::Done {
                index,
                code,
                elapsed_seconds,
            } => {
                self.ledger.mark_done(*index, *code, *elapsed_seconds, &now);
                self.run_log.note(&format!(
                    "batch-done batch={} position={}/{} code={} elapsed={}s",
                    index + 1,
                    self.ledger.position(*index),
                    total,
                    code,
                    elapsed_seconds
                ));
            }
            SchedulerEvent::Heartbeat(beat) => {
                let elapsed: Vec<String> = beat
                    .elapsed_seconds
                    .iter()
                    .map(|(idx, secs)| format!("{}:{}", idx + 1, secs))
                    .collect();
                self.run_log.note(&format!(
                    "heartbeat active={:?} queued={:?} elapsed={{{}}}",
                    one_based(&beat.active),
                    one_based(&beat.queued),
                    elapsed.join(", ")
                ));
            }
            SchedulerEvent::StallWarning {
                threshold_seconds,
                indexes,
            } => {
                warn!(threshold_seconds, batches = ?one_based(indexes), "batches exceeded stall warning threshold");
                self.run_log.note(&format!(
                    "stall-warning threshold={}s batches={:?}",
                    threshold_seconds,
                    one_based(indexes)
                ));
            }
            SchedulerEvent::ExecutionError { index, message } => {
                self.ledger.set_status(*index, BatchStatus::Failed);
                self.run_log.note(&format!(
                    "execution-error batch={} error={}",
                    index + 1,
                    message
                ));
            }
        }
    }
}

fn one_based(indexes: &[usize]) -> Vec<usize> {
    indexes.iter().map(|i| i + 1).collect()
}

/// The tail of a batch log that holds the agent's final stdout.
fn log_stdout_section(log_text: &str) -> &str {
    let Some(start) = log_text.rfind(STDOUT_MARKER) else {
        return log_text;
    };
    let tail = &log_text[start + STDOUT_MARKER.len()..];
    match tail.find(STDERR_MARKER) {
        Some(end) => &tail[..end],
        None => tail,
    }
}

fn parse_result_text(
    index: usize,
    raw: &str,
    allowed: &BTreeSet<String>,
    max_findings: usize,
) -> Result<(Map<String, Value>, BatchResult), String> {
    let payload = extract_payload(raw).map_err(|err| err.to_string())?;
    let result = normalize(index, &payload, allowed, max_findings).map_err(|err| err.to_string())?;
    Ok((payload, result))
}

/// Parse every selected batch's raw output. A batch whose raw file does not
/// parse is retried from the STDOUT section of its log, which also rewrites
/// the raw file. Returns the parsed results and the 0-based failed set.
pub fn collect_batch_results(
    run_dir: &Path,
    packet: &Packet,
    selected: &[usize],
    execution_failures: &BTreeSet<usize>,
) -> (Vec<BatchResult>, BTreeSet<usize>) {
    let allowed: BTreeSet<String> = packet.dimensions.iter().cloned().collect();
    let mut failures = execution_failures.clone();
    let mut results = Vec::new();

    for &index in selected {
        let max_findings = max_findings_for(
            packet
                .batches
                .get(index)
                .map(|b| b.dimensions.len())
                .unwrap_or(0),
        );
        let raw_path = result_path(run_dir, index);
        let from_raw = fs::read_to_string(&raw_path)
            .map_err(|err| err.to_string())
            .and_then(|raw| parse_result_text(index, &raw, &allowed, max_findings));

        let parsed = match from_raw {
            Ok((_, result)) => Some(result),
            Err(raw_err) => {
                let log = log_path(run_dir, index);
                let recovered = fs::read_to_string(&log)
                    .map_err(|err| err.to_string())
                    .and_then(|text| {
                        parse_result_text(index, log_stdout_section(&text), &allowed, max_findings)
                    });
                match recovered {
                    Ok((payload, result)) => {
                        let rewrite = serde_json::to_string_pretty(&Value::Object(payload))
                            .map_err(anyhow::Error::from)
                            .and_then(|text| atomic_write_bytes(&raw_path, format!("{}\n", text).as_bytes()));
                        if let Err(err) = rewrite {
                            warn!(batch = index + 1, error = %err, "failed to rewrite recovered batch output");
                        }
                        info!(batch = index + 1, "recovered batch output from log");
                        Some(result)
                    }
                    Err(log_err) => {
                        warn!(batch = index + 1, raw = %raw_err, log = %log_err, "batch output did not parse");
                        None
                    }
                }
            }
        };

        match parsed {
            Some(result) => {
                failures.remove(&index);
                results.push(result);
            }
            None => {
                failures.insert(index);
            }
        }
    }
    (results, failures)
}

fn strip_file_token(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == ',' || c == '\'' || c == '"').trim()
}

/// Unique cleaned `files_to_read` entries of the given batches, in order.
pub fn reviewed_files(packet: &Packet, indexes: &[usize]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for batch in indexes.iter().filter_map(|idx| packet.batches.get(*idx)) {
        for raw in &batch.files_to_read {
            let file = strip_file_token(raw);
            if file.is_empty() || file == "." || file == ".." || file.ends_with('/') {
                continue;
            }
            if seen.insert(file.to_string()) {
                out.push(file.to_string());
            }
        }
    }
    out
}

fn dedup_dimensions<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .map(str::trim)
        .filter(|d| !d.is_empty() && seen.insert(d.to_string()))
        .map(str::to_string)
        .collect()
}

fn scored_dimensions(packet: &Packet) -> Vec<String> {
    match packet.raw.get("scored_dimensions").and_then(Value::as_array) {
        Some(items) => dedup_dimensions(items.iter().filter_map(Value::as_str)),
        None => packet.dimensions.clone(),
    }
}

/// The merged import document: the merge plus provenance and coverage blocks.
pub fn merged_document(
    packet: &Packet,
    successful: &[usize],
    merged: &MergedResult,
    provenance: &BatchProvenance,
) -> Result<Value> {
    let Value::Object(mut doc) = serde_json::to_value(merged)? else {
        return Err(anyhow!("merged result did not serialize to an object"));
    };

    let files = reviewed_files(packet, successful);
    let full_sweep_included = successful
        .iter()
        .filter_map(|idx| packet.batches.get(*idx))
        .any(|b| b.name.trim().to_lowercase() == FULL_SWEEP_BATCH_NAME);
    let assessed: Vec<String> = dedup_dimensions(merged.assessments.keys().map(String::as_str));
    let imported = dedup_dimensions(
        assessed
            .iter()
            .map(String::as_str)
            .chain(merged.findings.iter().map(|f| f.dimension.as_str())),
    );

    let mut scope = Map::new();
    scope.insert("reviewed_files_count".into(), json!(files.len()));
    scope.insert("successful_batch_count".into(), json!(successful.len()));
    scope.insert("full_sweep_included".into(), json!(full_sweep_included));
    if let Some(total) = packet.raw.get("total_files").and_then(Value::as_u64) {
        if total > 0 {
            scope.insert("total_files".into(), json!(total));
        }
    }
    scope.insert("imported_dimensions".into(), json!(imported));
    doc.insert("review_scope".into(), Value::Object(scope));
    if !files.is_empty() {
        doc.insert("reviewed_files".into(), json!(files));
    }
    doc.insert("provenance".into(), serde_json::to_value(provenance)?);

    let scored = scored_dimensions(packet);
    let missing: Vec<&String> = scored.iter().filter(|d| !assessed.contains(d)).collect();
    doc.insert(
        "assessment_coverage".into(),
        json!({
            "scored_dimensions": scored,
            "selected_dimensions": packet.dimensions,
            "imported_dimensions": assessed,
            "missing_dimensions": missing,
        }),
    );
    Ok(Value::Object(doc))
}

fn trusted_import(
    layout: &StateLayout,
    store: &mut AssessmentStore,
    doc: &Value,
    label: String,
    allow_partial: bool,
    now: &str,
) -> Result<ImportOutcome> {
    let payload = parse_import_payload(doc)?;
    let flags = ImportFlags {
        trusted_source: true,
        trusted_label: Some(label),
        allow_partial,
        ..ImportFlags::default()
    };
    let roots = ProvenanceRoots {
        base_dir: &layout.root,
        default_blind: &layout.blind_packet,
    };
    import_review(store, &payload, &flags, roots, now)
}

fn prepare_context(request: &RunRequest, now: DateTime<Utc>) -> Result<RunContext> {
    let layout = state_layout(&request.state_dir);
    let packet = Packet::load(&request.packet_path)?;
    let selected = parse_selection(request.only_batches.as_deref(), packet.batch_count())?;

    let stamp = run_stamp(now);
    let snapshot = write_packet_snapshot(&layout, &packet.raw, &stamp)?;
    let run_dir = layout.run_dir(&stamp);
    for sub in [PROMPTS_DIR, RESULTS_DIR, LOGS_DIR] {
        ensure_dir(&run_dir.join(sub))?;
    }
    let run_log = RunLog::open(&run_dir.join(RUN_LOG_FILE))?;
    let ledger = BatchLedger::new(&run_dir, &selected);

    Ok(RunContext {
        created_at: iso_seconds(now),
        runner: request.runner,
        policy: request.policy.clone(),
        allow_partial: request.allow_partial,
        immutable_packet: snapshot.immutable_path,
        blind_packet: snapshot.blind_path,
        blind_sha256: snapshot.blind_sha256,
        layout,
        stamp,
        packet,
        selected,
        run_dir,
        run_log,
        ledger,
    })
}

/// Execute the selected batches of a packet, then merge and import the
/// successful results.
pub fn run_batches(
    request: &RunRequest,
    executor: Arc<dyn BatchExecutor>,
    cancel: Arc<AtomicBool>,
    now: DateTime<Utc>,
) -> Result<RunOutcome> {
    if !request.runner.supports_local_batches() {
        bail!(
            "runner '{}' cannot execute batches locally; use `reviewlab session start --runner {}`",
            request.runner,
            request.runner
        );
    }

    let layout = state_layout(&request.state_dir);
    let mut store = AssessmentStore::open(&layout.state_file)?;
    let expired = store.expire_provisional(&iso_seconds(now));
    if expired > 0 {
        store.save()?;
        info!(expired, "expired provisional manual-override assessments");
    }

    let mut ctx = prepare_context(request, now)?;
    let mut prompts = BTreeMap::new();
    for &index in &ctx.selected {
        let batch = ctx
            .packet
            .batches
            .get(index)
            .ok_or_else(|| anyhow!("batch index {} missing from packet", index + 1))?;
        let text = render_batch_prompt(&request.repo_root, &ctx.blind_packet, index, batch);
        atomic_write_bytes(&prompt_path(&ctx.run_dir, index), text.as_bytes())?;
        prompts.insert(index, text);
    }

    let total = ctx.selected.len();
    let max_workers = ctx.policy.max_parallel_workers(total);
    ctx.run_log.append(&format!(
        "run-start runner={} parallel={} max_parallel={} timeout={}s heartbeat={:.1}s stall_warning={}s stall_kill={}s retries={} retry_backoff={:.1}s upper_bound={}m selected={:?}",
        ctx.runner,
        ctx.policy.parallel,
        max_workers,
        ctx.policy.timeout_seconds,
        ctx.policy.heartbeat_seconds,
        ctx.policy.stall_warning_seconds,
        ctx.policy.stall_kill_seconds,
        ctx.policy.max_retries,
        ctx.policy.retry_backoff_seconds,
        ctx.policy.worst_case_minutes(total),
        one_based(&ctx.selected)
    ))?;
    ctx.run_log.note(&format!("run-path {}", ctx.run_dir.display()));
    ctx.run_log.note(&format!("packet {}", ctx.immutable_packet.display()));
    ctx.run_log.note(&format!("blind-packet {}", ctx.blind_packet.display()));
    info!(run_dir = %ctx.run_dir.display(), batches = total, "batch run prepared");

    if request.dry_run {
        ctx.write_summary(&ctx.summary(&[], &[]))?;
        ctx.run_log.note("run-finished dry-run");
        return Ok(ctx.outcome(RunStatus::DryRun, &[], &[]));
    }

    let mut tasks: BTreeMap<usize, BatchTaskFn> = BTreeMap::new();
    for (index, prompt) in prompts {
        let executor = Arc::clone(&executor);
        let cancel = Arc::clone(&cancel);
        let output = result_path(&ctx.run_dir, index);
        let log = log_path(&ctx.run_dir, index);
        tasks.insert(
            index,
            Box::new(move || Ok(executor.run(&prompt, &output, &log, &cancel))),
        );
    }
    let options = SchedulerOptions {
        parallel: ctx.policy.parallel,
        max_workers,
        heartbeat: ctx.policy.heartbeat(),
        stall_warning_seconds: ctx.policy.stall_warning_seconds,
    };
    let schedule = execute_batches(tasks, &options, cancel, &mut |event: &SchedulerEvent| {
        ctx.handle_event(event)
    })?;

    if schedule.interrupted {
        ctx.ledger.interrupt_unfinished();
        let mut summary = ctx.summary(&[], &[]);
        summary.interrupted = true;
        summary.interruption_reason = Some(INTERRUPT_REASON.to_string());
        ctx.write_summary(&summary)?;
        ctx.run_log
            .note(&format!("run-interrupted reason={}", INTERRUPT_REASON));
        warn!(run_dir = %ctx.run_dir.display(), "batch run interrupted");
        return Ok(ctx.outcome(RunStatus::Interrupted, &[], &schedule.failed));
    }

    let execution_failures: BTreeSet<usize> = schedule.failed.iter().copied().collect();
    let (results, failures) =
        collect_batch_results(&ctx.run_dir, &ctx.packet, &ctx.selected, &execution_failures);
    let selected = ctx.selected.clone();
    for &index in &selected {
        let status = if !failures.contains(&index) {
            BatchStatus::Succeeded
        } else if execution_failures.contains(&index) {
            BatchStatus::Failed
        } else if !result_path(&ctx.run_dir, index).exists() {
            BatchStatus::MissingOutput
        } else {
            BatchStatus::ParseFailed
        };
        ctx.ledger.set_status(index, status);
    }
    let mut successful: Vec<usize> = selected
        .iter()
        .copied()
        .filter(|idx| !failures.contains(idx))
        .collect();
    successful.sort_unstable();
    let failed: Vec<usize> = failures.iter().copied().collect();
    let summary_path = ctx.write_summary(&ctx.summary(&successful, &failed))?;

    let mut report = None;
    if !failed.is_empty() {
        let built = FailureReport::build(&failed, &ctx.immutable_packet, &ctx.run_dir);
        if !ctx.allow_partial || results.is_empty() {
            ctx.run_log.note(&format!(
                "run-finished failures={:?} mode=exit",
                one_based(&failed)
            ));
            let mut outcome = ctx.outcome(RunStatus::Failed, &successful, &failed);
            outcome.failure_report = Some(built);
            return Ok(outcome);
        }
        ctx.run_log.note(&format!(
            "run-partial successful={:?} failed={:?}",
            one_based(&successful),
            one_based(&failed)
        ));
        report = Some(built);
    }

    let merged = merge(&results);
    let provenance = BatchProvenance::for_batch_run(
        ctx.runner.as_str(),
        &ctx.stamp,
        &ctx.created_at,
        &successful,
        &ctx.blind_packet,
        &ctx.blind_sha256,
    );
    let doc = merged_document(&ctx.packet, &successful, &merged, &provenance)?;
    let merged_path = ctx.run_dir.join(MERGED_OUTPUT_FILE);
    atomic_write_json_pretty(&merged_path, &doc)?;

    let imported = trusted_import(
        &ctx.layout,
        &mut store,
        &doc,
        "trusted internal run-batches import".to_string(),
        ctx.allow_partial,
        &iso_seconds(Utc::now()),
    );
    let import = match imported {
        Ok(import) => import,
        Err(err) => {
            ctx.run_log
                .note(&format!("run-finished import-error error={}", err));
            return Err(err.context("failed to import merged batch results"));
        }
    };
    ctx.run_log.note(&format!(
        "run-finished successful={:?} failed={:?} imported={}",
        one_based(&successful),
        one_based(&failed),
        merged_path.display()
    ));

    Ok(RunOutcome {
        status: if failed.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        },
        run_dir: ctx.run_dir.clone(),
        summary_path,
        merged_path: Some(merged_path),
        successful: one_based(&successful),
        failed: one_based(&failed),
        failure_report: report,
        import: Some(import),
    })
}

/// Re-merge and re-import a finished run from its artifacts without
/// executing any agent.
pub fn replay_run(
    run_dir: &Path,
    state_dir: &Path,
    allow_partial: bool,
    now: DateTime<Utc>,
) -> Result<RunOutcome> {
    if !run_dir.is_dir() {
        bail!("run directory not found: {}", run_dir.display());
    }
    let summary_path = run_dir.join(RUN_SUMMARY_FILE);
    if !summary_path.exists() {
        bail!("run summary not found: {}", summary_path.display());
    }
    let summary = RunSummary::load(&summary_path)?;
    let successful: Vec<usize> = summary
        .successful_batches
        .iter()
        .filter(|i| **i > 0)
        .map(|i| i - 1)
        .collect();
    if successful.is_empty() {
        bail!("run has no successful batches to replay: {}", run_dir.display());
    }
    let blind_packet = PathBuf::from(&summary.blind_packet);
    if !blind_packet.exists() {
        bail!("blind packet not found: {}", blind_packet.display());
    }
    let packet = Packet::load(Path::new(&summary.immutable_packet))
        .context("failed to load immutable packet for replay")?;
    let missing: Vec<String> = successful
        .iter()
        .map(|idx| result_path(run_dir, *idx))
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if !missing.is_empty() {
        bail!("result files missing for replay: {}", missing.join(", "));
    }

    let (results, failures) = collect_batch_results(run_dir, &packet, &successful, &BTreeSet::new());
    if results.is_empty() {
        bail!("no batch results could be parsed from {}", run_dir.display());
    }
    let parsed: Vec<usize> = successful
        .iter()
        .copied()
        .filter(|idx| !failures.contains(idx))
        .collect();
    let failed: Vec<usize> = failures.iter().copied().collect();
    if !failed.is_empty() && !allow_partial {
        let mut outcome = RunOutcome {
            status: RunStatus::Failed,
            run_dir: run_dir.to_path_buf(),
            summary_path,
            merged_path: None,
            successful: one_based(&parsed),
            failed: one_based(&failed),
            failure_report: None,
            import: None,
        };
        outcome.failure_report = Some(FailureReport::build(
            &failed,
            Path::new(&summary.immutable_packet),
            run_dir,
        ));
        return Ok(outcome);
    }

    let merged = merge(&results);
    let provenance = BatchProvenance::for_batch_run(
        &summary.runner,
        &summary.run_stamp,
        &summary.created_at,
        &parsed,
        &blind_packet,
        &sha256_file(&blind_packet)?,
    );
    let doc = merged_document(&packet, &parsed, &merged, &provenance)?;
    let merged_path = run_dir.join(MERGED_OUTPUT_FILE);
    atomic_write_json_pretty(&merged_path, &doc)?;

    let layout = state_layout(state_dir);
    let mut store = AssessmentStore::open(&layout.state_file)?;
    let dir_name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| run_dir.display().to_string());
    let import = trusted_import(
        &layout,
        &mut store,
        &doc,
        format!("trusted import-run replay from {}", dir_name),
        allow_partial,
        &iso_seconds(now),
    )?;
    info!(run_dir = %run_dir.display(), batches = parsed.len(), "replayed batch run");

    Ok(RunOutcome {
        status: if failed.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        },
        run_dir: run_dir.to_path_buf(),
        summary_path,
        merged_path: Some(merged_path),
        successful: one_based(&parsed),
        failed: one_based(&failed),
        failure_report: None,
        import: Some(import),
    })
}
