use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use review_core::{iso_seconds, read_json_object, state_layout};
use review_provenance::{
    import_review, load_session, parse_import_payload, start_session, submit_command,
    submit_session, AssessmentStore, ImportFlags, ImportMode, ImportOutcome, ProvenanceRoots,
    SessionOptions,
};
use review_runner::{
    reasoning_effort_from_env, replay_run, run_batches, AdapterSettings, PolicyInputs, RunOutcome,
    RunPolicy, RunRequest, Runner, RunnerAdapter,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "REVIEWLAB_LOG";

#[derive(Parser)]
#[command(name = "reviewlab", version = "0.3.0", about = "Blind review batch orchestration")]
struct Cli {
    /// Directory holding state.json, review packets and run artifacts.
    #[arg(long, global = true, default_value = ".reviewlab")]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run review batches through the local runner, then merge and import")]
    RunBatches {
        #[arg(long)]
        packet: PathBuf,
        #[arg(long, default_value = ".")]
        repo_root: PathBuf,
        #[arg(long, default_value = "codex")]
        runner: String,
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        max_parallel_batches: Option<usize>,
        #[arg(long)]
        batch_heartbeat_seconds: Option<f64>,
        #[arg(long)]
        batch_timeout_seconds: Option<u64>,
        #[arg(long)]
        batch_max_retries: Option<u32>,
        #[arg(long)]
        batch_retry_backoff_seconds: Option<f64>,
        #[arg(long)]
        batch_stall_warning_seconds: Option<u64>,
        #[arg(long)]
        batch_stall_kill_seconds: Option<u64>,
        /// 1-based CSV of batch indexes.
        #[arg(long)]
        only_batches: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        allow_partial: bool,
    },
    #[command(about = "Re-merge and re-import a finished run directory")]
    ImportRun {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        allow_partial: bool,
    },
    #[command(about = "Import a review result file through the trust gate")]
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        attested_external: bool,
        #[arg(long)]
        manual_override: bool,
        #[arg(long)]
        attest: Option<String>,
        #[arg(long)]
        allow_partial: bool,
        #[arg(long)]
        import_mode: Option<String>,
    },
    #[command(subcommand, about = "External blind review sessions")]
    Session(SessionCommands),
    #[command(about = "Reset provisional manual-override assessments")]
    ExpireProvisional,
}

#[derive(Subcommand)]
enum SessionCommands {
    Start {
        #[arg(long)]
        packet: PathBuf,
        #[arg(long, default_value = "claude")]
        runner: String,
        #[arg(long, default_value_t = 24)]
        ttl_hours: i64,
    },
    Submit {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        file: PathBuf,
    },
    Show {
        #[arg(long)]
        session_id: String,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run_command(cli.state_dir, cli.command) {
        Ok((payload, code)) => {
            emit_json(&payload);
            ExitCode::from(exit_status(code))
        }
        Err(err) => {
            emit_json(&json_error("command_failed", format!("{:#}", err)));
            ExitCode::FAILURE
        }
    }
}

/// Codes outside 0..=255 collapse to a generic failure.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn install_interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    if let Err(err) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
        warn!(error = %err, "failed to install interrupt handler");
    }
    flag
}

fn run_command(state_dir: PathBuf, command: Commands) -> Result<(Value, i32)> {
    match command {
        Commands::RunBatches {
            packet,
            repo_root,
            runner,
            parallel,
            max_parallel_batches,
            batch_heartbeat_seconds,
            batch_timeout_seconds,
            batch_max_retries,
            batch_retry_backoff_seconds,
            batch_stall_warning_seconds,
            batch_stall_kill_seconds,
            only_batches,
            dry_run,
            allow_partial,
        } => {
            let runner = Runner::parse(&runner)?;
            let policy = RunPolicy::resolve(&PolicyInputs {
                parallel,
                max_parallel_batches,
                heartbeat_seconds: batch_heartbeat_seconds,
                timeout_seconds: batch_timeout_seconds,
                max_retries: batch_max_retries,
                retry_backoff_seconds: batch_retry_backoff_seconds,
                stall_warning_seconds: batch_stall_warning_seconds,
                stall_kill_seconds: batch_stall_kill_seconds,
            })?;
            let repo_root = repo_root
                .canonicalize()
                .with_context(|| format!("repo root not found: {}", repo_root.display()))?;
            let adapter = RunnerAdapter::new(AdapterSettings::from_policy(
                &policy,
                &repo_root,
                reasoning_effort_from_env(),
            ));
            let request = RunRequest {
                state_dir,
                repo_root,
                packet_path: packet,
                runner,
                policy,
                only_batches,
                dry_run,
                allow_partial,
            };
            let outcome = run_batches(
                &request,
                Arc::new(adapter),
                install_interrupt_flag(),
                Utc::now(),
            )?;
            Ok(run_outcome_payload("run-batches", &outcome))
        }
        Commands::ImportRun {
            run_dir,
            allow_partial,
        } => {
            let outcome = replay_run(&run_dir, &state_dir, allow_partial, Utc::now())?;
            Ok(run_outcome_payload("import-run", &outcome))
        }
        Commands::Import {
            file,
            attested_external,
            manual_override,
            attest,
            allow_partial,
            import_mode,
        } => {
            let mode = ImportMode::parse(import_mode.as_deref())?;
            let flags = ImportFlags {
                attested_external,
                manual_override,
                attest,
                allow_partial,
                ..ImportFlags::default()
            }
            .with_mode(mode)?;
            let raw = read_json_object(&file, "import file")?;
            let payload = parse_import_payload(&Value::Object(raw))?;
            let layout = state_layout(&state_dir);
            let mut store = AssessmentStore::open(&layout.state_file)?;
            let roots = ProvenanceRoots {
                base_dir: &layout.root,
                default_blind: &layout.blind_packet,
            };
            let outcome = import_review(
                &mut store,
                &payload,
                &flags,
                roots,
                &iso_seconds(Utc::now()),
            )?;
            Ok((
                json!({"ok": true, "command": "import", "import": import_to_json(&outcome)}),
                0,
            ))
        }
        Commands::Session(SessionCommands::Start {
            packet,
            runner,
            ttl_hours,
        }) => {
            let layout = state_layout(&state_dir);
            let raw = read_json_object(&packet, "review packet")?;
            let options = SessionOptions { runner, ttl_hours };
            let session = start_session(&layout, &Value::Object(raw), &options, Utc::now())?;
            Ok((
                json!({
                    "ok": true,
                    "command": "session-start",
                    "submit_command": submit_command(&session),
                    "session": session,
                }),
                0,
            ))
        }
        Commands::Session(SessionCommands::Submit { session_id, file }) => {
            let layout = state_layout(&state_dir);
            let mut store = AssessmentStore::open(&layout.state_file)?;
            let outcome = submit_session(&layout, &session_id, &file, &mut store, Utc::now())?;
            Ok((
                json!({
                    "ok": true,
                    "command": "session-submit",
                    "session": outcome.session,
                    "canonical_path": outcome.canonical_path.display().to_string(),
                    "import": import_to_json(&outcome.import),
                }),
                0,
            ))
        }
        Commands::Session(SessionCommands::Show { session_id }) => {
            let layout = state_layout(&state_dir);
            let (path, session) = load_session(&layout, &session_id)?;
            Ok((
                json!({
                    "ok": true,
                    "command": "session-show",
                    "path": path.display().to_string(),
                    "session": session,
                }),
                0,
            ))
        }
        Commands::ExpireProvisional => {
            let layout = state_layout(&state_dir);
            let mut store = AssessmentStore::open(&layout.state_file)?;
            let expired = store.expire_provisional(&iso_seconds(Utc::now()));
            if expired > 0 {
                store.save()?;
            }
            Ok((
                json!({"ok": true, "command": "expire-provisional", "expired": expired}),
                0,
            ))
        }
    }
}

fn run_outcome_payload(command: &str, outcome: &RunOutcome) -> (Value, i32) {
    if let Some(report) = &outcome.failure_report {
        eprint!("{}", report);
    }
    let code = outcome.exit_code();
    let payload = json!({
        "ok": code == 0,
        "command": command,
        "status": format!("{:?}", outcome.status).to_lowercase(),
        "run_dir": outcome.run_dir.display().to_string(),
        "summary_path": outcome.summary_path.display().to_string(),
        "merged_path": outcome.merged_path.as_ref().map(|p| p.display().to_string()),
        "successful_batches": outcome.successful,
        "failed_batches": outcome.failed,
        "failure_report": outcome.failure_report,
        "import": outcome.import.as_ref().map(import_to_json),
    });
    (payload, code)
}

fn import_to_json(outcome: &ImportOutcome) -> Value {
    json!({
        "policy": outcome.policy,
        "assessments_applied": outcome.counts.assessments,
        "findings_new": outcome.counts.findings_new,
        "findings_updated": outcome.counts.findings_updated,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_runner::RunStatus;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "reviewlab_cli_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn run_batches_flags_parse_into_policy_inputs() {
        let cli = Cli::try_parse_from([
            "reviewlab",
            "--state-dir",
            "/tmp/state",
            "run-batches",
            "--packet",
            "p.json",
            "--parallel",
            "--max-parallel-batches",
            "2",
            "--only-batches",
            "1,3",
            "--allow-partial",
        ])
        .expect("parse");
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/state"));
        match cli.command {
            Commands::RunBatches {
                parallel,
                max_parallel_batches,
                only_batches,
                allow_partial,
                runner,
                ..
            } => {
                assert!(parallel && allow_partial);
                assert_eq!(max_parallel_batches, Some(2));
                assert_eq!(only_batches.as_deref(), Some("1,3"));
                assert_eq!(runner, "codex");
            }
            _ => panic!("expected run-batches"),
        }
    }

    #[test]
    fn session_subcommands_parse() {
        let cli = Cli::try_parse_from([
            "reviewlab",
            "session",
            "submit",
            "--session-id",
            "ext_20260101_000000_abcdef12",
            "--file",
            "out.json",
        ])
        .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Session(SessionCommands::Submit { .. })
        ));
    }

    #[test]
    fn session_instructions_submit_command_parses() {
        let state_dir = temp_dir("instructions");
        let layout = state_layout(&state_dir);
        let packet = json!({
            "dimensions": ["naming"],
            "investigation_batches": [{"name": "A", "dimensions": ["naming"]}]
        });
        let session = start_session(&layout, &packet, &SessionOptions::default(), Utc::now())
            .expect("start");
        let command = submit_command(&session);
        let cli = Cli::try_parse_from(command.split_whitespace()).expect("parse instructions");
        match cli.command {
            Commands::Session(SessionCommands::Submit { session_id, file }) => {
                assert_eq!(session_id, session.session_id);
                assert_eq!(file, PathBuf::from(&session.expected_output_path));
            }
            _ => panic!("expected session submit"),
        }
        let _ = fs::remove_dir_all(state_dir);
    }

    #[test]
    fn trusted_internal_import_mode_is_rejected_from_the_cli() {
        let state_dir = temp_dir("reserved");
        fs::create_dir_all(&state_dir).expect("mkdir");
        let file = state_dir.join("import.json");
        fs::write(&file, r#"{"assessments": {"naming": 80}, "findings": []}"#).expect("write");
        let err = run_command(
            state_dir.clone(),
            Commands::Import {
                file,
                attested_external: false,
                manual_override: false,
                attest: None,
                allow_partial: false,
                import_mode: Some("trusted-internal".to_string()),
            },
        )
        .expect_err("reserved mode");
        assert!(err.to_string().contains("reserved"));
        let _ = fs::remove_dir_all(state_dir);
    }

    #[test]
    fn expire_provisional_reports_zero_on_empty_state() {
        let state_dir = temp_dir("expire");
        let (payload, code) =
            run_command(state_dir.clone(), Commands::ExpireProvisional).expect("expire");
        assert_eq!(code, 0);
        assert_eq!(payload["expired"], json!(0));
        let _ = fs::remove_dir_all(state_dir);
    }

    #[test]
    fn interrupted_outcome_maps_to_exit_130() {
        let outcome = RunOutcome {
            status: RunStatus::Interrupted,
            run_dir: PathBuf::from("/runs/x"),
            summary_path: PathBuf::from("/runs/x/run_summary.json"),
            merged_path: None,
            successful: Vec::new(),
            failed: Vec::new(),
            failure_report: None,
            import: None,
        };
        let (payload, code) = run_outcome_payload("run-batches", &outcome);
        assert_eq!(code, 130);
        assert_eq!(payload["status"], "interrupted");
        assert_eq!(payload["ok"], json!(false));
    }

    #[test]
    fn exit_status_keeps_small_codes_and_clamps_the_rest() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(130), 130);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(300), 1);
    }
}
