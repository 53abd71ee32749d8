use crate::blind::write_blind_packet;
use crate::import::{import_review, parse_import_payload, ImportOutcome, ProvenanceRoots};
use crate::provenance::{BatchProvenance, BLIND_PROVENANCE_KIND};
use crate::store::AssessmentStore;
use crate::trust::{ImportFlags, ATTESTED_EXTERNAL_ATTEST_EXAMPLE};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use review_core::{
    atomic_write_bytes, atomic_write_json_pretty, iso_seconds, parse_iso, read_json_object,
    run_stamp, sha256_file, StateLayout,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const EXTERNAL_SUPPORTED_RUNNERS: [&str; 1] = ["claude"];
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
    #[error("unsupported external runner '{0}'. Supported: claude")]
    UnsupportedRunner(String),
    #[error("session ttl must be > 0 hours (got {0})")]
    InvalidTtl(i64),
    #[error("session id mismatch in session file (expected {expected}, found {found})")]
    FileIdMismatch { expected: String, found: String },
    #[error("session is not open (status={0})")]
    NotOpen(String),
    #[error("session metadata is missing/invalid expires_at")]
    MissingExpiry,
    #[error("session expired at {0}")]
    Expired(String),
    #[error("external reviewer payload must include a top-level `session` object")]
    MissingSessionBlock,
    #[error("session id/token mismatch in external reviewer payload")]
    TokenMismatch,
    #[error("blind packet changed since the session was started")]
    PacketHashMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Submitted,
    Expired,
}

impl SessionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Submitted => "submitted",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    pub runner: String,
    pub created_at: String,
    pub expires_at: String,
    pub ttl_hours: i64,
    pub token: String,
    pub attest: String,
    pub packet_path: String,
    pub blind_packet_path: String,
    pub packet_sha256: String,
    pub template_path: String,
    pub launch_prompt_path: String,
    pub instructions_path: String,
    pub expected_output_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_input_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_canonical_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub runner: String,
    pub ttl_hours: i64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            runner: "claude".to_string(),
            ttl_hours: DEFAULT_SESSION_TTL_HOURS,
        }
    }
}

pub fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() || ["/", "\\", ".."].iter().any(|part| trimmed.contains(part)) {
        return Err(SessionError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

pub fn session_dir(layout: &StateLayout, session_id: &str) -> PathBuf {
    layout.sessions_dir.join(session_id)
}

fn new_session_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("ext_{}_{}", run_stamp(now), &suffix[..8])
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn template_payload(dimensions: &[String], session_id: &str, token: &str) -> Value {
    let assessments: Map<String, Value> = dimensions
        .iter()
        .map(|d| (d.clone(), json!(0)))
        .collect();
    json!({
        "session": {"id": session_id, "token": token},
        "assessments": assessments,
        "dimension_notes": {},
        "findings": [],
    })
}

fn launch_prompt(session: &Session) -> String {
    [
        "# Blind Reviewer Launch Prompt".to_string(),
        String::new(),
        "You are an isolated blind reviewer. Do not use prior chat context, prior score history, or target-score anchoring.".to_string(),
        String::new(),
        format!("Blind packet: {}", session.blind_packet_path),
        format!("Template JSON: {}", session.template_path),
        format!("Output JSON path: {}", session.expected_output_path),
        String::new(),
        "Requirements:".to_string(),
        "1. Read ONLY the blind packet and repository code.".to_string(),
        "2. Start from the template JSON so `session.id` and `session.token` are preserved.".to_string(),
        format!("3. Keep `session.id` exactly `{}`.", session.session_id),
        format!("4. Keep `session.token` exactly `{}`.", session.token),
        "5. Output must be valid JSON with top-level keys: session, assessments, dimension_notes, findings.".to_string(),
        "6. Every finding must include: dimension, identifier, summary, impact_scope, fix_scope, related_files, evidence, suggestion, confidence.".to_string(),
        "7. Do not include provenance metadata (it is injected on submit).".to_string(),
        "8. Return JSON only (no markdown fences).".to_string(),
    ]
    .join("\n")
}

/// The CLI invocation that submits the reviewer's output for `session`.
pub fn submit_command(session: &Session) -> String {
    format!(
        "reviewlab session submit --session-id {} --file {}",
        session.session_id, session.expected_output_path
    )
}

fn reviewer_instructions(session: &Session) -> String {
    [
        "# External Blind Review Session".to_string(),
        String::new(),
        format!("Session id: {}", session.session_id),
        format!("Session token: {}", session.token),
        format!("Session expires: {}", session.expires_at),
        format!("Blind packet: {}", session.blind_packet_path),
        format!("Template output: {}", session.template_path),
        format!("Launch prompt: {}", session.launch_prompt_path),
        format!("Expected reviewer output: {}", session.expected_output_path),
        String::new(),
        "Happy path:".to_string(),
        "1. Paste the launch prompt into a context-isolated reviewer task.".to_string(),
        "2. Reviewer writes JSON output to the expected reviewer output path.".to_string(),
        format!("3. Submit with `{}`.", submit_command(session)),
        String::new(),
        "Reviewer output requirements:".to_string(),
        "1. Return JSON with top-level keys: session, assessments, dimension_notes, findings.".to_string(),
        format!("2. session.id must be `{}`.", session.session_id),
        format!("3. session.token must be `{}`.", session.token),
        "4. Use the blind packet only (no score targets or prior context).".to_string(),
    ]
    .join("\n")
}

fn write_session(path: &Path, session: &Session) -> Result<()> {
    atomic_write_json_pretty(path, &serde_json::to_value(session)?)
}

/// Open an external review session: snapshot the packet, hash the blind copy
/// and write the reviewer-facing artifacts.
pub fn start_session(
    layout: &StateLayout,
    packet: &Value,
    options: &SessionOptions,
    now: DateTime<Utc>,
) -> Result<Session> {
    let runner = options.runner.trim().to_ascii_lowercase();
    if !EXTERNAL_SUPPORTED_RUNNERS.contains(&runner.as_str()) {
        return Err(SessionError::UnsupportedRunner(runner).into());
    }
    if options.ttl_hours <= 0 {
        return Err(SessionError::InvalidTtl(options.ttl_hours).into());
    }

    let session_id = new_session_id(now);
    let token = new_token();
    let dir = session_dir(layout, &session_id);
    let stamp = run_stamp(now);

    let immutable_path = layout.immutable_packet_path(&stamp);
    atomic_write_json_pretty(&immutable_path, packet)?;
    let blind_path = dir.join(review_core::BLIND_PACKET_FILE);
    let packet_sha256 = write_blind_packet(packet, &blind_path)?;

    let dimensions: Vec<String> = packet
        .get("dimensions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let session = Session {
        session_id: session_id.clone(),
        status: SessionStatus::Open,
        runner,
        created_at: iso_seconds(now),
        expires_at: iso_seconds(now + Duration::hours(options.ttl_hours)),
        ttl_hours: options.ttl_hours,
        token: token.clone(),
        attest: ATTESTED_EXTERNAL_ATTEST_EXAMPLE.to_string(),
        packet_path: immutable_path.display().to_string(),
        blind_packet_path: blind_path.display().to_string(),
        packet_sha256,
        template_path: dir.join("review_result.template.json").display().to_string(),
        launch_prompt_path: dir.join("claude_launch_prompt.md").display().to_string(),
        instructions_path: dir.join("reviewer_instructions.md").display().to_string(),
        expected_output_path: dir.join("review_result.json").display().to_string(),
        submitted_at: None,
        submitted_input_file: None,
        submitted_canonical_file: None,
    };

    write_session(&dir.join(SESSION_FILE), &session)?;
    atomic_write_json_pretty(
        Path::new(&session.template_path),
        &template_payload(&dimensions, &session_id, &token),
    )?;
    atomic_write_bytes(
        Path::new(&session.launch_prompt_path),
        format!("{}\n", launch_prompt(&session)).as_bytes(),
    )?;
    atomic_write_bytes(
        Path::new(&session.instructions_path),
        format!("{}\n", reviewer_instructions(&session)).as_bytes(),
    )?;
    info!(session_id = %session.session_id, expires_at = %session.expires_at, "external review session started");
    Ok(session)
}

pub fn load_session(layout: &StateLayout, session_id: &str) -> Result<(PathBuf, Session)> {
    validate_session_id(session_id)?;
    let path = session_dir(layout, session_id).join(SESSION_FILE);
    let raw = read_json_object(&path, "session")?;
    let found = raw
        .get("session_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if found != session_id {
        return Err(SessionError::FileIdMismatch {
            expected: session_id.to_string(),
            found: if found.is_empty() { "<missing>".to_string() } else { found },
        }
        .into());
    }
    let session: Session = serde_json::from_value(Value::Object(raw))
        .with_context(|| format!("session file is malformed: {}", path.display()))?;
    Ok((path, session))
}

fn canonical_payload(raw: &Map<String, Value>, session: &Session, now: DateTime<Utc>) -> Result<Value> {
    let meta = raw
        .get("session")
        .and_then(Value::as_object)
        .ok_or(SessionError::MissingSessionBlock)?;
    let payload_id = meta.get("id").and_then(Value::as_str).unwrap_or("").trim();
    let payload_token = meta.get("token").and_then(Value::as_str).unwrap_or("").trim();
    if payload_id != session.session_id || payload_token != session.token {
        return Err(SessionError::TokenMismatch.into());
    }

    let provenance = BatchProvenance {
        kind: BLIND_PROVENANCE_KIND.to_string(),
        blind: true,
        runner: session.runner.clone(),
        run_stamp: session.session_id.clone(),
        created_at: iso_seconds(now),
        batch_count: None,
        batch_indexes: Vec::new(),
        packet_path: session.blind_packet_path.clone(),
        packet_sha256: session.packet_sha256.clone(),
        external_session_id: Some(session.session_id.clone()),
    };
    let mut payload = raw.clone();
    payload.remove("session");
    payload.insert("provenance".to_string(), serde_json::to_value(provenance)?);
    Ok(Value::Object(payload))
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub session: Session,
    pub canonical_path: PathBuf,
    pub import: ImportOutcome,
}

/// Accept a reviewer's output for an open, unexpired session and import it
/// as attested external. A session accepts exactly one submission.
pub fn submit_session(
    layout: &StateLayout,
    session_id: &str,
    input_file: &Path,
    store: &mut AssessmentStore,
    now: DateTime<Utc>,
) -> Result<SubmitOutcome> {
    let (session_path, mut session) = load_session(layout, session_id)?;
    if session.status != SessionStatus::Open {
        return Err(SessionError::NotOpen(session.status.as_str().to_string()).into());
    }
    let expires_at = parse_iso(&session.expires_at).ok_or(SessionError::MissingExpiry)?;
    if now > expires_at {
        session.status = SessionStatus::Expired;
        write_session(&session_path, &session)?;
        warn!(session_id = %session.session_id, "rejecting submission for expired session");
        return Err(SessionError::Expired(session.expires_at.clone()).into());
    }
    if !EXTERNAL_SUPPORTED_RUNNERS.contains(&session.runner.as_str()) {
        return Err(SessionError::UnsupportedRunner(session.runner.clone()).into());
    }

    let raw = read_json_object(input_file, "external findings")?;
    let canonical = canonical_payload(&raw, &session, now)?;

    let blind_path = PathBuf::from(&session.blind_packet_path);
    let observed = sha256_file(&blind_path).ok();
    if observed.as_deref() != Some(session.packet_sha256.as_str()) {
        return Err(SessionError::PacketHashMismatch.into());
    }

    let dir = session_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| session_dir(layout, session_id));
    let canonical_path = dir.join(format!("canonical_import_{}.json", run_stamp(now)));
    atomic_write_json_pretty(&canonical_path, &canonical)?;

    let payload = parse_import_payload(&canonical)?;
    let flags = ImportFlags {
        attested_external: true,
        attest: Some(session.attest.clone()),
        ..ImportFlags::default()
    };

    // Close the session before touching the store so a payload can never be
    // imported twice; reopen it if the import fails.
    let reopened = session.clone();
    session.status = SessionStatus::Submitted;
    session.submitted_at = Some(iso_seconds(now));
    session.submitted_input_file = Some(input_file.display().to_string());
    session.submitted_canonical_file = Some(canonical_path.display().to_string());
    write_session(&session_path, &session)?;

    let import = match import_review(
        store,
        &payload,
        &flags,
        ProvenanceRoots {
            base_dir: &layout.root,
            default_blind: &blind_path,
        },
        &iso_seconds(now),
    ) {
        Ok(import) => import,
        Err(err) => {
            if let Err(restore) = write_session(&session_path, &reopened) {
                warn!(session_id = %session.session_id, error = %restore, "failed to reopen session after import error");
            }
            return Err(err);
        }
    };
    info!(session_id = %session.session_id, mode = %import.policy.mode, "external review session submitted");

    Ok(SubmitOutcome {
        session,
        canonical_path,
        import,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustMode;
    use review_core::state_layout;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_layout(label: &str) -> StateLayout {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        state_layout(&std::env::temp_dir().join(format!("reviewlab_session_{}_{}", label, nanos)))
    }

    fn packet() -> Value {
        json!({
            "dimensions": ["naming", "design"],
            "investigation_batches": [{"name": "A", "dimensions": ["naming"]}],
            "narrative": "overall score 71",
            "config": {"target_strict_score": 95}
        })
    }

    fn started_at() -> DateTime<Utc> {
        parse_iso("2026-05-01T10:00:00Z").expect("time")
    }

    fn write_review(session: &Session, token: &str) -> PathBuf {
        let path = PathBuf::from(&session.expected_output_path);
        let body = json!({
            "session": {"id": session.session_id, "token": token},
            "assessments": {"naming": 81.5},
            "findings": [{
                "dimension": "naming", "identifier": "vague", "summary": "helpers named util",
                "impact_scope": "local", "fix_scope": "single_edit"
            }]
        });
        fs::write(&path, serde_json::to_vec(&body).expect("json")).expect("write review");
        path
    }

    #[test]
    fn start_writes_artifacts_and_blind_copy() {
        let layout = temp_layout("start");
        let session = start_session(&layout, &packet(), &SessionOptions::default(), started_at())
            .expect("start");
        assert!(session.session_id.starts_with("ext_20260501_100000_"));
        assert_eq!(session.session_id.len(), "ext_20260501_100000_".len() + 8);
        assert_eq!(session.token.len(), 32);
        assert_eq!(session.expires_at, "2026-05-02T10:00:00Z");
        let blind = read_json_object(Path::new(&session.blind_packet_path), "blind").expect("blind");
        assert!(!blind.contains_key("narrative"));
        assert!(!blind.contains_key("config"));
        let template = read_json_object(Path::new(&session.template_path), "template").expect("template");
        assert_eq!(template["assessments"], json!({"naming": 0, "design": 0}));
        assert!(Path::new(&session.launch_prompt_path).exists());
        assert!(Path::new(&session.instructions_path).exists());
        let _ = fs::remove_dir_all(&layout.root);
    }

    #[test]
    fn start_rejects_bad_runner_and_ttl() {
        let layout = temp_layout("reject");
        let codex = SessionOptions {
            runner: "codex".to_string(),
            ..SessionOptions::default()
        };
        let err = start_session(&layout, &packet(), &codex, started_at()).expect_err("runner");
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::UnsupportedRunner(_))
        ));
        let zero = SessionOptions {
            ttl_hours: 0,
            ..SessionOptions::default()
        };
        assert!(start_session(&layout, &packet(), &zero, started_at()).is_err());
    }

    #[test]
    fn submit_imports_as_attested_and_closes_session() {
        let layout = temp_layout("submit");
        let session = start_session(&layout, &packet(), &SessionOptions::default(), started_at())
            .expect("start");
        let input = write_review(&session, &session.token);
        let mut store = AssessmentStore::open(&layout.state_file).expect("store");
        let outcome = submit_session(
            &layout,
            &session.session_id,
            &input,
            &mut store,
            started_at() + Duration::hours(1),
        )
        .expect("submit");
        assert_eq!(outcome.import.policy.mode, TrustMode::AttestedExternal);
        assert_eq!(outcome.session.status, SessionStatus::Submitted);
        assert!(outcome.canonical_path.exists());
        assert_eq!(store.assessment("naming").map(|a| a.score), Some(81.5));

        let again = submit_session(
            &layout,
            &session.session_id,
            &input,
            &mut store,
            started_at() + Duration::hours(2),
        )
        .expect_err("reuse");
        assert_eq!(
            again.downcast_ref::<SessionError>(),
            Some(&SessionError::NotOpen("submitted".to_string()))
        );
        let _ = fs::remove_dir_all(&layout.root);
    }

    #[test]
    fn expired_session_is_rejected_even_with_matching_token() {
        let layout = temp_layout("expired");
        let session = start_session(&layout, &packet(), &SessionOptions::default(), started_at())
            .expect("start");
        let input = write_review(&session, &session.token);
        let mut store = AssessmentStore::open(&layout.state_file).expect("store");
        let err = submit_session(
            &layout,
            &session.session_id,
            &input,
            &mut store,
            started_at() + Duration::hours(24) + Duration::seconds(1),
        )
        .expect_err("expired");
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Expired(_))
        ));
        let (_, reloaded) = load_session(&layout, &session.session_id).expect("reload");
        assert_eq!(reloaded.status, SessionStatus::Expired);
        assert!(store.assessment("naming").is_none());
        let _ = fs::remove_dir_all(&layout.root);
    }

    #[test]
    fn token_mismatch_and_path_traversal_are_rejected() {
        let layout = temp_layout("token");
        let session = start_session(&layout, &packet(), &SessionOptions::default(), started_at())
            .expect("start");
        let input = write_review(&session, "0000");
        let mut store = AssessmentStore::open(&layout.state_file).expect("store");
        let err = submit_session(&layout, &session.session_id, &input, &mut store, started_at())
            .expect_err("token");
        assert_eq!(
            err.downcast_ref::<SessionError>(),
            Some(&SessionError::TokenMismatch)
        );
        assert!(validate_session_id("../state").is_err());
        assert!(validate_session_id("a\\b").is_err());
        assert!(validate_session_id("ext_ok").is_ok());
        let _ = fs::remove_dir_all(&layout.root);
    }

    #[test]
    fn tampered_blind_packet_blocks_submission() {
        let layout = temp_layout("tamper");
        let session = start_session(&layout, &packet(), &SessionOptions::default(), started_at())
            .expect("start");
        fs::write(&session.blind_packet_path, b"{\"dimensions\": []}").expect("tamper");
        let input = write_review(&session, &session.token);
        let mut store = AssessmentStore::open(&layout.state_file).expect("store");
        let err = submit_session(&layout, &session.session_id, &input, &mut store, started_at())
            .expect_err("tampered");
        assert_eq!(
            err.downcast_ref::<SessionError>(),
            Some(&SessionError::PacketHashMismatch)
        );
        let _ = fs::remove_dir_all(&layout.root);
    }

    #[test]
    fn instructions_name_the_real_submit_flags() {
        let layout = temp_layout("instructions");
        let session = start_session(&layout, &packet(), &SessionOptions::default(), started_at())
            .expect("start");
        let text = fs::read_to_string(&session.instructions_path).expect("instructions");
        let expected = format!(
            "reviewlab session submit --session-id {} --file {}",
            session.session_id, session.expected_output_path
        );
        assert!(text.contains(&expected));
        assert!(!text.contains("--input"));
        assert_eq!(submit_command(&session), expected);
        let _ = fs::remove_dir_all(&layout.root);
    }

    #[test]
    fn failed_import_reopens_the_session() {
        let layout = temp_layout("reopen");
        let session = start_session(&layout, &packet(), &SessionOptions::default(), started_at())
            .expect("start");
        let input = write_review(&session, &session.token);
        let mut store = AssessmentStore::open(&layout.state_file).expect("store");
        fs::create_dir_all(layout.state_file.join("blocker")).expect("block state file");
        submit_session(&layout, &session.session_id, &input, &mut store, started_at())
            .expect_err("store save fails");
        let (_, reloaded) = load_session(&layout, &session.session_id).expect("reload");
        assert_eq!(reloaded.status, SessionStatus::Open);
        assert!(reloaded.submitted_at.is_none());

        fs::remove_dir_all(&layout.state_file).expect("unblock");
        let mut store = AssessmentStore::open(&layout.state_file).expect("store");
        let outcome = submit_session(&layout, &session.session_id, &input, &mut store, started_at())
            .expect("retry");
        assert_eq!(outcome.session.status, SessionStatus::Submitted);
        let (_, reloaded) = load_session(&layout, &session.session_id).expect("reload");
        assert_eq!(reloaded.status, SessionStatus::Submitted);
        let _ = fs::remove_dir_all(&layout.root);
    }
}
