use review_core::{is_sha256_hex, sha256_file};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const BLIND_PROVENANCE_KIND: &str = "blind_review_batch_import";
pub const SUPPORTED_BLIND_RUNNERS: [&str; 2] = ["codex", "claude"];

/// Provenance stamped onto an import payload produced by a blind batch run
/// or an external session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProvenance {
    pub kind: String,
    pub blind: bool,
    pub runner: String,
    pub run_stamp: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_indexes: Vec<usize>,
    pub packet_path: String,
    pub packet_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_session_id: Option<String>,
}

impl BatchProvenance {
    /// `batch_indexes` are 0-based positions; they are stored 1-based and sorted.
    pub fn for_batch_run(
        runner: &str,
        run_stamp: &str,
        created_at: &str,
        batch_indexes: &[usize],
        packet_path: &Path,
        packet_sha256: &str,
    ) -> Self {
        let mut indexes: Vec<usize> = batch_indexes.iter().map(|i| i + 1).collect();
        indexes.sort_unstable();
        indexes.dedup();
        Self {
            kind: BLIND_PROVENANCE_KIND.to_string(),
            blind: true,
            runner: runner.to_string(),
            run_stamp: run_stamp.to_string(),
            created_at: created_at.to_string(),
            batch_count: Some(indexes.len()),
            batch_indexes: indexes,
            packet_path: packet_path.display().to_string(),
            packet_sha256: packet_sha256.to_string(),
            external_session_id: None,
        }
    }
}

/// Outcome of checking an import's provenance against the blind packet on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProvenanceStatus {
    pub trusted: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_sha256: Option<String>,
}

impl ProvenanceStatus {
    fn untrusted(reason: impl Into<String>) -> Self {
        Self {
            trusted: false,
            reason: reason.into(),
            ..Self::default()
        }
    }
}

fn resolve_packet_path(raw: Option<&Value>, base_dir: &Path, default_blind: &Path) -> PathBuf {
    match raw.and_then(Value::as_str).map(str::trim) {
        Some(text) if !text.is_empty() => {
            let path = PathBuf::from(text);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        }
        _ => default_blind.to_path_buf(),
    }
}

fn abbreviate(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Validate a loosely typed provenance record. Relative packet paths are
/// resolved against `base_dir`; a missing path falls back to `default_blind`.
pub fn assess_provenance(
    provenance: Option<&Value>,
    base_dir: &Path,
    default_blind: &Path,
) -> ProvenanceStatus {
    let Some(obj) = provenance.and_then(Value::as_object).filter(|o| !o.is_empty()) else {
        return ProvenanceStatus::untrusted("missing provenance metadata");
    };

    let kind = obj.get("kind").and_then(Value::as_str).unwrap_or("").trim();
    if kind != BLIND_PROVENANCE_KIND {
        let shown = if kind.is_empty() { "<missing>" } else { kind };
        return ProvenanceStatus::untrusted(format!("unsupported provenance kind: {}", shown));
    }
    if obj.get("blind") != Some(&Value::Bool(true)) {
        return ProvenanceStatus::untrusted("provenance is not marked blind=true");
    }
    let runner = obj
        .get("runner")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if !SUPPORTED_BLIND_RUNNERS.contains(&runner.as_str()) {
        let shown = if runner.is_empty() { "<missing>" } else { runner.as_str() };
        return ProvenanceStatus::untrusted(format!("unsupported runner in provenance: {}", shown));
    }
    let expected = match obj.get("packet_sha256").and_then(Value::as_str) {
        Some(hash) if is_sha256_hex(hash) => hash.to_ascii_lowercase(),
        _ => return ProvenanceStatus::untrusted("missing or invalid packet_sha256 in provenance"),
    };

    let packet_path = resolve_packet_path(obj.get("packet_path"), base_dir, default_blind);
    if !packet_path.exists() {
        return ProvenanceStatus::untrusted(format!(
            "blind packet not found: {}",
            packet_path.display()
        ));
    }
    let observed = match sha256_file(&packet_path) {
        Ok(hash) => hash,
        Err(_) => {
            return ProvenanceStatus::untrusted(format!(
                "unable to hash blind packet: {}",
                packet_path.display()
            ))
        }
    };
    if observed != expected {
        return ProvenanceStatus::untrusted(format!(
            "blind packet hash mismatch (expected {}..., got {}...)",
            abbreviate(&expected),
            abbreviate(&observed)
        ));
    }

    ProvenanceStatus {
        trusted: true,
        reason: "trusted blind subagent provenance".to_string(),
        runner,
        packet_path: Some(packet_path.display().to_string()),
        packet_sha256: Some(expected),
    }
}
