use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const REVIEW_PACKETS_DIR: &str = "review_packets";
pub const BLIND_PACKET_FILE: &str = "review_packet_blind.json";
pub const SUBAGENT_RUNS_DIR: &str = "subagents/runs";
pub const EXTERNAL_SESSIONS_DIR: &str = "external_review_sessions";
pub const STATE_FILE: &str = "state.json";

/// Well-known locations under the review state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    pub root: PathBuf,
    pub review_packets_dir: PathBuf,
    pub blind_packet: PathBuf,
    pub runs_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub state_file: PathBuf,
}

pub fn state_layout(state_dir: &Path) -> StateLayout {
    StateLayout {
        root: state_dir.to_path_buf(),
        review_packets_dir: state_dir.join(REVIEW_PACKETS_DIR),
        blind_packet: state_dir.join(BLIND_PACKET_FILE),
        runs_dir: state_dir.join(SUBAGENT_RUNS_DIR),
        sessions_dir: state_dir.join(EXTERNAL_SESSIONS_DIR),
        state_file: state_dir.join(STATE_FILE),
    }
}

impl StateLayout {
    pub fn immutable_packet_path(&self, stamp: &str) -> PathBuf {
        self.review_packets_dir
            .join(format!("holistic_packet_{}.json", stamp))
    }

    pub fn run_dir(&self, stamp: &str) -> PathBuf {
        self.runs_dir.join(stamp)
    }
}

/// One independently assignable unit of review work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Batch {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub why: String,
    #[serde(default)]
    pub files_to_read: Vec<String>,
}

/// Typed view over a prepared review packet. `raw` is the verbatim document.
#[derive(Debug, Clone)]
pub struct Packet {
    pub dimensions: Vec<String>,
    pub batches: Vec<Batch>,
    pub raw: Value,
}

impl Packet {
    pub fn from_value(raw: Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| anyhow!("review packet must be a JSON object"))?;
        let dimensions = obj
            .get("dimensions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let batches_raw = obj
            .get("investigation_batches")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("review packet missing investigation_batches array"))?;
        let mut batches = Vec::with_capacity(batches_raw.len());
        for (idx, item) in batches_raw.iter().enumerate() {
            let batch: Batch = serde_json::from_value(item.clone())
                .with_context(|| format!("invalid investigation batch #{}", idx + 1))?;
            batches.push(batch);
        }
        Ok(Self {
            dimensions,
            batches,
            raw,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = Value::Object(read_json_object(path, "review packet")?);
        Self::from_value(raw)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}

pub fn is_sha256_hex(raw: &str) -> bool {
    raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Pretty JSON with a trailing newline.
pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

pub fn read_json_object(path: &Path, label: &str) -> Result<Map<String, Value>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {} {}", label, path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON: {}", label, path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("{} must be a JSON object: {}", label, path.display())),
    }
}

pub fn run_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

pub fn iso_seconds(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Round half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn clamp_score(value: f64) -> f64 {
    round_to(value.clamp(0.0, 100.0), 1)
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("reviewlab_core_{}_{}", label, nanos))
    }

    #[test]
    fn sha256_is_plain_lowercase_hex() {
        let digest = sha256_bytes(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(is_sha256_hex(&digest));
        assert!(!is_sha256_hex("sha256:abc"));
    }

    #[test]
    fn atomic_json_write_replaces_file_and_leaves_no_tmp() {
        let root = temp_root("atomic");
        let path = root.join("nested").join("out.json");
        atomic_write_json_pretty(&path, &json!({"a": 1})).expect("first write");
        atomic_write_json_pretty(&path, &json!({"a": 2})).expect("second write");
        let obj = read_json_object(&path, "test file").expect("read");
        assert_eq!(obj.get("a"), Some(&json!(2)));
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn packet_parses_batches_in_order() {
        let packet = Packet::from_value(json!({
            "dimensions": ["naming", "", "error_handling"],
            "investigation_batches": [
                {"name": "A", "dimensions": ["naming"], "why": "x", "files_to_read": ["a.rs"]},
                {"name": "B", "dimensions": ["error_handling"]}
            ],
            "narrative": "context"
        }))
        .expect("packet");
        assert_eq!(packet.dimensions, vec!["naming", "error_handling"]);
        assert_eq!(packet.batch_count(), 2);
        assert_eq!(packet.batches[1].name, "B");
        assert!(packet.batches[1].files_to_read.is_empty());
    }

    #[test]
    fn packet_without_batches_is_rejected() {
        let err = Packet::from_value(json!({"dimensions": []})).expect_err("must fail");
        assert!(err.to_string().contains("investigation_batches"));
    }

    #[test]
    fn stamps_and_rounding() {
        let now = parse_iso("2026-03-04T05:06:07Z").expect("parse");
        assert_eq!(run_stamp(now), "20260304_050607");
        assert_eq!(iso_seconds(now), "2026-03-04T05:06:07Z");
        assert_eq!(clamp_score(120.0), 100.0);
        assert_eq!(clamp_score(-3.0), 0.0);
        assert_eq!(clamp_score(72.1249), 72.1);
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }
}
