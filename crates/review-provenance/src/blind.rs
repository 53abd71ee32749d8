use anyhow::{anyhow, Result};
use review_core::{atomic_write_json_pretty, sha256_file, StateLayout};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const BLIND_DROPPED_KEYS: [&str; 6] = [
    "narrative",
    "next_command",
    "score_snapshot",
    "strict_target",
    "strict_target_progress",
    "subjective_at_target",
];

const BLIND_DROPPED_CONFIG_KEYS: [&str; 7] = [
    "target_strict_score",
    "strict_target_score",
    "target_score",
    "strict_score",
    "objective_score",
    "overall_score",
    "verified_strict_score",
];

fn is_score_hint_config_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    lowered.contains("target")
        || lowered.ends_with("_score")
        || BLIND_DROPPED_CONFIG_KEYS.contains(&lowered.as_str())
}

/// Redacted copy of a packet with score-anchoring fields removed.
pub fn blind_packet(packet: &Map<String, Value>) -> Map<String, Value> {
    let mut blind = packet.clone();
    for key in BLIND_DROPPED_KEYS {
        blind.remove(key);
    }
    if let Some(Value::Object(config)) = blind.get("config") {
        let sanitized: Map<String, Value> = config
            .iter()
            .filter(|(key, _)| !is_score_hint_config_key(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if sanitized.is_empty() {
            blind.remove("config");
        } else {
            blind.insert("config".to_string(), Value::Object(sanitized));
        }
    }
    blind
}

/// On-disk packet pair for one run or session.
#[derive(Debug, Clone)]
pub struct PacketSnapshot {
    pub immutable_path: PathBuf,
    pub blind_path: PathBuf,
    pub blind_sha256: String,
}

pub fn write_blind_packet(packet: &Value, path: &Path) -> Result<String> {
    let obj = packet
        .as_object()
        .ok_or_else(|| anyhow!("review packet must be a JSON object"))?;
    atomic_write_json_pretty(path, &Value::Object(blind_packet(obj)))?;
    sha256_file(path)
}

/// Persist the verbatim packet under `review_packets/` and its blind
/// derivative at the layout's blind packet path, returning the blind hash.
pub fn write_packet_snapshot(
    layout: &StateLayout,
    packet: &Value,
    stamp: &str,
) -> Result<PacketSnapshot> {
    let immutable_path = layout.immutable_packet_path(stamp);
    atomic_write_json_pretty(&immutable_path, packet)?;
    let blind_sha256 = write_blind_packet(packet, &layout.blind_packet)?;
    Ok(PacketSnapshot {
        immutable_path,
        blind_path: layout.blind_packet.clone(),
        blind_sha256,
    })
}
