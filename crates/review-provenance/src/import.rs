use crate::provenance::assess_provenance;
use crate::store::{ApplyCounts, AssessmentStore};
use crate::trust::{classify, AssessmentPolicy, ImportFlags};
use anyhow::{anyhow, Result};
use review_merge::{Finding, MergedAssessment};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Typed import document. Findings must satisfy the strict finding schema.
#[derive(Debug, Clone)]
pub struct ImportPayload {
    pub assessments: BTreeMap<String, MergedAssessment>,
    pub findings: Vec<Finding>,
    pub provenance: Option<Value>,
    pub reviewed_files: Vec<String>,
}

pub fn parse_import_payload(value: &Value) -> Result<ImportPayload> {
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("import payload must be a JSON object"))?;
    let mut errors = Vec::new();

    let findings_raw: &[Value] = match obj.get("findings") {
        Some(Value::Array(items)) => items.as_slice(),
        _ => {
            errors.push("findings must be a JSON array".to_string());
            &[]
        }
    };
    let mut findings = Vec::with_capacity(findings_raw.len());
    for (idx, item) in findings_raw.iter().enumerate() {
        match serde_json::from_value::<Finding>(item.clone()) {
            Ok(finding) => findings.push(finding),
            Err(err) => errors.push(format!("findings[{}]: {}", idx, err)),
        }
    }

    let mut assessments = BTreeMap::new();
    match obj.get("assessments") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (dimension, raw) in map {
                match serde_json::from_value::<MergedAssessment>(raw.clone()) {
                    Ok(value) => {
                        assessments.insert(dimension.clone(), value);
                    }
                    Err(_) => errors.push(format!("assessments.{} must be numeric", dimension)),
                }
            }
        }
        Some(_) => errors.push("assessments must be an object when provided".to_string()),
    }

    let provenance = match obj.get("provenance") {
        None | Some(Value::Null) => None,
        Some(value @ Value::Object(_)) => Some(value.clone()),
        Some(_) => {
            errors.push("provenance must be an object when provided".to_string());
            None
        }
    };

    let reviewed_files = match obj.get("reviewed_files") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut seen = std::collections::BTreeSet::new();
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty() && seen.insert(s.to_string()))
                .map(str::to_string)
                .collect()
        }
        Some(_) => {
            errors.push("reviewed_files must be an array when provided".to_string());
            Vec::new()
        }
    };

    if !errors.is_empty() {
        let visible: Vec<&str> = errors.iter().take(10).map(String::as_str).collect();
        return Err(anyhow!("import payload validation failed: {}", visible.join("; ")));
    }
    Ok(ImportPayload {
        assessments,
        findings,
        provenance,
        reviewed_files,
    })
}

/// Where an import's provenance is checked against.
#[derive(Debug, Clone, Copy)]
pub struct ProvenanceRoots<'a> {
    pub base_dir: &'a Path,
    pub default_blind: &'a Path,
}

/// Classify without touching state. Used for preflight validation.
pub fn evaluate_import(
    payload: &ImportPayload,
    flags: &ImportFlags,
    roots: ProvenanceRoots<'_>,
) -> Result<AssessmentPolicy> {
    let status = assess_provenance(payload.provenance.as_ref(), roots.base_dir, roots.default_blind);
    let policy = classify(
        payload.assessments.len(),
        payload.provenance.is_some(),
        flags,
        &status,
    )?;
    Ok(policy)
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub policy: AssessmentPolicy,
    pub counts: ApplyCounts,
}

pub fn import_review(
    store: &mut AssessmentStore,
    payload: &ImportPayload,
    flags: &ImportFlags,
    roots: ProvenanceRoots<'_>,
    now: &str,
) -> Result<ImportOutcome> {
    let policy = evaluate_import(payload, flags, roots)?;
    let counts = store.apply_import(&policy, &payload.assessments, &payload.findings, now);
    store.save()?;
    info!(
        mode = %policy.mode,
        assessments = counts.assessments,
        findings_new = counts.findings_new,
        findings_updated = counts.findings_updated,
        "review import applied"
    );
    Ok(ImportOutcome { policy, counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{TrustMode, TrustViolation, ATTESTED_EXTERNAL_ATTEST_EXAMPLE};
    use review_core::sha256_file;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("reviewlab_import_{}_{}", label, nanos));
        fs::create_dir_all(&root).expect("mkdir");
        root
    }

    fn payload_for(blind: &Path, runner: &str) -> Value {
        json!({
            "assessments": {"naming": 82.0},
            "findings": [{
                "dimension": "naming", "identifier": "vague", "summary": "helpers named util",
                "impact_scope": "local", "fix_scope": "single_edit"
            }],
            "provenance": {
                "kind": "blind_review_batch_import",
                "blind": true,
                "runner": runner,
                "packet_path": blind.display().to_string(),
                "packet_sha256": sha256_file(blind).expect("hash"),
            }
        })
    }

    fn attested_flags() -> ImportFlags {
        ImportFlags {
            attested_external: true,
            attest: Some(ATTESTED_EXTERNAL_ATTEST_EXAMPLE.to_string()),
            ..ImportFlags::default()
        }
    }

    #[test]
    fn attested_import_is_durable_and_mismatch_is_findings_only() {
        let root = temp_root("attested");
        let blind = root.join("review_packet_blind.json");
        fs::write(&blind, b"{\"dimensions\":[\"naming\"]}").expect("write");
        let roots = ProvenanceRoots {
            base_dir: &root,
            default_blind: &blind,
        };
        let mut store = AssessmentStore::open(&root.join("state.json")).expect("store");

        let good = parse_import_payload(&payload_for(&blind, "claude")).expect("parse");
        let outcome =
            import_review(&mut store, &good, &attested_flags(), roots, "t0").expect("import");
        assert_eq!(outcome.policy.mode, TrustMode::AttestedExternal);
        assert_eq!(store.assessment("naming").map(|a| a.score), Some(82.0));

        let codex = parse_import_payload(&payload_for(&blind, "codex")).expect("parse");
        let outcome =
            import_review(&mut store, &codex, &attested_flags(), roots, "t1").expect("import");
        assert_eq!(outcome.policy.mode, TrustMode::FindingsOnly);
        assert_eq!(outcome.counts.assessments, 0);
        assert_eq!(outcome.counts.findings_updated, 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn conflicting_flags_surface_as_trust_violation() {
        let root = temp_root("conflict");
        let blind = root.join("blind.json");
        fs::write(&blind, b"{}").expect("write");
        let payload = parse_import_payload(&payload_for(&blind, "claude")).expect("parse");
        let mut flags = attested_flags();
        flags.allow_partial = true;
        let err = evaluate_import(
            &payload,
            &flags,
            ProvenanceRoots {
                base_dir: &root,
                default_blind: &blind,
            },
        )
        .expect_err("conflict");
        assert!(err.downcast_ref::<TrustViolation>().is_some());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_payload_is_rejected_at_the_boundary() {
        let err = parse_import_payload(&json!({
            "assessments": {"naming": "great"},
            "findings": [{"dimension": "naming"}]
        }))
        .expect_err("invalid");
        let message = err.to_string();
        assert!(message.contains("findings[0]"));
        assert!(message.contains("assessments.naming"));
    }
}
