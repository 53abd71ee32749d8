use crate::model::{
    BatchQuality, BatchResult, Confidence, Finding, FixScope, ImpactScope, Note,
    ABSTRACTION_DIMENSION, ABSTRACTION_SUB_AXES, HIGH_SCORE_ISSUES_NOTE_THRESHOLD,
    LOW_SCORE_FINDING_THRESHOLD,
};
use review_core::{clamp_score, round_to};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

const ISSUES_NOTE_KEY: &str = "issues_preventing_higher_score";
const LEGACY_ISSUES_NOTE_KEY: &str = "unreported_risk";

#[derive(Debug, Error, PartialEq)]
#[error("invalid batch payload: {0}")]
pub struct ValidationError(pub String);

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn validate_note(dimension: &str, raw: Option<&Value>) -> Result<Note, String> {
    let obj = raw
        .and_then(Value::as_object)
        .ok_or_else(|| format!("dimension_notes missing object for assessed dimension: {}", dimension))?;
    let evidence = string_list(obj.get("evidence"));
    if evidence.is_empty() {
        return Err(format!(
            "dimension_notes.{}.evidence must be a non-empty array",
            dimension
        ));
    }
    let impact_scope = non_empty_str(obj.get("impact_scope"))
        .and_then(|s| ImpactScope::parse(&s))
        .ok_or_else(|| format!("dimension_notes.{}.impact_scope is missing or invalid", dimension))?;
    let fix_scope = non_empty_str(obj.get("fix_scope"))
        .and_then(|s| FixScope::parse(&s))
        .ok_or_else(|| format!("dimension_notes.{}.fix_scope is missing or invalid", dimension))?;
    let confidence = non_empty_str(obj.get("confidence"))
        .and_then(|s| Confidence::parse(&s))
        .unwrap_or_default();
    let issues = non_empty_str(obj.get(ISSUES_NOTE_KEY))
        .or_else(|| non_empty_str(obj.get(LEGACY_ISSUES_NOTE_KEY)));
    let sub_axes = if dimension == ABSTRACTION_DIMENSION {
        sub_axes(obj)?
    } else {
        BTreeMap::new()
    };
    Ok(Note {
        evidence,
        impact_scope,
        fix_scope,
        confidence,
        issues_preventing_higher_score: issues,
        sub_axes,
    })
}

fn sub_axes(note: &Map<String, Value>) -> Result<BTreeMap<String, f64>, String> {
    let mut out = BTreeMap::new();
    let raw = match note.get("sub_axes") {
        None | Some(Value::Null) => return Ok(out),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(format!(
                "dimension_notes.{}.sub_axes must be an object",
                ABSTRACTION_DIMENSION
            ))
        }
    };
    for (axis, _) in ABSTRACTION_SUB_AXES {
        let Some(value) = raw.get(axis) else {
            continue;
        };
        let score = numeric(value).ok_or_else(|| {
            format!(
                "dimension_notes.{}.sub_axes.{} must be numeric",
                ABSTRACTION_DIMENSION, axis
            )
        })?;
        out.insert(axis.to_string(), clamp_score(score));
    }
    Ok(out)
}

fn normalize_finding(
    idx: usize,
    raw: &Value,
    allowed: &BTreeSet<String>,
    notes: &BTreeMap<String, Note>,
) -> Option<Finding> {
    let Some(obj) = raw.as_object() else {
        debug!(idx, "dropping finding: not an object");
        return None;
    };
    let dimension = non_empty_str(obj.get("dimension"))?;
    if !allowed.contains(&dimension) {
        debug!(idx, dimension = %dimension, "dropping finding: dimension not allowed");
        return None;
    }
    let identifier = non_empty_str(obj.get("identifier"))?;
    let summary = non_empty_str(obj.get("summary"))?;
    let note = notes.get(&dimension);
    let impact_scope = non_empty_str(obj.get("impact_scope"))
        .and_then(|s| ImpactScope::parse(&s))
        .or_else(|| note.map(|n| n.impact_scope));
    let fix_scope = non_empty_str(obj.get("fix_scope"))
        .and_then(|s| FixScope::parse(&s))
        .or_else(|| note.map(|n| n.fix_scope));
    let (Some(impact_scope), Some(fix_scope)) = (impact_scope, fix_scope) else {
        debug!(idx, "dropping finding: no impact_scope/fix_scope and no note to backfill from");
        return None;
    };
    Some(Finding {
        dimension,
        identifier,
        summary,
        impact_scope,
        fix_scope,
        confidence: non_empty_str(obj.get("confidence")).and_then(|s| Confidence::parse(&s)),
        suggestion: non_empty_str(obj.get("suggestion")),
        related_files: string_list(obj.get("related_files")),
        evidence: string_list(obj.get("evidence")),
    })
}

/// Keep at most `max` findings, reserving a slot for the first finding of
/// each low-score dimension before filling the rest in order.
fn cap_findings(findings: Vec<Finding>, max: usize, low_score: &BTreeSet<String>) -> Vec<Finding> {
    if findings.len() <= max {
        return findings;
    }
    let mut covered = BTreeSet::new();
    let mut keep = vec![false; findings.len()];
    let mut kept = 0;
    for (idx, finding) in findings.iter().enumerate() {
        if kept >= max {
            break;
        }
        if low_score.contains(&finding.dimension) && covered.insert(finding.dimension.as_str()) {
            keep[idx] = true;
            kept += 1;
        }
    }
    for slot in keep.iter_mut() {
        if kept >= max {
            break;
        }
        if !*slot {
            *slot = true;
            kept += 1;
        }
    }
    findings
        .into_iter()
        .zip(keep)
        .filter_map(|(finding, keep)| keep.then_some(finding))
        .collect()
}

/// Validate one extracted payload against the allowed dimension set.
///
/// Structural problems fail the whole batch. A dimension whose note is
/// invalid, or whose score is below [`LOW_SCORE_FINDING_THRESHOLD`] with no
/// finding to back it, is dropped and recorded in `rejected_dimensions`.
pub fn normalize(
    batch_index: usize,
    payload: &Map<String, Value>,
    allowed: &BTreeSet<String>,
    max_findings: usize,
) -> Result<BatchResult, ValidationError> {
    let raw_assessments = match payload.get("assessments") {
        None => return Err(ValidationError("payload missing required key: assessments".into())),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ValidationError("assessments must be an object".into())),
    };
    let raw_findings = match payload.get("findings") {
        None => return Err(ValidationError("payload missing required key: findings".into())),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ValidationError("findings must be an array".into())),
    };
    let empty = Map::new();
    let raw_notes = match payload.get("dimension_notes") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ValidationError("dimension_notes must be an object".into())),
    };

    let mut assessments = BTreeMap::new();
    let mut dimension_notes = BTreeMap::new();
    let mut rejected = BTreeMap::new();

    for (key, value) in raw_assessments {
        if !allowed.contains(key) {
            continue;
        }
        // Booleans are not numbers in serde_json, so `true` never reaches here.
        let Some(raw_score) = numeric(value) else {
            continue;
        };
        let score = clamp_score(raw_score);
        match validate_note(key, raw_notes.get(key)) {
            Ok(note) => {
                assessments.insert(key.clone(), score);
                dimension_notes.insert(key.clone(), note);
            }
            Err(reason) => {
                debug!(batch_index, dimension = %key, reason = %reason, "rejecting dimension");
                rejected.insert(key.clone(), reason);
            }
        }
    }

    let findings: Vec<Finding> = raw_findings
        .iter()
        .enumerate()
        .filter_map(|(idx, raw)| normalize_finding(idx, raw, allowed, &dimension_notes))
        .collect();
    let low_score: BTreeSet<String> = assessments
        .iter()
        .filter(|(_, score)| **score < LOW_SCORE_FINDING_THRESHOLD)
        .map(|(dimension, _)| dimension.clone())
        .collect();
    let findings = cap_findings(findings, max_findings, &low_score);

    let reported: BTreeSet<&str> = findings.iter().map(|f| f.dimension.as_str()).collect();
    for dimension in &low_score {
        if reported.contains(dimension.as_str()) {
            continue;
        }
        let reason = format!(
            "score {:.1} is below {:.1} but no finding was reported for {}",
            assessments.get(dimension).copied().unwrap_or_default(),
            LOW_SCORE_FINDING_THRESHOLD,
            dimension
        );
        debug!(batch_index, dimension = %dimension, reason = %reason, "rejecting dimension");
        assessments.remove(dimension);
        dimension_notes.remove(dimension);
        rejected.insert(dimension.clone(), reason);
    }

    let high_score_without_risk = assessments
        .iter()
        .filter(|(dimension, score)| {
            **score > HIGH_SCORE_ISSUES_NOTE_THRESHOLD
                && dimension_notes
                    .get(*dimension)
                    .is_some_and(|n: &Note| n.issues_preventing_higher_score.is_none())
        })
        .count() as u32;
    let evidence_total: usize = dimension_notes.values().map(|n| n.evidence.len()).sum();
    let quality = BatchQuality {
        dimension_coverage: round_to(
            assessments.len() as f64 / allowed.len().max(1) as f64,
            3,
        ),
        evidence_density: round_to(evidence_total as f64 / findings.len().max(1) as f64, 3),
        high_score_without_risk,
    };

    Ok(BatchResult {
        batch_index,
        assessments,
        dimension_notes,
        findings,
        quality,
        rejected_dimensions: rejected,
    })
}
