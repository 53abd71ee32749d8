use crate::model::{
    BatchResult, Confidence, Finding, MergedAssessment, MergedResult, Note, ReviewQuality,
    ABSTRACTION_DIMENSION, ABSTRACTION_SUB_AXES,
};
use review_core::{clamp_score, round_to};
use std::collections::{BTreeMap, HashSet};

const MEAN_WEIGHT: f64 = 0.7;
const FLOOR_WEIGHT: f64 = 0.3;
const MAX_PENALTY: f64 = 24.0;
const PRESSURE_PENALTY_FACTOR: f64 = 2.2;
const EXTRA_FINDING_PENALTY: f64 = 0.8;
const CAP_BASE: f64 = 90.0;
const CAP_PRESSURE_FACTOR: f64 = 3.5;
const CAP_FLOOR: f64 = 60.0;

/// Weight a batch's score for one dimension carries in the merge.
pub fn assessment_weight(result: &BatchResult, dimension: &str) -> f64 {
    let evidence = result
        .dimension_notes
        .get(dimension)
        .map(|n| n.evidence.len())
        .unwrap_or(0);
    let findings = result
        .findings
        .iter()
        .filter(|f| f.dimension == dimension)
        .count();
    (1 + evidence + findings) as f64
}

fn weighted_mean(samples: &[(f64, f64)]) -> Option<f64> {
    let denominator: f64 = samples.iter().map(|(_, w)| w).sum();
    if denominator <= 0.0 {
        return None;
    }
    let numerator: f64 = samples.iter().map(|(s, w)| s * w).sum();
    Some(numerator / denominator)
}

/// Final merged score for one dimension.
///
/// `samples` are `(score, weight)` per batch, `pressure` is the summed
/// severity of the dimension's deduplicated findings.
pub fn dimension_score(samples: &[(f64, f64)], pressure: f64, finding_count: usize) -> f64 {
    let Some(mean) = weighted_mean(samples) else {
        return 0.0;
    };
    let floor = samples
        .iter()
        .map(|(s, _)| *s)
        .fold(f64::INFINITY, f64::min);
    let blended = MEAN_WEIGHT * mean + FLOOR_WEIGHT * floor;
    let extra = finding_count.saturating_sub(1) as f64;
    let penalty =
        (pressure * PRESSURE_PENALTY_FACTOR + extra * EXTRA_FINDING_PENALTY).min(MAX_PENALTY);
    let mut adjusted = blended - penalty;
    if finding_count > 0 {
        adjusted = adjusted.min((CAP_BASE - pressure * CAP_PRESSURE_FACTOR).max(CAP_FLOOR));
    }
    clamp_score(adjusted)
}

/// Results ordered by batch index, with the serialized form as a tiebreak so
/// duplicate indices cannot make the fold order-dependent.
fn canonical_order(results: &[BatchResult]) -> Vec<&BatchResult> {
    let mut keyed: Vec<(String, &BatchResult)> = results
        .iter()
        .map(|r| (serde_json::to_string(r).unwrap_or_default(), r))
        .collect();
    keyed.sort_by(|a, b| {
        a.1.batch_index
            .cmp(&b.1.batch_index)
            .then_with(|| a.0.cmp(&b.0))
    });
    keyed.into_iter().map(|(_, r)| r).collect()
}

/// Fold normalized batch results into one scored result.
///
/// The output depends only on the set of inputs, never on their order.
pub fn merge(results: &[BatchResult]) -> MergedResult {
    let ordered = canonical_order(results);

    let mut buckets: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    let mut notes: BTreeMap<String, Note> = BTreeMap::new();
    let mut axis_buckets: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
    let mut findings: Vec<Finding> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut coverage_total = 0.0;
    let mut density_total = 0.0;
    let mut high_score_without_risk = 0u32;

    for result in &ordered {
        for (dimension, score) in &result.assessments {
            let weight = assessment_weight(result, dimension);
            buckets
                .entry(dimension.clone())
                .or_default()
                .push((*score, weight));

            if let Some(note) = result.dimension_notes.get(dimension) {
                let replace = notes
                    .get(dimension)
                    .map(|existing| note.evidence.len() > existing.evidence.len())
                    .unwrap_or(true);
                if replace {
                    notes.insert(dimension.clone(), note.clone());
                }
                if dimension == ABSTRACTION_DIMENSION {
                    for (axis, _) in ABSTRACTION_SUB_AXES {
                        if let Some(axis_score) = note.sub_axes.get(axis) {
                            axis_buckets
                                .entry(axis)
                                .or_default()
                                .push((*axis_score, weight));
                        }
                    }
                }
            }
        }

        for finding in &result.findings {
            if seen.insert(finding.dedup_key()) {
                findings.push(finding.clone());
            }
        }

        coverage_total += result.quality.dimension_coverage;
        density_total += result.quality.evidence_density;
        high_score_without_risk += result.quality.high_score_without_risk;
    }

    let mut pressure: BTreeMap<String, f64> = BTreeMap::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for finding in &findings {
        let fallback = notes
            .get(&finding.dimension)
            .map(|n| n.confidence)
            .unwrap_or(Confidence::Medium);
        *pressure.entry(finding.dimension.clone()).or_default() += finding.severity(fallback);
        *counts.entry(finding.dimension.clone()).or_default() += 1;
    }

    let mut assessments = BTreeMap::new();
    for (dimension, samples) in &buckets {
        let score = dimension_score(
            samples,
            pressure.get(dimension).copied().unwrap_or(0.0),
            counts.get(dimension).copied().unwrap_or(0),
        );
        assessments.insert(dimension.clone(), MergedAssessment::Score(score));
    }

    if let Some(MergedAssessment::Score(score)) = assessments.get(ABSTRACTION_DIMENSION).cloned() {
        let mut components = Vec::new();
        let mut component_scores = BTreeMap::new();
        for (axis, display) in ABSTRACTION_SUB_AXES {
            let Some(mean) = axis_buckets.get(axis).and_then(|s| weighted_mean(s)) else {
                continue;
            };
            components.push(display.to_string());
            component_scores.insert(display.to_string(), clamp_score(mean));
        }
        if !components.is_empty() {
            assessments.insert(
                ABSTRACTION_DIMENSION.to_string(),
                MergedAssessment::Composite {
                    score,
                    components,
                    component_scores,
                },
            );
        }
    }

    let batch_count = ordered.len();
    let divisor = batch_count.max(1) as f64;
    MergedResult {
        assessments,
        dimension_notes: notes,
        findings,
        review_quality: ReviewQuality {
            batch_count,
            dimension_coverage: round_to(coverage_total / divisor, 3),
            evidence_density: round_to(density_total / divisor, 3),
            high_score_without_risk,
            finding_pressure: round_to(pressure.values().sum(), 3),
            dimensions_with_findings: counts.len(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchQuality, FixScope, ImpactScope};

    fn note(evidence: usize) -> Note {
        Note {
            evidence: (0..evidence).map(|i| format!("observation {}", i)).collect(),
            impact_scope: ImpactScope::Module,
            fix_scope: FixScope::MultiFileRefactor,
            confidence: Confidence::Medium,
            issues_preventing_higher_score: None,
            sub_axes: BTreeMap::new(),
        }
    }

    fn finding(dimension: &str, identifier: &str, summary: &str) -> Finding {
        Finding {
            dimension: dimension.to_string(),
            identifier: identifier.to_string(),
            summary: summary.to_string(),
            impact_scope: ImpactScope::Module,
            fix_scope: FixScope::MultiFileRefactor,
            confidence: Some(Confidence::Medium),
            suggestion: None,
            related_files: Vec::new(),
            evidence: Vec::new(),
        }
    }

    fn result(index: usize, dim: &str, score: f64, evidence: usize, findings: Vec<Finding>) -> BatchResult {
        BatchResult {
            batch_index: index,
            assessments: BTreeMap::from([(dim.to_string(), score)]),
            dimension_notes: BTreeMap::from([(dim.to_string(), note(evidence))]),
            findings,
            quality: BatchQuality {
                dimension_coverage: 1.0,
                evidence_density: evidence as f64,
                high_score_without_risk: u32::from(score > 85.0),
            },
            rejected_dimensions: BTreeMap::new(),
        }
    }

    fn worked_example() -> Vec<BatchResult> {
        // Weights 1, 3 and 2: evidence 0; evidence 1 plus the finding; evidence 1.
        vec![
            result(0, "design", 90.0, 0, vec![]),
            result(1, "design", 80.0, 1, vec![finding("design", "god_object", "Router owns IO")]),
            result(2, "design", 70.0, 1, vec![]),
        ]
    }

    #[test]
    fn worked_example_scores_seventy_two_point_one() {
        let results = worked_example();
        let weights: Vec<f64> = results.iter().map(|r| assessment_weight(r, "design")).collect();
        assert_eq!(weights, vec![1.0, 3.0, 2.0]);
        let merged = merge(&results);
        assert_eq!(merged.assessments["design"], MergedAssessment::Score(72.1));
        assert_eq!(merged.review_quality.finding_pressure, 1.69);
        assert_eq!(merged.review_quality.dimensions_with_findings, 1);
        assert_eq!(merged.review_quality.high_score_without_risk, 1);
    }

    #[test]
    fn dimension_score_applies_penalty_cap_and_clamp() {
        // Cap binds: pressure 8 gives cap max(60, 62) = 62 on a blended 100.
        assert_eq!(dimension_score(&[(100.0, 1.0)], 8.0, 1), 62.0);
        // Penalty saturates at 24.
        assert_eq!(dimension_score(&[(50.0, 1.0)], 20.0, 5), 26.0);
        // No findings: plain blend.
        assert_eq!(dimension_score(&[(80.0, 1.0), (60.0, 1.0)], 0.0, 0), 67.0);
        assert_eq!(dimension_score(&[(5.0, 1.0)], 10.0, 3), 0.0);
    }

    #[test]
    fn merge_is_identical_for_every_permutation() {
        let mut base = worked_example();
        base.push(result(3, "naming", 88.0, 2, vec![
            finding("design", "god_object", "Router owns IO"),
            finding("naming", "vague", "helpers named util"),
        ]));
        let expected = serde_json::to_string(&merge(&base)).expect("serialize");
        let orders: [[usize; 4]; 6] = [
            [3, 2, 1, 0],
            [1, 0, 3, 2],
            [2, 3, 0, 1],
            [0, 2, 1, 3],
            [3, 0, 2, 1],
            [1, 3, 0, 2],
        ];
        for order in orders {
            let permuted: Vec<BatchResult> = order.iter().map(|&i| base[i].clone()).collect();
            let actual = serde_json::to_string(&merge(&permuted)).expect("serialize");
            assert_eq!(actual, expected, "order {:?}", order);
        }
    }

    #[test]
    fn duplicate_findings_keep_first_by_batch_index() {
        let mut later = finding("design", "god_object", "Router owns IO");
        later.suggestion = Some("split it".to_string());
        let results = vec![
            result(4, "design", 70.0, 1, vec![later]),
            result(1, "design", 70.0, 1, vec![finding("design", "god_object", "Router owns IO")]),
        ];
        let merged = merge(&results);
        assert_eq!(merged.findings.len(), 1);
        assert_eq!(merged.findings[0].suggestion, None);
    }

    #[test]
    fn note_with_most_evidence_survives() {
        let results = vec![
            result(0, "design", 70.0, 1, vec![]),
            result(1, "design", 75.0, 4, vec![]),
            result(2, "design", 80.0, 4, vec![]),
        ];
        let merged = merge(&results);
        assert_eq!(merged.dimension_notes["design"].evidence.len(), 4);
    }

    #[test]
    fn abstraction_dimension_gets_component_scores() {
        let mut first = result(0, ABSTRACTION_DIMENSION, 70.0, 1, vec![]);
        first
            .dimension_notes
            .get_mut(ABSTRACTION_DIMENSION)
            .expect("note")
            .sub_axes
            .insert("abstraction_leverage".to_string(), 60.0);
        let mut second = result(1, ABSTRACTION_DIMENSION, 80.0, 3, vec![]);
        second
            .dimension_notes
            .get_mut(ABSTRACTION_DIMENSION)
            .expect("note")
            .sub_axes
            .insert("abstraction_leverage".to_string(), 80.0);
        let merged = merge(&[first, second]);
        match &merged.assessments[ABSTRACTION_DIMENSION] {
            MergedAssessment::Composite {
                components,
                component_scores,
                ..
            } => {
                assert_eq!(components, &vec!["Abstraction Leverage".to_string()]);
                // Weights 2 and 4: (120 + 320) / 6.
                assert_eq!(component_scores["Abstraction Leverage"], 73.3);
            }
            other => panic!("expected composite, got {:?}", other),
        }
    }

    #[test]
    fn empty_input_yields_empty_merge() {
        let merged = merge(&[]);
        assert!(merged.assessments.is_empty());
        assert_eq!(merged.review_quality.batch_count, 0);
    }
}
