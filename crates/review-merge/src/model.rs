use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ABSTRACTION_DIMENSION: &str = "abstraction_fitness";

/// Sub-axes the reserved dimension may carry, with their display names.
pub const ABSTRACTION_SUB_AXES: [(&str, &str); 6] = [
    ("abstraction_leverage", "Abstraction Leverage"),
    ("indirection_cost", "Indirection Cost"),
    ("interface_honesty", "Interface Honesty"),
    ("delegation_density", "Delegation Density"),
    ("definition_directness", "Definition Directness"),
    ("type_discipline", "Type Discipline"),
];

pub const HIGH_SCORE_ISSUES_NOTE_THRESHOLD: f64 = 85.0;
/// Scores below this need at least one finding in the same dimension.
pub const LOW_SCORE_FINDING_THRESHOLD: f64 = 95.0;
pub const DEFAULT_MAX_BATCH_FINDINGS: usize = 10;

pub fn max_findings_for(dimension_count: usize) -> usize {
    DEFAULT_MAX_BATCH_FINDINGS.max(dimension_count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactScope {
    Local,
    Module,
    Subsystem,
    Codebase,
}

impl ImpactScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "module" => Some(Self::Module),
            "subsystem" => Some(Self::Subsystem),
            "codebase" => Some(Self::Codebase),
            _ => None,
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            Self::Local => 1.0,
            Self::Module => 1.3,
            Self::Subsystem => 1.6,
            Self::Codebase => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixScope {
    SingleEdit,
    MultiFileRefactor,
    ArchitecturalChange,
}

impl FixScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single_edit" => Some(Self::SingleEdit),
            "multi_file_refactor" => Some(Self::MultiFileRefactor),
            "architectural_change" => Some(Self::ArchitecturalChange),
            _ => None,
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            Self::SingleEdit => 1.0,
            Self::MultiFileRefactor => 1.3,
            Self::ArchitecturalChange => 1.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

impl Confidence {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            Self::High => 1.2,
            Self::Medium => 1.0,
            Self::Low => 0.75,
        }
    }
}

/// Per-dimension justification attached to an assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub evidence: Vec<String>,
    pub impact_scope: ImpactScope,
    pub fix_scope: FixScope,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues_preventing_higher_score: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_axes: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub dimension: String,
    pub identifier: String,
    pub summary: String,
    pub impact_scope: ImpactScope,
    pub fix_scope: FixScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl Finding {
    pub fn dedup_key(&self) -> String {
        format!("{}::{}::{}", self.dimension, self.identifier, self.summary)
    }

    /// `confidence × impact × fix`, falling back to `fallback` when the
    /// finding carries no confidence of its own.
    pub fn severity(&self, fallback: Confidence) -> f64 {
        self.confidence.unwrap_or(fallback).weight()
            * self.impact_scope.weight()
            * self.fix_scope.weight()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BatchQuality {
    pub dimension_coverage: f64,
    pub evidence_density: f64,
    pub high_score_without_risk: u32,
}

/// Normalized output of one batch. `batch_index` is 0-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_index: usize,
    pub assessments: BTreeMap<String, f64>,
    pub dimension_notes: BTreeMap<String, Note>,
    pub findings: Vec<Finding>,
    pub quality: BatchQuality,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rejected_dimensions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MergedAssessment {
    Composite {
        score: f64,
        #[serde(default)]
        components: Vec<String>,
        #[serde(default)]
        component_scores: BTreeMap<String, f64>,
    },
    Score(f64),
}

impl MergedAssessment {
    pub fn score(&self) -> f64 {
        match self {
            Self::Score(score) => *score,
            Self::Composite { score, .. } => *score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReviewQuality {
    pub batch_count: usize,
    pub dimension_coverage: f64,
    pub evidence_density: f64,
    pub high_score_without_risk: u32,
    pub finding_pressure: f64,
    pub dimensions_with_findings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub assessments: BTreeMap<String, MergedAssessment>,
    pub dimension_notes: BTreeMap<String, Note>,
    pub findings: Vec<Finding>,
    pub review_quality: ReviewQuality,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_tokens_round_trip_through_serde_names() {
        let value = serde_json::to_value(FixScope::MultiFileRefactor).expect("serialize");
        assert_eq!(value, json!("multi_file_refactor"));
        assert_eq!(ImpactScope::parse(" Module "), Some(ImpactScope::Module));
        assert_eq!(Confidence::parse("certain"), None);
    }

    #[test]
    fn merged_assessment_accepts_scalar_and_composite_shapes() {
        let scalar: MergedAssessment = serde_json::from_value(json!(0)).expect("scalar");
        assert_eq!(scalar.score(), 0.0);
        let composite: MergedAssessment = serde_json::from_value(json!({
            "score": 71.5,
            "components": ["Abstraction Leverage"],
            "component_scores": {"Abstraction Leverage": 70.0}
        }))
        .expect("composite");
        assert!(matches!(composite, MergedAssessment::Composite { .. }));
        assert_eq!(composite.score(), 71.5);
    }

    #[test]
    fn findings_cap_has_floor_of_ten() {
        assert_eq!(max_findings_for(3), 10);
        assert_eq!(max_findings_for(14), 14);
    }
}
