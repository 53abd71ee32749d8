use crate::trust::{AssessmentPolicy, TrustMode};
use anyhow::{Context, Result};
use review_core::{atomic_write_json_pretty, clamp_score};
use review_merge::{Finding, MergedAssessment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const EXPIRED_SOURCE: &str = "manual_override_expired";

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoredAssessment {
    pub score: f64,
    pub source: String,
    pub assessed_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub component_scores: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub provisional_override: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub provisional_until_scan: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub placeholder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    subjective_assessments: BTreeMap<String, StoredAssessment>,
    #[serde(default)]
    findings: BTreeMap<String, StoredFinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_import_policy: Option<AssessmentPolicy>,
}

/// JSON-file boundary onto the persistent scoring state.
#[derive(Debug)]
pub struct AssessmentStore {
    path: PathBuf,
    doc: StoreDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyCounts {
    pub assessments: usize,
    pub findings_new: usize,
    pub findings_updated: usize,
}

impl AssessmentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let doc = if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read state {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("state file is not valid: {}", path.display()))?
        } else {
            StoreDocument::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    pub fn save(&self) -> Result<()> {
        atomic_write_json_pretty(&self.path, &serde_json::to_value(&self.doc)?)
    }

    pub fn assessment(&self, dimension: &str) -> Option<&StoredAssessment> {
        self.doc.subjective_assessments.get(dimension)
    }

    pub fn assessments(&self) -> &BTreeMap<String, StoredAssessment> {
        &self.doc.subjective_assessments
    }

    pub fn findings(&self) -> &BTreeMap<String, StoredFinding> {
        &self.doc.findings
    }

    /// Write an import under the tier chosen by the trust gate.
    pub fn apply_import(
        &mut self,
        policy: &AssessmentPolicy,
        assessments: &BTreeMap<String, MergedAssessment>,
        findings: &[Finding],
        now: &str,
    ) -> ApplyCounts {
        let mut counts = ApplyCounts::default();
        if policy.mode.keeps_assessments() {
            let provisional = policy.mode == TrustMode::ManualOverride;
            let source = if provisional { "manual_override" } else { "holistic" };
            for (dimension, value) in assessments {
                let key = dimension.trim();
                if key.is_empty() {
                    continue;
                }
                let (components, component_scores) = match value {
                    MergedAssessment::Composite {
                        components,
                        component_scores,
                        ..
                    } => (components.clone(), component_scores.clone()),
                    MergedAssessment::Score(_) => (Vec::new(), BTreeMap::new()),
                };
                self.doc.subjective_assessments.insert(
                    key.to_string(),
                    StoredAssessment {
                        score: clamp_score(value.score()),
                        source: source.to_string(),
                        assessed_at: now.to_string(),
                        components,
                        component_scores,
                        provisional_override: provisional,
                        provisional_until_scan: provisional,
                        placeholder: false,
                        reset_by: None,
                    },
                );
                counts.assessments += 1;
            }
        }
        for finding in findings {
            let key = finding.dedup_key();
            match self.doc.findings.get_mut(&key) {
                Some(existing) => {
                    existing.finding = finding.clone();
                    existing.last_seen = now.to_string();
                    counts.findings_updated += 1;
                }
                None => {
                    self.doc.findings.insert(
                        key,
                        StoredFinding {
                            finding: finding.clone(),
                            first_seen: now.to_string(),
                            last_seen: now.to_string(),
                        },
                    );
                    counts.findings_new += 1;
                }
            }
        }
        self.doc.last_import_policy = Some(policy.clone());
        counts
    }

    /// Reset every provisional manual-override score to a placeholder.
    pub fn expire_provisional(&mut self, now: &str) -> usize {
        let mut expired = 0;
        for entry in self.doc.subjective_assessments.values_mut() {
            if !entry.provisional_override {
                continue;
            }
            entry.score = 0.0;
            entry.source = EXPIRED_SOURCE.to_string();
            entry.assessed_at = now.to_string();
            entry.reset_by = Some(EXPIRED_SOURCE.to_string());
            entry.placeholder = true;
            entry.provisional_override = false;
            entry.provisional_until_scan = false;
            entry.components.clear();
            entry.component_scores.clear();
            expired += 1;
        }
        expired
    }
}
