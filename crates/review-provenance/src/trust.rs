use crate::provenance::ProvenanceStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const ATTESTED_EXTERNAL_RUNNERS: [&str; 1] = ["claude"];
pub const ATTESTED_EXTERNAL_REQUIRED_PHRASES: [&str; 2] = ["without awareness", "unbiased"];
pub const ATTESTED_EXTERNAL_ATTEST_EXAMPLE: &str =
    "I validated this review was completed without awareness of overall score and is unbiased.";

#[derive(Debug, Error, PartialEq)]
pub enum TrustViolation {
    #[error("{0} cannot be combined with {1}")]
    ConflictingFlags(&'static str, &'static str),
    #[error("--manual-override requires --attest")]
    MissingManualAttestation,
    #[error("invalid review import mode '{0}'; expected one of: attested_external, auto, manual_override, trusted_internal")]
    InvalidImportMode(String),
    #[error("import_mode={0} cannot be combined with {1} flags")]
    IncompatibleImportMode(&'static str, &'static str),
    #[error("import_mode=trusted_internal is reserved for run-batches imports")]
    ReservedImportMode,
}

/// The single trust tier an import lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Payload carried no assessments at all.
    None,
    TrustedInternal,
    AttestedExternal,
    ManualOverride,
    FindingsOnly,
}

impl TrustMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "findings-only (no assessments in payload)",
            Self::TrustedInternal => "trusted internal (durable scores)",
            Self::AttestedExternal => "attested external (durable scores)",
            Self::ManualOverride => "manual override (provisional scores)",
            Self::FindingsOnly => "findings-only (assessments skipped)",
        }
    }

    pub fn durable(self) -> bool {
        matches!(self, Self::TrustedInternal | Self::AttestedExternal)
    }

    pub fn keeps_assessments(self) -> bool {
        matches!(
            self,
            Self::TrustedInternal | Self::AttestedExternal | Self::ManualOverride
        )
    }
}

impl fmt::Display for TrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Auto,
    TrustedInternal,
    AttestedExternal,
    ManualOverride,
}

impl ImportMode {
    pub fn parse(raw: Option<&str>) -> Result<Self, TrustViolation> {
        let token = raw.unwrap_or("auto").trim().to_ascii_lowercase().replace('-', "_");
        match token.as_str() {
            "" | "auto" => Ok(Self::Auto),
            "trusted_internal" => Ok(Self::TrustedInternal),
            "attested_external" => Ok(Self::AttestedExternal),
            "manual_override" => Ok(Self::ManualOverride),
            _ => Err(TrustViolation::InvalidImportMode(raw.unwrap_or("").to_string())),
        }
    }
}

/// Caller-asserted import flags. `trusted_source` is only ever set by the
/// run-batches pipeline itself, never from user input.
#[derive(Debug, Clone, Default)]
pub struct ImportFlags {
    pub trusted_source: bool,
    pub trusted_label: Option<String>,
    pub attested_external: bool,
    pub manual_override: bool,
    pub attest: Option<String>,
    pub allow_partial: bool,
}

impl ImportFlags {
    /// Fold an import-mode token over the boolean flags.
    pub fn with_mode(mut self, mode: ImportMode) -> Result<Self, TrustViolation> {
        match mode {
            ImportMode::TrustedInternal if self.attested_external || self.manual_override => {
                return Err(TrustViolation::IncompatibleImportMode(
                    "trusted_internal",
                    "attested/manual",
                ))
            }
            ImportMode::TrustedInternal if !self.trusted_source => {
                return Err(TrustViolation::ReservedImportMode)
            }
            ImportMode::AttestedExternal if self.manual_override => {
                return Err(TrustViolation::IncompatibleImportMode(
                    "attested_external",
                    "manual override",
                ))
            }
            ImportMode::ManualOverride if self.attested_external => {
                return Err(TrustViolation::IncompatibleImportMode(
                    "manual_override",
                    "attested external",
                ))
            }
            ImportMode::AttestedExternal => self.attested_external = true,
            ImportMode::ManualOverride => self.manual_override = true,
            ImportMode::TrustedInternal | ImportMode::Auto => {}
        }
        Ok(self)
    }

    fn attest_text(&self) -> Option<&str> {
        self.attest.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Reject flag combinations that would let one import claim two tiers.
    pub fn validate(&self) -> Result<(), TrustViolation> {
        if self.attested_external && self.manual_override {
            return Err(TrustViolation::ConflictingFlags(
                "--attested-external",
                "--manual-override",
            ));
        }
        if self.attested_external && self.allow_partial {
            return Err(TrustViolation::ConflictingFlags(
                "--attested-external",
                "--allow-partial",
            ));
        }
        if self.manual_override && self.allow_partial {
            return Err(TrustViolation::ConflictingFlags(
                "--manual-override",
                "--allow-partial",
            ));
        }
        if self.manual_override && self.attest_text().is_none() {
            return Err(TrustViolation::MissingManualAttestation);
        }
        Ok(())
    }
}

pub fn attestation_is_valid(attest: Option<&str>) -> bool {
    match attest.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => {
            let lowered = text.to_lowercase();
            ATTESTED_EXTERNAL_REQUIRED_PHRASES
                .iter()
                .all(|phrase| lowered.contains(phrase))
        }
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentPolicy {
    pub mode: TrustMode,
    pub trusted: bool,
    pub reason: String,
    pub assessments_present: bool,
    pub assessment_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attest: Option<String>,
    pub provenance: ProvenanceStatus,
}

fn external_reason(status: &ProvenanceStatus, has_provenance: bool, detail: Option<&str>) -> String {
    let lead = match detail {
        Some(detail) => format!("{}; ", detail),
        None => String::new(),
    };
    if !has_provenance {
        return format!("{}missing trusted run-batches source; imported findings only", lead);
    }
    if status.trusted {
        format!(
            "{}external imports cannot self-attest trust even when provenance appears valid; run review --run-batches to apply assessments automatically",
            lead
        )
    } else {
        format!(
            "{}external imports cannot self-attest trust ({}); run review --run-batches to apply assessments automatically",
            lead, status.reason
        )
    }
}

/// Decide the trust tier for one import. Exactly one mode is returned.
///
/// An attested-external request that fails any check falls back to
/// findings-only rather than erroring; only flag conflicts are violations.
pub fn classify(
    assessment_count: usize,
    has_provenance: bool,
    flags: &ImportFlags,
    status: &ProvenanceStatus,
) -> Result<AssessmentPolicy, TrustViolation> {
    flags.validate()?;

    let mut policy = AssessmentPolicy {
        mode: TrustMode::None,
        trusted: false,
        reason: String::new(),
        assessments_present: assessment_count > 0,
        assessment_count,
        attest: None,
        provenance: status.clone(),
    };
    if assessment_count == 0 {
        return Ok(policy);
    }

    if flags.trusted_source {
        policy.mode = TrustMode::TrustedInternal;
        policy.trusted = true;
        policy.reason = flags
            .trusted_label
            .clone()
            .unwrap_or_else(|| "trusted internal run-batches import".to_string());
        return Ok(policy);
    }

    if flags.attested_external {
        let failure = if !attestation_is_valid(flags.attest.as_deref()) {
            Some("--attested-external requires --attest containing both 'without awareness' and 'unbiased'".to_string())
        } else if !status.trusted {
            Some(format!(
                "--attested-external requires valid blind packet provenance (current status: {})",
                status.reason
            ))
        } else if !ATTESTED_EXTERNAL_RUNNERS.contains(&status.runner.as_str()) {
            Some("--attested-external currently supports runner='claude' provenance only".to_string())
        } else {
            None
        };
        match failure {
            None => {
                policy.mode = TrustMode::AttestedExternal;
                policy.trusted = true;
                policy.reason = "attested external blind subagent provenance".to_string();
                policy.attest = flags.attest_text().map(str::to_string);
                return Ok(policy);
            }
            Some(detail) => {
                policy.mode = TrustMode::FindingsOnly;
                policy.reason = external_reason(status, has_provenance, Some(&detail));
                return Ok(policy);
            }
        }
    }

    if flags.manual_override {
        policy.mode = TrustMode::ManualOverride;
        policy.reason = "manual override attested by operator".to_string();
        policy.attest = flags.attest_text().map(str::to_string);
        return Ok(policy);
    }

    policy.mode = TrustMode::FindingsOnly;
    policy.reason = external_reason(status, has_provenance, None);
    Ok(policy)
}
