pub mod merge;
pub mod model;
pub mod normalize;
pub mod payload;

pub use merge::{assessment_weight, dimension_score, merge};
pub use model::*;
pub use normalize::{normalize, ValidationError};
pub use payload::{extract_payload, ExtractionError};

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Extract and normalize one raw agent output in a single step.
pub fn parse_batch_output(
    batch_index: usize,
    raw: &str,
    allowed: &BTreeSet<String>,
    max_findings: usize,
) -> Result<BatchResult, PayloadError> {
    let payload: Map<String, Value> = extract_payload(raw)?;
    Ok(normalize(batch_index, &payload, allowed, max_findings)?)
}
