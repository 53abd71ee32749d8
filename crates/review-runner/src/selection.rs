use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("invalid batch index '{0}' (expected a 1-based integer)")]
    NotANumber(String),
    #[error("batch index {index} out of range 1..{count}")]
    OutOfRange { index: i64, count: usize },
    #[error("no batches selected")]
    Empty,
}

/// Parse an optional 1-based CSV selection into unique 0-based indexes,
/// keeping first-seen order. `None`, blank, or `all` selects every batch.
pub fn parse_selection(raw: Option<&str>, batch_count: usize) -> Result<Vec<usize>, SelectionError> {
    let text = raw.map(str::trim).unwrap_or("");
    if text.is_empty() || text.eq_ignore_ascii_case("all") {
        if batch_count == 0 {
            return Err(SelectionError::Empty);
        }
        return Ok((0..batch_count).collect());
    }

    let mut selected = Vec::new();
    for token in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let index: i64 = token
            .parse()
            .map_err(|_| SelectionError::NotANumber(token.to_string()))?;
        if index < 1 || index > batch_count as i64 {
            return Err(SelectionError::OutOfRange {
                index,
                count: batch_count,
            });
        }
        let zero_based = (index - 1) as usize;
        if !selected.contains(&zero_based) {
            selected.push(zero_based);
        }
    }
    if selected.is_empty() {
        return Err(SelectionError::Empty);
    }
    Ok(selected)
}
