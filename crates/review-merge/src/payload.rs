use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractionError {
    #[error("no valid JSON payload found")]
    NoCandidate,
    #[error("JSON payload candidate is malformed: {0}")]
    Malformed(String),
}

fn is_review_payload(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => {
            obj.get("assessments").map(Value::is_object).unwrap_or(false)
                && obj.get("findings").map(Value::is_array).unwrap_or(false)
        }
        None => false,
    }
}

/// True when `text` opens like a JSON object: `{`, a quoted key, then `:`.
fn opens_with_object_key(text: &str) -> bool {
    let Some(rest) = text.strip_prefix('{') else {
        return false;
    };
    let rest = rest.trim_start();
    if !rest.starts_with('"') {
        return false;
    }
    let mut keys = serde_json::Deserializer::from_str(rest).into_iter::<String>();
    match keys.next() {
        Some(Ok(_)) => rest[keys.byte_offset()..].trim_start().starts_with(':'),
        _ => false,
    }
}

/// Pull the review payload out of free-form agent output.
///
/// Every `{` is tried as the start of a JSON value. A decoded object that has
/// an `assessments` object and a `findings` array is a candidate; the scan
/// resumes after its end so its own nested objects are never candidates. A
/// decoded object that is not a payload is stepped into, so a payload wrapped
/// in an envelope is still found. The **last** candidate in the text wins.
///
/// Braces in prose are not candidates: a decode failure only counts as
/// [`ExtractionError::Malformed`] when the text at that `{` opened with a
/// quoted key and a colon.
pub fn extract_payload(raw: &str) -> Result<Map<String, Value>, ExtractionError> {
    let mut pos = 0usize;
    let mut found: Option<Map<String, Value>> = None;
    let mut last_error: Option<String> = None;

    while let Some(offset) = raw[pos..].find('{') {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) if is_review_payload(&value) => {
                let end = start + stream.byte_offset();
                if let Value::Object(map) = value {
                    found = Some(map);
                }
                pos = end.max(start + 1);
            }
            Some(Ok(_)) => pos = start + 1,
            Some(Err(err)) => {
                if opens_with_object_key(&raw[start..]) {
                    last_error = Some(err.to_string());
                }
                pos = start + 1;
            }
            None => pos = start + 1,
        }
    }

    match found {
        Some(map) => Ok(map),
        None => {
            let err = match last_error {
                Some(message) => ExtractionError::Malformed(message),
                None => ExtractionError::NoCandidate,
            };
            warn!(error = %err, "failed to extract review payload from runner output");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_surrounded_by_prose_is_extracted() {
        let raw = "Here is my review:\n{\"assessments\": {\"naming\": 80}, \"findings\": []}\nThanks!";
        let payload = extract_payload(raw).expect("payload");
        assert_eq!(payload.get("assessments"), Some(&json!({"naming": 80})));
    }

    #[test]
    fn last_structurally_valid_candidate_wins() {
        let raw = concat!(
            "draft: {\"assessments\": {\"naming\": 10}, \"findings\": []}\n",
            "noise {\"not\": \"a payload\"}\n",
            "final: {\"assessments\": {\"naming\": 90}, \"findings\": [{\"dimension\": \"naming\"}]}"
        );
        let payload = extract_payload(raw).expect("payload");
        assert_eq!(payload.get("assessments"), Some(&json!({"naming": 90})));
    }

    #[test]
    fn payload_inside_envelope_is_found() {
        let raw = r#"{"result": {"assessments": {"naming": 70}, "findings": []}, "ok": true}"#;
        let payload = extract_payload(raw).expect("payload");
        assert_eq!(payload.get("assessments"), Some(&json!({"naming": 70})));
    }

    #[test]
    fn objects_lacking_required_shape_are_ignored() {
        let raw = r#"{"assessments": [], "findings": []} {"assessments": {}}"#;
        assert_eq!(extract_payload(raw), Err(ExtractionError::NoCandidate));
    }

    #[test]
    fn missing_versus_malformed_are_distinguished() {
        assert_eq!(
            extract_payload("the agent produced no json"),
            Err(ExtractionError::NoCandidate)
        );
        let err = extract_payload(r#"{"assessments": {"naming": 80}, "findings": [}"#)
            .expect_err("malformed");
        assert!(matches!(err, ExtractionError::Malformed(_)));
    }

    #[test]
    fn braces_in_prose_are_not_malformed_candidates() {
        assert_eq!(
            extract_payload("Use a struct like {name, id} or a set {a}; nothing else."),
            Err(ExtractionError::NoCandidate)
        );
        assert_eq!(
            extract_payload(r#"The template was { "assessments" } and then I stopped."#),
            Err(ExtractionError::NoCandidate)
        );
        let err = extract_payload("partial output {\"assessments\": {\"naming\": 8")
            .expect_err("truncated");
        assert!(matches!(err, ExtractionError::Malformed(_)));
    }
}
