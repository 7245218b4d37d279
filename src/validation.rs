use serde_json::Value;

use crate::error::ApiError;

/// Normalize a `scope`/`scopes` input field that may arrive as a JSON
/// array or as a legacy space-separated string into an ordered list.
/// Every outbound response and claim set emits a JSON array; this is
/// the only place a string form is tolerated.
pub fn parse_scopes(value: Option<&Value>) -> Result<Vec<String>, ApiError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_owned).ok_or_else(|| ApiError::Validation("scope entries must be strings".into())))
            .collect(),
        Some(Value::String(s)) => Ok(s.split_whitespace().map(str::to_owned).filter(|s| !s.is_empty()).collect()),
        Some(_) => Err(ApiError::Validation("scope must be an array or a space-separated string".into())),
    }
}

pub fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::Validation(format!("{field} is required")));
    }
    Ok(())
}

pub fn require_min_len(field: &str, value: &str, min: usize) -> Result<(), ApiError> {
    if value.len() < min {
        return Err(ApiError::Validation(format!("{field} must be at least {min} characters")));
    }
    Ok(())
}
