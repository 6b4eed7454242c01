//! Extra HTTP headers attached to every profile upload.
//!
//! Host bindings pass headers as a single JSON object string (for example
//! `{"X-Scope-OrgID":"team-a"}`) so that arbitrary header names and values survive the
//! C ABI without a bespoke delimiter format.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpHeadersError {
    #[error("http headers are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http headers must be a JSON object, got {0}")]
    NotAnObject(String),
    #[error("http header '{0}' must have a string value")]
    NonStringValue(String),
}

/// Parses a JSON object of string to string into a header map.
///
/// An empty (or whitespace-only) input yields an empty map. Any other input must be a
/// JSON object whose values are all strings.
///
/// ```
/// use pyroscope_agent_native::config::http_headers::parse_http_headers_json;
///
/// let headers = parse_http_headers_json(r#"{"X-Scope-OrgID":"team-a"}"#).unwrap();
/// assert_eq!(headers["X-Scope-OrgID"], "team-a");
/// assert!(parse_http_headers_json("").unwrap().is_empty());
/// assert!(parse_http_headers_json("[1,2]").is_err());
/// ```
pub fn parse_http_headers_json(input: &str) -> Result<HashMap<String, String>, HttpHeadersError> {
    if input.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let object = match serde_json::from_str::<Value>(input)? {
        Value::Object(object) => object,
        other => return Err(HttpHeadersError::NotAnObject(json_kind(&other).to_string())),
    };

    object
        .into_iter()
        .map(|(name, value)| match value {
            Value::String(value) => Ok((name, value)),
            _ => Err(HttpHeadersError::NonStringValue(name)),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
