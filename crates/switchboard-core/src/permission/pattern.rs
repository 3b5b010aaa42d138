//! Allowlist pattern matching.
//!
//! Patterns are plain strings, not regexes:
//! - `*` matches any invocation
//! - `npm *` matches `npm` itself and anything starting with `npm `
//! - anything else must equal the invocation after whitespace normalization
//!
//! Matching is case-sensitive.

use serde_json::Value;

/// Object fields consulted, in order, when deriving an invocation string.
const INVOCATION_FIELDS: &[&str] = &["command", "file_path", "path", "url", "pattern", "query"];

/// Trim and collapse runs of whitespace to a single space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Check whether `pattern` matches `invocation`.
pub fn matches(pattern: &str, invocation: &str) -> bool {
    let pattern = normalize(pattern);
    if pattern == "*" {
        return true;
    }

    let invocation = normalize(invocation);
    match pattern.strip_suffix(" *") {
        Some(prefix) => {
            invocation == prefix
                || (invocation.starts_with(prefix) && invocation[prefix.len()..].starts_with(' '))
        }
        None => pattern == invocation,
    }
}

/// The string a rule is matched against for a tool call.
pub fn invocation_for(args: Option<&Value>) -> String {
    let Some(args) = args else {
        return String::new();
    };

    match args {
        Value::String(s) => s.clone(),
        Value::Object(map) => INVOCATION_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| args.to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
