//! Interpretation of accumulated tool-call argument text.
//!
//! Arguments are interpreted exactly once per call, after every fragment for
//! the call has been concatenated. Strict JSON is tried first; text that is not
//! a JSON object falls back to a key/value scan. Nothing here fills in missing
//! values: whatever cannot be read is left out so validation can report it.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::core::types::Arguments;

/// How the argument text was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentsQuality {
    /// The text was a JSON object (or empty).
    Exact,
    /// The text was recovered by unwrapping or scanning.
    Recovered,
    /// Nothing usable was found; arguments are empty.
    Unparsed,
}

static PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        (?: "(?P<dq_key>[A-Za-z_][\w-]*)" | '(?P<sq_key>[A-Za-z_][\w-]*)' | \b(?P<key>[A-Za-z_][\w-]*) )
        \s* [:=] \s*
        (?: "(?P<dq>(?:[^"\\]|\\.)*)(?:"|$)
          | '(?P<sq>(?:[^'\\]|\\.)*)(?:'|$)
          | (?P<bare>[^\s,}\]]+) )
        "#,
    )
    .expect("argument pair regex should be valid")
});

/// Interpret `raw` as a tool-call argument mapping.
pub fn interpret_arguments(raw: &str) -> (Arguments, ArgumentsQuality) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (Arguments::new(), ArgumentsQuality::Exact);
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => return (map, ArgumentsQuality::Exact),
        // Some servers double-encode: the arguments arrive as a JSON string
        // whose content is the object.
        Ok(Value::String(inner)) => {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&inner) {
                return (map, ArgumentsQuality::Recovered);
            }
            return scan_pairs(&inner);
        }
        Ok(_) => return (Arguments::new(), ArgumentsQuality::Unparsed),
        Err(_) => {}
    }

    scan_pairs(trimmed)
}

fn scan_pairs(text: &str) -> (Arguments, ArgumentsQuality) {
    let mut arguments = Arguments::new();
    for caps in PAIR_RE.captures_iter(text) {
        let Some(key) = caps
            .name("dq_key")
            .or_else(|| caps.name("sq_key"))
            .or_else(|| caps.name("key"))
        else {
            continue;
        };
        arguments.insert(key.as_str().to_string(), pair_value(&caps));
    }

    if arguments.is_empty() {
        (arguments, ArgumentsQuality::Unparsed)
    } else {
        (arguments, ArgumentsQuality::Recovered)
    }
}

fn pair_value(caps: &Captures<'_>) -> Value {
    if let Some(dq) = caps.name("dq") {
        let quoted = format!("\"{}\"", dq.as_str());
        return serde_json::from_str::<String>(&quoted)
            .map(Value::String)
            .unwrap_or_else(|_| Value::String(dq.as_str().to_string()));
    }
    if let Some(sq) = caps.name("sq") {
        return Value::String(sq.as_str().replace("\\'", "'"));
    }
    let bare = caps.name("bare").map(|m| m.as_str()).unwrap_or_default();
    match serde_json::from_str::<Value>(bare) {
        Ok(scalar @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => scalar,
        _ => Value::String(bare.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_object_is_exact() {
        let (args, quality) = interpret_arguments(r#"{"path": "a.txt", "content": "hi"}"#);
        assert_eq!(quality, ArgumentsQuality::Exact);
        assert_eq!(args.get("path"), Some(&json!("a.txt")));
        assert_eq!(args.get("content"), Some(&json!("hi")));
    }

    #[test]
    fn empty_text_is_an_empty_object() {
        let (args, quality) = interpret_arguments("   ");
        assert!(args.is_empty());
        assert_eq!(quality, ArgumentsQuality::Exact);
    }

    #[test]
    fn double_encoded_object_is_unwrapped() {
        let (args, quality) = interpret_arguments(r#""{\"cmd\": \"ls -la\"}""#);
        assert_eq!(quality, ArgumentsQuality::Recovered);
        assert_eq!(args.get("cmd"), Some(&json!("ls -la")));
    }

    #[test]
    fn truncated_json_is_scanned() {
        let (args, quality) = interpret_arguments(r#"{"path": "notes.md", "content": "line one\nline"#);
        assert_eq!(quality, ArgumentsQuality::Recovered);
        assert_eq!(args.get("path"), Some(&json!("notes.md")));
        assert_eq!(args.get("content"), Some(&json!("line one\nline")));
    }

    #[test]
    fn keyword_style_pairs_are_scanned() {
        let (args, quality) = interpret_arguments(r#"path='src/main.py', mode=snippet, retries=3"#);
        assert_eq!(quality, ArgumentsQuality::Recovered);
        assert_eq!(args.get("path"), Some(&json!("src/main.py")));
        assert_eq!(args.get("mode"), Some(&json!("snippet")));
        assert_eq!(args.get("retries"), Some(&json!(3)));
    }

    #[test]
    fn quoted_values_hide_inner_separators() {
        let (args, _) = interpret_arguments(r#"{path: "a.txt", content: "key: value, other=1"}"#);
        assert_eq!(args.len(), 2);
        assert_eq!(args.get("content"), Some(&json!("key: value, other=1")));
    }

    #[test]
    fn garbage_is_unparsed() {
        let (args, quality) = interpret_arguments("!!! ???");
        assert!(args.is_empty());
        assert_eq!(quality, ArgumentsQuality::Unparsed);
    }

    #[test]
    fn non_object_json_is_unparsed() {
        let (args, quality) = interpret_arguments("[1, 2, 3]");
        assert!(args.is_empty());
        assert_eq!(quality, ArgumentsQuality::Unparsed);
    }
}
