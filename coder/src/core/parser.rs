//! Assemble one model turn from an ordered fragment stream.
//!
//! The parser is transport agnostic: endpoint adapters decode their wire
//! format into [`Fragment`]s and the parser only sees those.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::accumulator::CallAccumulator;
use crate::core::types::{ToolCall, TurnWarning};

/// One incremental piece of a streamed model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Assistant text, appended in arrival order.
    Content(String),
    /// Partial tool call; fields concatenate per `index`.
    CallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// Whole tool call delivered at once.
    Call {
        index: usize,
        id: Option<String>,
        name: String,
        arguments: String,
    },
    /// Explicit end-of-turn marker.
    End,
}

/// Everything the model produced in one turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Turn {
    pub content: String,
    /// Ascending by index.
    pub tool_calls: Vec<ToolCall>,
    pub warnings: Vec<TurnWarning>,
    /// False when the stream ended without an explicit end marker.
    pub ended_cleanly: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TurnParser {
    /// Lift `<tool_call>{...}</tool_call>` blocks out of the content when the
    /// turn has no structured calls.
    pub inline_tool_calls: bool,
}

static INLINE_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("inline tool call regex")
});

impl TurnParser {
    pub fn new(inline_tool_calls: bool) -> Self {
        Self { inline_tool_calls }
    }

    /// Consume fragments until the end marker or end of stream.
    ///
    /// `on_content` sees each content fragment as it arrives. A stream error
    /// aborts the turn and is returned to the caller.
    pub fn parse<I, F>(&self, stream: I, mut on_content: F) -> Result<Turn>
    where
        I: IntoIterator<Item = Result<Fragment>>,
        F: FnMut(&str),
    {
        let mut content = String::new();
        let mut calls = CallAccumulator::new();
        let mut ended_cleanly = false;
        let mut fragments = 0usize;

        for fragment in stream {
            let fragment = fragment.context("model stream failed mid-turn")?;
            fragments += 1;
            match fragment {
                Fragment::Content(text) => {
                    on_content(&text);
                    content.push_str(&text);
                }
                Fragment::CallDelta {
                    index,
                    id,
                    name,
                    arguments,
                } => calls.push_delta(index, id.as_deref(), name.as_deref(), &arguments),
                Fragment::Call {
                    index,
                    id,
                    name,
                    arguments,
                } => calls.push_complete(index, id.as_deref(), &name, &arguments),
                Fragment::End => {
                    ended_cleanly = true;
                    break;
                }
            }
        }
        if !ended_cleanly {
            debug!(fragments, "stream closed without end marker, treating as end of turn");
        }

        if self.inline_tool_calls && calls.is_empty() {
            content = extract_inline_calls(&content, &mut calls);
        }

        let (tool_calls, warnings) = calls.finish();
        debug!(
            fragments,
            content_len = content.len(),
            tool_calls = tool_calls.len(),
            warnings = warnings.len(),
            "turn assembled"
        );
        Ok(Turn {
            content,
            tool_calls,
            warnings,
            ended_cleanly,
        })
    }
}

/// Move parseable `<tool_call>` blocks into `calls` and return the remaining text.
///
/// Blocks that are not a JSON object with a `name` stay in the content.
fn extract_inline_calls(content: &str, calls: &mut CallAccumulator) -> String {
    let mut remaining = String::with_capacity(content.len());
    let mut last = 0;
    let mut index = 0;

    for captures in INLINE_CALL_RE.captures_iter(content) {
        let (Some(block), Some(body)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body.as_str()) else {
            warn!(body = body.as_str(), "unparseable inline tool call left in content");
            continue;
        };
        let Some(name) = object.get("name").and_then(Value::as_str) else {
            continue;
        };
        let arguments = match object.get("arguments") {
            Some(Value::String(raw)) => raw.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        calls.push_complete(index, None, name, &arguments);
        index += 1;
        remaining.push_str(&content[last..block.start()]);
        last = block.end();
    }
    remaining.push_str(&content[last..]);

    if index > 0 {
        debug!(calls = index, "extracted inline tool calls");
        remaining.trim().to_string()
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn delta(index: usize, name: Option<&str>, arguments: &str) -> Result<Fragment> {
        Ok(Fragment::CallDelta {
            index,
            id: None,
            name: name.map(str::to_string),
            arguments: arguments.to_string(),
        })
    }

    fn parse(fragments: Vec<Result<Fragment>>) -> Turn {
        TurnParser::default().parse(fragments, |_| {}).expect("parse")
    }

    #[test]
    fn fragmented_and_whole_arguments_assemble_identically() {
        let split = parse(vec![
            delta(0, Some("write"), r#"{"path":"#),
            delta(0, None, r#""a.txt","content""#),
            delta(0, None, r#":"hi"}"#),
            Ok(Fragment::End),
        ]);
        let whole = parse(vec![
            delta(0, Some("write"), r#"{"path":"a.txt","content":"hi"}"#),
            Ok(Fragment::End),
        ]);
        assert_eq!(split.tool_calls, whole.tool_calls);
        assert_eq!(
            serde_json::Value::Object(split.tool_calls[0].arguments.clone()),
            json!({"path": "a.txt", "content": "hi"})
        );
        assert!(split.warnings.is_empty());
    }

    #[test]
    fn calls_come_out_in_index_order() {
        let turn = parse(vec![
            delta(1, Some("read"), r#"{"path":"b"}"#),
            delta(0, Some("list"), "{}"),
            Ok(Fragment::End),
        ]);
        let names: Vec<_> = turn.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["list", "read"]);
    }

    #[test]
    fn content_is_streamed_and_concatenated() {
        let mut seen = Vec::new();
        let turn = TurnParser::default()
            .parse(
                vec![
                    Ok(Fragment::Content("Hel".into())),
                    Ok(Fragment::Content("lo".into())),
                    Ok(Fragment::End),
                ],
                |text| seen.push(text.to_string()),
            )
            .expect("parse");
        assert_eq!(turn.content, "Hello");
        assert_eq!(seen, ["Hel", "lo"]);
        assert!(turn.tool_calls.is_empty());
        assert!(turn.ended_cleanly);
    }

    #[test]
    fn end_of_stream_without_marker_ends_the_turn() {
        let turn = parse(vec![delta(0, Some("list"), "{}")]);
        assert!(!turn.ended_cleanly);
        assert_eq!(turn.tool_calls.len(), 1);
    }

    #[test]
    fn fragments_after_end_marker_are_ignored() {
        let turn = parse(vec![
            Ok(Fragment::Content("done".into())),
            Ok(Fragment::End),
            Ok(Fragment::Content("late".into())),
        ]);
        assert_eq!(turn.content, "done");
    }

    #[test]
    fn stream_error_is_fatal() {
        let err = TurnParser::default()
            .parse(
                vec![
                    Ok(Fragment::Content("partial".into())),
                    Err(anyhow!("connection reset")),
                ],
                |_| {},
            )
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection reset"));
    }

    #[test]
    fn whole_call_replaces_prior_value_with_warning() {
        let turn = parse(vec![
            Ok(Fragment::Call {
                index: 0,
                id: Some("a".into()),
                name: "read".into(),
                arguments: r#"{"path":"old"}"#.into(),
            }),
            Ok(Fragment::Call {
                index: 0,
                id: Some("b".into()),
                name: "read".into(),
                arguments: r#"{"path":"new"}"#.into(),
            }),
            Ok(Fragment::End),
        ]);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].arguments["path"], "new");
        assert_eq!(turn.warnings, [TurnWarning::DuplicateIndex { index: 0 }]);
    }

    #[test]
    fn inline_calls_are_lifted_when_enabled() {
        let text = "Let me look.\n<tool_call>\n{\"name\": \"list\", \"arguments\": {\"path\": \".\"}}\n</tool_call>";
        let turn = TurnParser::new(true)
            .parse(vec![Ok(Fragment::Content(text.into())), Ok(Fragment::End)], |_| {})
            .expect("parse");
        assert_eq!(turn.content, "Let me look.");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "list");
        assert_eq!(turn.tool_calls[0].arguments["path"], ".");

        let plain = TurnParser::new(false)
            .parse(vec![Ok(Fragment::Content(text.into()))], |_| {})
            .expect("parse");
        assert!(plain.tool_calls.is_empty());
        assert_eq!(plain.content, text);
    }

    #[test]
    fn inline_extraction_skips_turns_with_structured_calls() {
        let turn = TurnParser::new(true)
            .parse(
                vec![
                    Ok(Fragment::Content(
                        "<tool_call>{\"name\": \"read\", \"arguments\": {}}</tool_call>".into(),
                    )),
                    delta(0, Some("list"), "{}"),
                ],
                |_| {},
            )
            .expect("parse");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "list");
    }

    #[test]
    fn unparseable_inline_block_stays_in_content() {
        let text = "<tool_call>not json</tool_call>";
        let turn = TurnParser::new(true)
            .parse(vec![Ok(Fragment::Content(text.into()))], |_| {})
            .expect("parse");
        assert!(turn.tool_calls.is_empty());
        assert_eq!(turn.content, text);
    }
}
