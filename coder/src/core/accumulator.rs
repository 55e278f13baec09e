//! Per-index accumulation of streamed tool-call fragments.
//!
//! Fragments for the same call index are concatenated as raw text. Nothing is
//! interpreted until [`CallAccumulator::finish`], the single flush point at the
//! end of a turn. Calls come out in ascending index order regardless of the
//! order in which their fragments arrived.

use std::collections::BTreeMap;

use tracing::warn;

use crate::core::lenient::{ArgumentsQuality, interpret_arguments};
use crate::core::types::{ToolCall, TurnWarning};

#[derive(Debug, Default)]
struct Slot {
    id: Option<String>,
    name: String,
    arguments: String,
    /// Set once a complete value was delivered for this index.
    complete: bool,
}

impl Slot {
    fn holds_value(&self) -> bool {
        self.complete || (!self.name.is_empty() && !self.arguments.is_empty())
    }

    /// A delta restarts the slot after a complete value, or when it carries a
    /// different call id than the one already stored.
    fn restarted_by(&self, id: Option<&str>) -> bool {
        if self.complete {
            return true;
        }
        match (self.id.as_deref(), id.filter(|id| !id.is_empty())) {
            (Some(stored), Some(incoming)) => stored != incoming && self.holds_value(),
            _ => false,
        }
    }
}

/// Collects tool-call fragments for one turn.
#[derive(Debug, Default)]
pub struct CallAccumulator {
    slots: BTreeMap<usize, Slot>,
    warnings: Vec<TurnWarning>,
}

impl CallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a partial fragment for `index`.
    ///
    /// A fragment on an index that already holds a complete value, or one that
    /// carries a new call id, replaces the stored value. Repeating the stored
    /// name is not a restart: some servers send `function.name` in every chunk.
    pub fn push_delta(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: &str,
    ) {
        let slot = self.slots.entry(index).or_default();
        if slot.restarted_by(id) {
            warn!(index, "duplicate tool call index, keeping the latest value");
            self.warnings.push(TurnWarning::DuplicateIndex { index });
            let keep_id = slot.id.take();
            let keep_name = std::mem::take(&mut slot.name);
            *slot = Slot::default();
            if name.is_none() {
                slot.name = keep_name;
                slot.id = keep_id;
            }
        }

        if let Some(id) = id.filter(|id| !id.is_empty()) {
            slot.id = Some(id.to_string());
        }
        if let Some(name) = name.filter(|name| *name != slot.name) {
            slot.name.push_str(name);
        }
        slot.arguments.push_str(arguments);
    }

    /// Record a complete call for `index`, replacing anything accumulated so far.
    pub fn push_complete(&mut self, index: usize, id: Option<&str>, name: &str, arguments: &str) {
        let slot = self.slots.entry(index).or_default();
        if slot.holds_value() {
            warn!(index, "duplicate tool call index, keeping the latest value");
            self.warnings.push(TurnWarning::DuplicateIndex { index });
        }
        *slot = Slot {
            id: id.filter(|id| !id.is_empty()).map(str::to_string),
            name: name.to_string(),
            arguments: arguments.to_string(),
            complete: true,
        };
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Interpret every slot once and return the calls in index order.
    pub fn finish(self) -> (Vec<ToolCall>, Vec<TurnWarning>) {
        let mut warnings = self.warnings;
        let mut calls = Vec::with_capacity(self.slots.len());

        for (index, slot) in self.slots {
            let (arguments, quality) = interpret_arguments(&slot.arguments);
            match quality {
                ArgumentsQuality::Exact => {}
                ArgumentsQuality::Recovered => {
                    warn!(index, name = %slot.name, "tool call arguments recovered leniently");
                    warnings.push(TurnWarning::ArgumentsRecovered { index });
                }
                ArgumentsQuality::Unparsed => {
                    warn!(index, name = %slot.name, "tool call arguments could not be parsed");
                    warnings.push(TurnWarning::ArgumentsUnparsed { index });
                }
            }
            let name = slot.name.trim().to_string();
            if name.is_empty() {
                warnings.push(TurnWarning::MissingName { index });
            }
            calls.push(ToolCall {
                index,
                id: slot.id,
                name,
                arguments,
            });
        }

        (calls, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ARGS: &str = r#"{"path": "hello.txt", "content": "hi there"}"#;

    fn single_fragment() -> ToolCall {
        let mut acc = CallAccumulator::new();
        acc.push_delta(0, Some("call_0"), Some("write"), ARGS);
        let (mut calls, warnings) = acc.finish();
        assert!(warnings.is_empty());
        calls.remove(0)
    }

    #[test]
    fn three_fragments_match_one_fragment() {
        let expected = single_fragment();
        let splits = [(1, 2), (5, 30), (0, 0), (17, 18), (ARGS.len() - 1, ARGS.len())];
        for (a, b) in splits {
            let mut acc = CallAccumulator::new();
            acc.push_delta(0, Some("call_0"), Some("write"), &ARGS[..a]);
            acc.push_delta(0, None, None, &ARGS[a..b]);
            acc.push_delta(0, None, None, &ARGS[b..]);
            let (calls, warnings) = acc.finish();
            assert!(warnings.is_empty(), "split {a}/{b}: {warnings:?}");
            assert_eq!(calls, vec![expected.clone()], "split {a}/{b}");
        }
    }

    #[test]
    fn byte_sized_fragments_match_one_fragment() {
        let expected = single_fragment();
        let mut acc = CallAccumulator::new();
        acc.push_delta(0, Some("call_0"), Some("write"), "");
        for ch in ARGS.chars() {
            acc.push_delta(0, None, None, &ch.to_string());
        }
        let (calls, _) = acc.finish();
        assert_eq!(calls, vec![expected]);
    }

    #[test]
    fn calls_flush_in_index_order_not_arrival_order() {
        let mut acc = CallAccumulator::new();
        acc.push_delta(1, None, Some("read"), r#"{"path":"#);
        acc.push_delta(0, None, Some("write"), r#"{"path": "a", "#);
        acc.push_delta(1, None, None, r#""a"}"#);
        acc.push_delta(0, None, None, r#""content": "x"}"#);
        let (calls, _) = acc.finish();
        let order: Vec<(usize, &str)> = calls.iter().map(|c| (c.index, c.name.as_str())).collect();
        assert_eq!(order, vec![(0, "write"), (1, "read")]);
        assert_eq!(calls[1].arguments.get("path"), Some(&json!("a")));
    }

    #[test]
    fn complete_duplicate_keeps_last_value_and_warns() {
        let mut acc = CallAccumulator::new();
        acc.push_complete(0, None, "read", r#"{"path": "old.txt"}"#);
        acc.push_complete(0, None, "read", r#"{"path": "new.txt"}"#);
        let (calls, warnings) = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments.get("path"), Some(&json!("new.txt")));
        assert_eq!(warnings, vec![TurnWarning::DuplicateIndex { index: 0 }]);
    }

    #[test]
    fn restarted_delta_after_complete_replaces_value() {
        let mut acc = CallAccumulator::new();
        acc.push_complete(0, Some("c1"), "read", r#"{"path": "old.txt"}"#);
        acc.push_delta(0, None, None, r#"{"path": "#);
        acc.push_delta(0, None, None, r#""new.txt"}"#);
        let (calls, warnings) = acc.finish();
        assert_eq!(calls[0].name, "read");
        assert_eq!(calls[0].id.as_deref(), Some("c1"));
        assert_eq!(calls[0].arguments.get("path"), Some(&json!("new.txt")));
        assert_eq!(warnings, vec![TurnWarning::DuplicateIndex { index: 0 }]);
    }

    #[test]
    fn repeated_name_in_every_chunk_is_not_a_restart() {
        let mut acc = CallAccumulator::new();
        acc.push_delta(0, Some("c1"), Some("write"), r#"{"path":"a.txt","#);
        acc.push_delta(0, None, Some("write"), r#""content":"hi"}"#);
        let (calls, warnings) = acc.finish();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(calls[0].name, "write");
        assert_eq!(calls[0].arguments.get("path"), Some(&json!("a.txt")));
        assert_eq!(calls[0].arguments.get("content"), Some(&json!("hi")));
    }

    #[test]
    fn name_sent_twice_before_arguments_is_not_doubled() {
        let mut acc = CallAccumulator::new();
        acc.push_delta(0, Some("c1"), Some("write"), "");
        acc.push_delta(0, Some("c1"), Some("write"), ARGS);
        let (calls, warnings) = acc.finish();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(calls[0].name, "write");
    }

    #[test]
    fn split_name_is_concatenated() {
        let mut acc = CallAccumulator::new();
        acc.push_delta(0, None, Some("shell"), "");
        acc.push_delta(0, None, Some("_run"), r#"{"cmd":"ls"}"#);
        let (calls, _) = acc.finish();
        assert_eq!(calls[0].name, "shell_run");
    }

    #[test]
    fn new_call_id_on_same_index_replaces_value() {
        let mut acc = CallAccumulator::new();
        acc.push_delta(0, Some("c1"), Some("read"), r#"{"path":"old.txt"}"#);
        acc.push_delta(0, Some("c2"), Some("write"), r#"{"path":"new.txt","content":""}"#);
        let (calls, warnings) = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id.as_deref(), Some("c2"));
        assert_eq!(calls[0].name, "write");
        assert_eq!(calls[0].arguments.get("path"), Some(&json!("new.txt")));
        assert_eq!(warnings, vec![TurnWarning::DuplicateIndex { index: 0 }]);
    }

    #[test]
    fn unparseable_arguments_surface_as_empty_call() {
        let mut acc = CallAccumulator::new();
        acc.push_delta(0, None, Some("write"), "<<<not arguments>>>");
        let (calls, warnings) = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "write");
        assert!(calls[0].arguments.is_empty());
        assert_eq!(warnings, vec![TurnWarning::ArgumentsUnparsed { index: 0 }]);
    }

    #[test]
    fn nameless_call_is_reported() {
        let mut acc = CallAccumulator::new();
        acc.push_delta(2, None, None, "{}");
        let (calls, warnings) = acc.finish();
        assert_eq!(calls[0].name, "");
        assert_eq!(warnings, vec![TurnWarning::MissingName { index: 2 }]);
    }
}
