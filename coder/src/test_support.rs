//! Test helpers: scripted model endpoint and small builders.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::parser::Fragment;
use crate::core::types::{Arguments, Message, ToolCall};
use crate::io::model::{ChatRequest, FragmentStream, ModelEndpoint};
use crate::io::sandbox::SandboxPolicy;
use crate::tools::{CodeRunSettings, ToolSettings};

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream these fragments, then close.
    Fragments(Vec<Fragment>),
    /// Stream these fragments, then fail with `message`.
    FailMidStream {
        fragments: Vec<Fragment>,
        message: String,
    },
    /// Fail before any fragment is produced.
    Refuse(String),
}

/// Model endpoint that replays queued turns and records every request.
///
/// Running out of turns is a transport error, so a test that expects fewer
/// model calls than scripted fails loudly instead of hanging.
pub struct ScriptedModel {
    turns: RefCell<VecDeque<ScriptedTurn>>,
    requests: RefCell<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Message histories sent so far, one per model call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.borrow().len()
    }
}

impl ModelEndpoint for ScriptedModel {
    fn open_stream(&self, request: &ChatRequest<'_>) -> Result<FragmentStream> {
        self.requests.borrow_mut().push(request.messages.to_vec());
        let turn = self
            .turns
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model has no more turns"))?;
        match turn {
            ScriptedTurn::Fragments(fragments) => Ok(Box::new(fragments.into_iter().map(Ok))),
            ScriptedTurn::FailMidStream { fragments, message } => Ok(Box::new(
                fragments
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(anyhow!(message)))),
            )),
            ScriptedTurn::Refuse(message) => Err(anyhow!(message)),
        }
    }
}

/// A turn with plain text and no tool calls.
pub fn text_turn(content: &str) -> ScriptedTurn {
    ScriptedTurn::Fragments(vec![Fragment::Content(content.to_string()), Fragment::End])
}

/// A turn whose calls each arrive as a single delta, indexed in order.
pub fn call_turn(calls: &[(&str, Value)]) -> ScriptedTurn {
    let mut fragments: Vec<Fragment> = calls
        .iter()
        .enumerate()
        .map(|(index, (name, arguments))| Fragment::CallDelta {
            index,
            id: None,
            name: Some((*name).to_string()),
            arguments: arguments.to_string(),
        })
        .collect();
    fragments.push(Fragment::End);
    ScriptedTurn::Fragments(fragments)
}

/// Split `arguments` into deltas of at most `chunk` bytes for one call.
pub fn chunked_call(index: usize, name: &str, arguments: &str, chunk: usize) -> Vec<Fragment> {
    let bytes = arguments.as_bytes();
    let mut fragments = Vec::new();
    let mut start = 0;
    while start < bytes.len() || fragments.is_empty() {
        let mut end = (start + chunk.max(1)).min(bytes.len());
        while !arguments.is_char_boundary(end) {
            end += 1;
        }
        fragments.push(Fragment::CallDelta {
            index,
            id: None,
            name: (start == 0).then(|| name.to_string()),
            arguments: arguments[start..end].to_string(),
        });
        start = end;
    }
    fragments
}

/// Arguments map from a JSON object literal.
pub fn args(value: Value) -> Arguments {
    match value {
        Value::Object(map) => map,
        other => panic!("expected JSON object, got {other}"),
    }
}

pub fn call(index: usize, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        index,
        id: None,
        name: name.to_string(),
        arguments: args(arguments),
    }
}

/// Settings with `sh` as snippet interpreter so tests need no Python.
pub fn tool_settings() -> ToolSettings {
    ToolSettings {
        output_limit_bytes: 64 * 1024,
        code_run: CodeRunSettings {
            test_command: vec!["sh".to_string(), "-c".to_string(), "echo tests passed".to_string()],
            snippet_command: vec!["sh".to_string()],
            snippet_extension: "sh".to_string(),
        },
    }
}

pub fn policy(root: &Path, allowed_commands: &[&str]) -> SandboxPolicy {
    SandboxPolicy::new(root, allowed_commands.iter().copied(), Duration::from_secs(10))
        .expect("sandbox policy")
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("log buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread-local subscriber and return its formatted log lines.
///
/// Lines carry the event target, e.g. `coder::security: blocked command`.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = SharedBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_target(true)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.0.lock().map(|b| b.clone()).unwrap_or_default();
    (value, String::from_utf8_lossy(&bytes).into_owned())
}
