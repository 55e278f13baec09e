//! Shared deterministic types for the execution engine.
//!
//! These types define stable contracts between the parser, dispatcher and
//! driver. They carry no I/O and serialize to the transcript format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool-call arguments as decoded from the model.
pub type Arguments = Map<String, Value>;

/// Author of a message in the session history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A structured tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call order within the turn.
    pub index: usize,
    /// Provider-assigned call id, echoed back on the tool message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments: Arguments,
}

/// One entry in the append-only session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool name, set on tool messages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the call a tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// Tool message answering `call` with the rendered `result`.
    pub fn tool(call: &ToolCall, result: &ToolResult) -> Self {
        Self {
            name: Some(call.name.clone()),
            tool_call_id: call.id.clone(),
            ..Self::plain(Role::Tool, result.render())
        }
    }
}

/// Classification of a failed tool call.
///
/// Every variant is recoverable: the result is fed back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownTool,
    InvalidArguments,
    PathEscape,
    BlockedCommand,
    Timeout,
    Io,
    NonZeroExit,
}

impl FailureKind {
    /// Sandbox rejections that must stand out in logs.
    pub fn is_security(self) -> bool {
        matches!(self, FailureKind::PathEscape | FailureKind::BlockedCommand)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::UnknownTool => "unknown_tool",
            FailureKind::InvalidArguments => "invalid_arguments",
            FailureKind::PathEscape => "path_escape",
            FailureKind::BlockedCommand => "blocked_command",
            FailureKind::Timeout => "timeout",
            FailureKind::Io => "io",
            FailureKind::NonZeroExit => "non_zero_exit",
        }
    }
}

/// Outcome of one dispatched tool call. Always produced, never omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ToolResult {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            payload: None,
            failure: None,
        }
    }

    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
            payload: None,
            failure: Some(kind),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Text fed back to the model as the tool message content.
    pub fn render(&self) -> String {
        if self.ok {
            self.detail.clone()
        } else {
            format!("ERROR: {}", self.detail)
        }
    }
}

/// Why a session stopped (or `Running` while it has not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Running,
    Completed,
    StepBudgetExceeded,
    Error,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Running => "running",
            Termination::Completed => "completed",
            Termination::StepBudgetExceeded => "step_budget_exceeded",
            Termination::Error => "error",
        }
    }
}

/// Non-fatal anomalies noticed while assembling a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnWarning {
    /// A second value arrived for a call index that already held a complete value.
    DuplicateIndex { index: usize },
    /// Arguments were not a JSON object and were recovered by the lenient scanner.
    ArgumentsRecovered { index: usize },
    /// Arguments could not be interpreted at all and were left empty.
    ArgumentsUnparsed { index: usize },
    /// No tool name was ever streamed for this index.
    MissingName { index: usize },
}
