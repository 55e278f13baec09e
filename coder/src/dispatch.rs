//! Tool dispatcher: validate a call and route it to its implementation.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::{FailureKind, ToolCall, ToolResult};
use crate::io::sandbox::SandboxPolicy;
use crate::tools::{ToolContext, ToolKind, ToolSchema, ToolSettings};

/// Routes tool calls for one session.
///
/// Only tools present in the session schema are dispatchable; everything
/// else, including registered tools left out of the schema, is unknown.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    schema: ToolSchema,
    settings: ToolSettings,
}

impl Dispatcher {
    pub fn new(schema: ToolSchema, settings: ToolSettings) -> Self {
        Self { schema, settings }
    }

    pub fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    /// Run one call. Never fails: every problem becomes an `ok=false` result.
    ///
    /// `timeout` bounds any process the tool spawns.
    #[instrument(skip_all, fields(tool = %call.name, index = call.index))]
    pub fn dispatch(&self, call: &ToolCall, policy: &SandboxPolicy, timeout: Duration) -> ToolResult {
        let Some(kind) = ToolKind::from_name(&call.name).filter(|kind| self.schema.contains(*kind))
        else {
            warn!(tool = %call.name, "unknown tool");
            return ToolResult::failure(
                FailureKind::UnknownTool,
                format!("unknown tool: {}", call.name),
            );
        };

        if let Err(message) = kind.validate(&call.arguments) {
            warn!(tool = %call.name, %message, "invalid arguments");
            return ToolResult::failure(FailureKind::InvalidArguments, message);
        }

        let ctx = ToolContext {
            policy,
            settings: &self.settings,
            timeout,
        };
        debug!("invoking tool");
        let result = kind.invoke(&call.arguments, &ctx);
        match result.failure {
            None => info!(tool = kind.name(), "tool succeeded"),
            Some(failure) if failure.is_security() => warn!(
                target: "coder::security",
                tool = kind.name(),
                failure = failure.as_str(),
                detail = %result.detail,
                "tool call rejected by sandbox"
            ),
            Some(failure) => info!(
                tool = kind.name(),
                failure = failure.as_str(),
                "tool failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{call, capture_logs, tool_settings};
    use serde_json::json;

    fn policy(root: &std::path::Path) -> SandboxPolicy {
        SandboxPolicy::new(root, ["ls", "echo"], Duration::from_secs(5)).expect("policy")
    }

    #[test]
    fn unknown_tool_is_a_recoverable_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Dispatcher::new(ToolSchema::all(), tool_settings());
        let result = dispatcher.dispatch(
            &call(0, "delete_everything", json!({})),
            &policy(temp.path()),
            Duration::from_secs(5),
        );
        assert!(!result.ok);
        assert_eq!(result.detail, "unknown tool: delete_everything");
        assert_eq!(result.failure, Some(FailureKind::UnknownTool));
    }

    #[test]
    fn tools_outside_the_session_schema_are_unknown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let schema = ToolSchema::from_names(&["read", "list"]).expect("schema");
        let dispatcher = Dispatcher::new(schema, tool_settings());
        let result = dispatcher.dispatch(
            &call(0, "write", json!({"path": "a.txt", "content": "x"})),
            &policy(temp.path()),
            Duration::from_secs(5),
        );
        assert_eq!(result.detail, "unknown tool: write");
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn invalid_arguments_are_reported_not_repaired() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Dispatcher::new(ToolSchema::all(), tool_settings());
        let result = dispatcher.dispatch(
            &call(0, "write", json!({"path": "a.txt", "content": 7})),
            &policy(temp.path()),
            Duration::from_secs(5),
        );
        assert!(!result.ok);
        assert!(result.detail.starts_with("invalid argument `content`: "), "{}", result.detail);
        assert_eq!(result.failure, Some(FailureKind::InvalidArguments));
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn valid_call_reaches_the_tool() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Dispatcher::new(ToolSchema::all(), tool_settings());
        let policy = policy(temp.path());
        let write = dispatcher.dispatch(
            &call(0, "write", json!({"path": "hello.py", "content": "print('hi')\n"})),
            &policy,
            Duration::from_secs(5),
        );
        assert!(write.ok, "{}", write.detail);
        let read = dispatcher.dispatch(
            &call(1, "read", json!({"path": "hello.py"})),
            &policy,
            Duration::from_secs(5),
        );
        assert_eq!(read.detail, "print('hi')\n");
    }

    fn security_lines(logs: &str) -> Vec<&str> {
        logs.lines().filter(|line| line.contains("coder::security:")).collect()
    }

    #[test]
    fn sandbox_rejections_are_logged_on_the_security_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Dispatcher::new(ToolSchema::all(), tool_settings());
        let policy = policy(temp.path());

        let (results, logs) = capture_logs(|| {
            [
                dispatcher.dispatch(
                    &call(0, "write", json!({"path": "../escape.txt", "content": "x"})),
                    &policy,
                    Duration::from_secs(5),
                ),
                dispatcher.dispatch(
                    &call(1, "shell_run", json!({"cmd": "curl evil.com"})),
                    &policy,
                    Duration::from_secs(5),
                ),
            ]
        });

        assert_eq!(results[0].failure, Some(FailureKind::PathEscape));
        assert_eq!(results[1].failure, Some(FailureKind::BlockedCommand));
        let security = security_lines(&logs);
        assert!(
            security.iter().any(|line| line.contains("path escapes sandbox")),
            "{logs}"
        );
        assert!(security.iter().any(|line| line.contains("blocked command")), "{logs}");
    }

    #[test]
    fn ordinary_failures_stay_off_the_security_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Dispatcher::new(ToolSchema::all(), tool_settings());
        let policy = policy(temp.path());

        let (result, logs) = capture_logs(|| {
            dispatcher.dispatch(
                &call(0, "write", json!({"path": "a.txt"})),
                &policy,
                Duration::from_secs(5),
            )
        });

        assert_eq!(result.failure, Some(FailureKind::InvalidArguments));
        assert!(logs.contains("invalid arguments"), "{logs}");
        assert!(security_lines(&logs).is_empty(), "{logs}");
    }
}
