//! `code_run`: run the project's tests or an isolated snippet.

use std::io::Write;

use serde_json::json;
use tracing::debug;

use crate::core::types::{Arguments, FailureKind, ToolResult};
use crate::io::sandbox::run_confined;
use crate::tools::shell::process_result;
use crate::tools::{ToolContext, str_arg};

pub fn code_run(arguments: &Arguments, ctx: &ToolContext<'_>) -> ToolResult {
    match str_arg(arguments, "mode") {
        Some("test") => run_tests(ctx),
        Some("snippet") => match str_arg(arguments, "code") {
            Some(code) => run_snippet(code, ctx),
            None => ToolResult::failure(
                FailureKind::InvalidArguments,
                "missing required argument: code",
            ),
        },
        other => ToolResult::failure(
            FailureKind::InvalidArguments,
            format!("unsupported mode: {}", other.unwrap_or("<none>")),
        ),
    }
}

fn run_tests(ctx: &ToolContext<'_>) -> ToolResult {
    let argv = &ctx.settings.code_run.test_command;
    if argv.is_empty() {
        return ToolResult::failure(FailureKind::Io, "code_run: no test command configured");
    }
    debug!(command = %argv.join(" "), "running test suite");
    execute(argv, ctx)
}

/// The snippet file lives in the system temp dir so it never lands in the root.
fn run_snippet(code: &str, ctx: &ToolContext<'_>) -> ToolResult {
    let settings = &ctx.settings.code_run;
    if settings.snippet_command.is_empty() {
        return ToolResult::failure(FailureKind::Io, "code_run: no snippet command configured");
    }

    let suffix = format!(".{}", settings.snippet_extension);
    let mut file = match tempfile::Builder::new()
        .prefix("coder-snippet-")
        .suffix(&suffix)
        .tempfile()
    {
        Ok(file) => file,
        Err(err) => {
            return ToolResult::failure(FailureKind::Io, format!("code_run: temp file: {err}"));
        }
    };
    if let Err(err) = file.write_all(code.as_bytes()).and_then(|()| file.flush()) {
        return ToolResult::failure(FailureKind::Io, format!("code_run: temp file: {err}"));
    }

    let mut argv = settings.snippet_command.clone();
    argv.push(file.path().to_string_lossy().into_owned());
    debug!(bytes = code.len(), path = %file.path().display(), "running snippet");
    // `file` is removed on drop, after the process has exited.
    execute(&argv, ctx)
}

fn execute(argv: &[String], ctx: &ToolContext<'_>) -> ToolResult {
    match run_confined(ctx.policy, argv, ctx.timeout, ctx.settings.output_limit_bytes) {
        Ok(output) => process_result(&output),
        Err(err) => ToolResult::failure(
            FailureKind::Io,
            format!("spawn failed: {err:#}"),
        )
        .with_payload(json!({ "command": argv })),
    }
}
