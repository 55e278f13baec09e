//! `shell_run`: allow-listed commands executed without a shell.

use serde_json::json;

use crate::core::types::{Arguments, FailureKind, ToolResult};
use crate::io::process::CommandOutput;
use crate::io::sandbox::{check_command, run_confined};
use crate::tools::{ToolContext, str_arg};

pub fn shell_run(arguments: &Arguments, ctx: &ToolContext<'_>) -> ToolResult {
    let cmd = str_arg(arguments, "cmd").unwrap_or_default();
    let argv = match check_command(ctx.policy, cmd) {
        Ok(argv) => argv,
        Err(violation) => return violation.into_result(),
    };
    match run_confined(ctx.policy, &argv, ctx.timeout, ctx.settings.output_limit_bytes) {
        Ok(output) => process_result(&output),
        Err(err) => ToolResult::failure(FailureKind::Io, format!("spawn failed: {err:#}")),
    }
}

/// Map a finished process to a tool result. `ok` is exit code zero.
pub(crate) fn process_result(output: &CommandOutput) -> ToolResult {
    let stdout = output.stdout_text();
    let stderr = output.stderr_text();
    let payload = json!({
        "stdout": stdout,
        "stderr": stderr,
        "exit_code": output.status.code(),
        "timed_out": output.timed_out,
    });

    if output.timed_out {
        return ToolResult::failure(FailureKind::Timeout, "timeout").with_payload(payload);
    }

    let code = output.exit_code();
    let streams = format!("STDOUT:\n{stdout}\nSTDERR:\n{stderr}");
    if output.success() {
        ToolResult::success(format!("OK (code {code})\n{streams}")).with_payload(payload)
    } else {
        ToolResult::failure(FailureKind::NonZeroExit, format!("exit code {code}\n{streams}"))
            .with_payload(payload)
    }
}
