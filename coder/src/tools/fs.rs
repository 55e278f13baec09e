//! File tools: `read`, `write`, `list`.
//!
//! Every path goes through [`resolve_path`] before any filesystem call.

use std::fs;
use std::io::ErrorKind;

use serde_json::json;
use tracing::debug;

use crate::core::types::{Arguments, FailureKind, ToolResult};
use crate::io::sandbox::resolve_path;
use crate::tools::{ToolContext, str_arg};

pub fn read(arguments: &Arguments, ctx: &ToolContext<'_>) -> ToolResult {
    let requested = str_arg(arguments, "path").unwrap_or_default();
    let path = match resolve_path(ctx.policy, requested) {
        Ok(path) => path,
        Err(violation) => return violation.into_result(),
    };

    if !path.exists() {
        return ToolResult::failure(FailureKind::Io, format!("read: not found: {requested}"));
    }
    if !path.is_file() {
        return ToolResult::failure(FailureKind::Io, format!("read: not a file: {requested}"));
    }
    match fs::read(&path) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => {
                debug!(path = %path.display(), bytes = text.len(), "read file");
                ToolResult::success(text)
            }
            Err(_) => ToolResult::failure(
                FailureKind::Io,
                format!("read: not valid UTF-8: {requested}"),
            ),
        },
        Err(err) => ToolResult::failure(FailureKind::Io, format!("read: {requested}: {err}")),
    }
}

pub fn write(arguments: &Arguments, ctx: &ToolContext<'_>) -> ToolResult {
    let requested = str_arg(arguments, "path").unwrap_or_default();
    let content = str_arg(arguments, "content").unwrap_or_default();
    let path = match resolve_path(ctx.policy, requested) {
        Ok(path) => path,
        Err(violation) => return violation.into_result(),
    };

    if path.is_dir() {
        return ToolResult::failure(
            FailureKind::Io,
            format!("write: is a directory: {requested}"),
        );
    }
    if let Some(parent) = path.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        return ToolResult::failure(
            FailureKind::Io,
            format!("write: create {}: {err}", parent.display()),
        );
    }
    if let Err(err) = fs::write(&path, content) {
        return ToolResult::failure(FailureKind::Io, format!("write: {requested}: {err}"));
    }

    let bytes = content.len();
    let lines = line_count(content);
    debug!(path = %path.display(), bytes, lines, "wrote file");
    ToolResult::success(format!("wrote {requested} ({lines} lines, {bytes} bytes)"))
        .with_payload(json!({ "path": requested, "lines": lines, "bytes": bytes }))
}

pub fn list(arguments: &Arguments, ctx: &ToolContext<'_>) -> ToolResult {
    let requested = str_arg(arguments, "path").unwrap_or(".");
    let path = match resolve_path(ctx.policy, requested) {
        Ok(path) => path,
        Err(violation) => return violation.into_result(),
    };

    let entries = match fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return ToolResult::failure(FailureKind::Io, format!("list: not found: {requested}"));
        }
        Err(_) if !path.is_dir() => {
            return ToolResult::failure(
                FailureKind::Io,
                format!("list: not a directory: {requested}"),
            );
        }
        Err(err) => {
            return ToolResult::failure(FailureKind::Io, format!("list: {requested}: {err}"));
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                return ToolResult::failure(FailureKind::Io, format!("list: {requested}: {err}"));
            }
        };
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    ToolResult::success(names.join("\n")).with_payload(json!({ "entries": names }))
}

/// Lines in `content`; a trailing partial line counts as one.
fn line_count(content: &str) -> usize {
    if content.is_empty() {
        return 0;
    }
    let newlines = content.matches('\n').count();
    if content.ends_with('\n') {
        newlines
    } else {
        newlines + 1
    }
}
