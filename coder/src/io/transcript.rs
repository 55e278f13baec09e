//! Session transcript persistence.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::driver::SessionSummary;

/// Write the summary (transcript included) as pretty JSON.
pub fn write_summary(path: &Path, summary: &SessionSummary) -> Result<()> {
    write_json(path, summary)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize transcript")?;
    buf.push('\n');
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
