//! Containment rules for every tool operation.
//!
//! The sandbox is stateless: each check reads the [`SandboxPolicy`] passed in
//! by the caller. Nothing here consults the process working directory, so
//! sessions with different roots can run side by side.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::core::types::{FailureKind, ToolResult};
use crate::io::config::CONFIG_DIR;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Symlink hops followed while resolving one path.
const MAX_SYMLINK_DEPTH: usize = 40;

/// Fixed containment policy for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    root: PathBuf,
    allowed_commands: BTreeSet<String>,
    per_call_timeout: Duration,
}

impl SandboxPolicy {
    /// Build a policy rooted at `root`, which must be an existing directory.
    ///
    /// The root is canonicalized so containment checks compare real paths.
    pub fn new<I, S>(root: &Path, allowed_commands: I, per_call_timeout: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let root = fs::canonicalize(root)
            .with_context(|| format!("resolve sandbox root {}", root.display()))?;
        if !root.is_dir() {
            bail!("sandbox root {} is not a directory", root.display());
        }
        if per_call_timeout.is_zero() {
            bail!("per-call timeout must be > 0");
        }
        Ok(Self {
            root,
            allowed_commands: allowed_commands.into_iter().map(Into::into).collect(),
            per_call_timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allowed_commands(&self) -> &BTreeSet<String> {
        &self.allowed_commands
    }

    pub fn per_call_timeout(&self) -> Duration {
        self.per_call_timeout
    }
}

/// A request the sandbox refused before doing any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxViolation {
    PathEscape { requested: String },
    BlockedCommand { command: String },
    MalformedCommand { command: String, reason: String },
}

impl fmt::Display for SandboxViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxViolation::PathEscape { .. } => write!(f, "path escapes sandbox"),
            SandboxViolation::BlockedCommand { command } => write!(f, "blocked: {command}"),
            SandboxViolation::MalformedCommand { command, reason } => {
                write!(f, "malformed command `{command}`: {reason}")
            }
        }
    }
}

impl std::error::Error for SandboxViolation {}

impl SandboxViolation {
    pub fn kind(&self) -> FailureKind {
        match self {
            SandboxViolation::PathEscape { .. } => FailureKind::PathEscape,
            SandboxViolation::BlockedCommand { .. } => FailureKind::BlockedCommand,
            SandboxViolation::MalformedCommand { .. } => FailureKind::InvalidArguments,
        }
    }

    pub fn into_result(self) -> ToolResult {
        ToolResult::failure(self.kind(), self.to_string())
    }
}

/// Resolve `requested` against the policy root.
///
/// Relative paths are joined to the root; absolute paths are taken as-is.
/// Components are walked one at a time: existing entries are canonicalized
/// (following symlinks), missing ones are appended lexically, and `..` pops
/// the resolved prefix. The final path must equal the root or lie below it,
/// and must stay out of the engine's config directory under the root.
pub fn resolve_path(policy: &SandboxPolicy, requested: &str) -> Result<PathBuf, SandboxViolation> {
    let escape = || {
        warn!(
            target: "coder::security",
            requested,
            root = %policy.root.display(),
            "path escapes sandbox"
        );
        SandboxViolation::PathEscape {
            requested: requested.to_string(),
        }
    };

    let requested_path = Path::new(requested);
    let start = if requested_path.is_absolute() {
        PathBuf::from("/")
    } else {
        policy.root.clone()
    };
    let resolved = walk(start, requested_path, 0).ok_or_else(escape)?;

    if resolved.starts_with(&policy.root) && !in_config_dir(policy, &resolved) {
        debug!(requested, resolved = %resolved.display(), "path resolved");
        Ok(resolved)
    } else {
        Err(escape())
    }
}

/// True when `resolved` is the config directory or lies below it, either
/// literally or through a symlinked `.coder`.
fn in_config_dir(policy: &SandboxPolicy, resolved: &Path) -> bool {
    let literal = policy.root.join(CONFIG_DIR);
    if resolved.starts_with(&literal) {
        return true;
    }
    walk(policy.root.clone(), Path::new(CONFIG_DIR), 0)
        .is_some_and(|target| target != policy.root && resolved.starts_with(target))
}

/// Walk `path` from `base`. Returns `None` when a symlink cannot be resolved.
fn walk(mut resolved: PathBuf, path: &Path, depth: usize) -> Option<PathBuf> {
    if depth > MAX_SYMLINK_DEPTH {
        return None;
    }
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => resolved = PathBuf::from(prefix.as_os_str()),
            Component::RootDir => resolved.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                match fs::symlink_metadata(&candidate) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        let target = fs::read_link(&candidate).ok()?;
                        // A relative link target is relative to the link's directory.
                        resolved = walk(resolved, &target, depth + 1)?;
                    }
                    // Missing entries are appended lexically so new files can be created.
                    _ => resolved = candidate,
                }
            }
        }
    }
    Some(resolved)
}

/// Split `command` with POSIX shell quoting and check its program name
/// against the allow-list.
///
/// Returns the argv to execute. Only the first token is checked; quoting only
/// decides word boundaries since no shell ever sees the line.
pub fn check_command(policy: &SandboxPolicy, command: &str) -> Result<Vec<String>, SandboxViolation> {
    let argv = shlex::split(command).ok_or_else(|| SandboxViolation::MalformedCommand {
        command: command.to_string(),
        reason: "unbalanced quotes or trailing backslash".to_string(),
    })?;
    let allowed = argv
        .first()
        .is_some_and(|program| policy.allowed_commands.contains(program));
    if !allowed {
        warn!(target: "coder::security", command, "blocked command");
        return Err(SandboxViolation::BlockedCommand {
            command: command.to_string(),
        });
    }
    Ok(argv)
}

/// Spawn `argv` inside the sandbox root with a scrubbed environment.
///
/// The process gets no shell, stdin is closed, and only `PATH`, `LANG` and a
/// `HOME` pointing at the root are inherited.
pub fn run_confined(
    policy: &SandboxPolicy,
    argv: &[String],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .context("empty command line")?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&policy.root)
        .env_clear()
        .env("HOME", &policy.root);
    for key in ["PATH", "LANG"] {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    debug!(program = %program, args = args.len(), "running confined process");
    run_command_with_timeout(cmd, timeout, output_limit_bytes)
        .with_context(|| format!("run {program}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(root: &Path) -> SandboxPolicy {
        SandboxPolicy::new(root, ["ls", "echo", "cat"], Duration::from_secs(5)).expect("policy")
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = policy(temp.path());
        let resolved = resolve_path(&policy, "src/new/file.txt").expect("resolve");
        assert_eq!(resolved, policy.root().join("src/new/file.txt"));
    }

    #[test]
    fn root_itself_is_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = policy(temp.path());
        assert_eq!(resolve_path(&policy, ".").expect("resolve"), policy.root());
        assert_eq!(resolve_path(&policy, "").expect("resolve"), policy.root());
    }

    #[test]
    fn parent_segments_cannot_climb_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = policy(temp.path());
        for p in ["../../evil.txt", "a/../../evil.txt", "a/b/../../../x", ".."] {
            let err = resolve_path(&policy, p).unwrap_err();
            assert_eq!(err.to_string(), "path escapes sandbox", "{p}");
        }
        assert!(resolve_path(&policy, "a/b/../../inside.txt").is_ok());
    }

    #[test]
    fn absolute_paths_must_be_inside_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = policy(temp.path());
        assert!(resolve_path(&policy, "/etc/passwd").is_err());
        let inside = policy.root().join("ok.txt");
        let resolved = resolve_path(&policy, inside.to_str().expect("utf8")).expect("resolve");
        assert_eq!(resolved, inside);
    }

    #[test]
    fn config_directory_is_off_limits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = policy(temp.path());
        for p in [".coder", ".coder/config.toml", "./.coder/new.toml", "a/../.coder/x"] {
            let err = resolve_path(&policy, p).unwrap_err();
            assert_eq!(err.kind(), FailureKind::PathEscape, "{p}");
        }
        assert!(resolve_path(&policy, ".coderrc").is_ok());
        assert!(resolve_path(&policy, "sub/.coder/config.toml").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_config_directory_is_off_limits() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("settings")).expect("mkdir");
        std::os::unix::fs::symlink("settings", temp.path().join(".coder")).expect("symlink");
        let policy = policy(temp.path());
        assert!(resolve_path(&policy, "settings/config.toml").is_err());
        assert!(resolve_path(&policy, ".coder/config.toml").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_pointing_outside_are_rejected() {
        let outside = tempfile::tempdir().expect("outside");
        let temp = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");
        let policy = policy(temp.path());
        let err = resolve_path(&policy, "link/secret.txt").unwrap_err();
        assert_eq!(err.kind(), FailureKind::PathEscape);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_to_outside_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink("/nonexistent-coder-target/x", temp.path().join("dangling"))
            .expect("symlink");
        let policy = policy(temp.path());
        assert!(resolve_path(&policy, "dangling").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_inside_root_are_followed() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("real")).expect("mkdir");
        std::os::unix::fs::symlink("real", temp.path().join("alias")).expect("symlink");
        let policy = policy(temp.path());
        let resolved = resolve_path(&policy, "alias/f.txt").expect("resolve");
        assert_eq!(resolved, policy.root().join("real/f.txt"));
    }

    #[test]
    fn only_first_token_is_checked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = policy(temp.path());
        assert_eq!(
            check_command(&policy, "echo rm -rf /").expect("allowed"),
            vec!["echo", "rm", "-rf", "/"]
        );
        let err = check_command(&policy, "rm -rf /").unwrap_err();
        assert_eq!(err.to_string(), "blocked: rm -rf /");
        assert!(check_command(&policy, "/bin/ls").is_err());
        assert!(check_command(&policy, "   ").is_err());
    }

    #[test]
    fn quoting_decides_word_boundaries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = policy(temp.path());
        assert_eq!(
            check_command(&policy, r#"echo "hello world" 'a b' c\ d ''"#).expect("allowed"),
            vec!["echo", "hello world", "a b", "c d", ""]
        );
        // Shell operators are plain words; nothing interprets them.
        assert_eq!(
            check_command(&policy, "ls; rm -rf /").unwrap_err().kind(),
            FailureKind::BlockedCommand
        );
    }

    #[test]
    fn malformed_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = policy(temp.path());
        for line in ["echo 'unterminated", "echo \"oops", "echo trailing\\"] {
            let err = check_command(&policy, line).unwrap_err();
            assert_eq!(err.kind(), FailureKind::InvalidArguments, "{line}");
        }
    }

    #[test]
    fn policy_requires_existing_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("missing");
        assert!(SandboxPolicy::new(&missing, ["ls"], Duration::from_secs(1)).is_err());
        assert!(SandboxPolicy::new(temp.path(), ["ls"], Duration::ZERO).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn confined_process_runs_in_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let policy = policy(temp.path());
        let argv = check_command(&policy, "ls").expect("allowed");
        let output =
            run_confined(&policy, &argv, Duration::from_secs(5), 10_000).expect("run");
        assert!(output.success());
        assert!(output.stdout_text().contains("marker.txt"));
    }
}
