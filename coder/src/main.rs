//! `coder`: run a sandboxed tool-calling session against a local model.
//!
//! Without `--apply` the command is a dry run: it prints the seeded prompts
//! and the tool schema and never contacts the model.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use coder::core::types::Termination;
use coder::driver::{ExecuteRequest, SessionEvent, execute};
use coder::exit_codes;
use coder::io::config::{CoderConfig, default_config_path, load_config, write_config};
use coder::io::model::HttpModel;
use coder::io::prompt::{Instruction, render_instruction, render_system_prompt};
use coder::io::sandbox::SandboxPolicy;
use coder::io::transcript::write_summary;
use coder::logging;
use coder::tools::ToolSchema;

#[derive(Parser)]
#[command(
    name = "coder",
    version,
    about = "Sandboxed tool-calling execution engine for local models"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config to `<root>/.coder/config.toml` if missing.
    Init {
        /// Sandbox root to initialise.
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one session for TASK (dry run unless --apply).
    Run(RunArgs),
    /// Print the tool schema advertised to the model as JSON.
    Tools {
        /// Comma-separated subset of tools.
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Free-text instruction for the model.
    task: String,
    /// Contact the model and execute tool calls.
    #[arg(long)]
    apply: bool,
    /// Maximum number of dispatched tool-calling turns.
    #[arg(long)]
    max_steps: Option<u32>,
    /// Sandbox root; every tool operation is confined to it.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Config file (defaults to `<root>/.coder/config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Wall-clock budget for the whole session.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Model name override.
    #[arg(long)]
    model: Option<String>,
    /// Comma-separated subset of tools to advertise.
    #[arg(long, value_delimiter = ',')]
    tools: Vec<String>,
    /// Plan step to include in the instruction (repeatable).
    #[arg(long = "plan-step")]
    plan: Vec<String>,
    /// Write the session summary and transcript as JSON.
    #[arg(long)]
    transcript: Option<PathBuf>,
}

fn main() {
    logging::init();
    let code = match Cli::try_parse() {
        Ok(cli) => match run(cli) {
            Ok(code) => code,
            Err(err) => {
                eprintln!("{err:#}");
                exit_codes::ERROR
            }
        },
        Err(err) => {
            let _ = err.print();
            if err.use_stderr() {
                exit_codes::ERROR
            } else {
                exit_codes::OK
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { root, force } => cmd_init(&root, force),
        Command::Run(args) => cmd_run(args),
        Command::Tools { tools } => cmd_tools(&tools),
    }
}

fn schema_from(tools: &[String]) -> Result<ToolSchema> {
    if tools.is_empty() {
        Ok(ToolSchema::all())
    } else {
        ToolSchema::from_names(tools)
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    if !root.is_dir() {
        bail!("sandbox root {} is not a directory", root.display());
    }
    let path = default_config_path(root);
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &CoderConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_tools(tools: &[String]) -> Result<i32> {
    let schema = schema_from(tools)?;
    let rendered =
        serde_json::to_string_pretty(&schema.declarations()).context("serialize tool schema")?;
    println!("{rendered}");
    Ok(exit_codes::OK)
}

fn load_run_config(args: &RunArgs) -> Result<CoderConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&args.root));
    let mut cfg = load_config(&path)?;
    if let Some(max_steps) = args.max_steps {
        cfg.step_budget = max_steps;
    }
    if let Some(timeout_secs) = args.timeout_secs {
        cfg.session_timeout_secs = timeout_secs;
    }
    if let Some(model) = &args.model {
        cfg.model.model = model.clone();
    }
    cfg.validate().context("invalid command-line overrides")?;
    Ok(cfg)
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    if args.task.trim().is_empty() {
        bail!("task must not be empty");
    }
    let cfg = load_run_config(&args)?;
    let schema = schema_from(&args.tools)?;
    let policy = SandboxPolicy::new(
        &args.root,
        cfg.sandbox.allowed_commands.iter().cloned(),
        cfg.per_call_timeout(),
    )?;
    let instruction = Instruction::new(args.task.clone()).with_plan(args.plan.clone());

    if !args.apply {
        let system = render_system_prompt(&schema, &policy, cfg.step_budget)?;
        let user = render_instruction(&instruction)?;
        let declarations = serde_json::to_string_pretty(&schema.declarations())
            .context("serialize tool schema")?;
        println!("# system\n{system}\n\n# user\n{user}\n\n# tools\n{declarations}");
        eprintln!("dry run: pass --apply to start the session");
        return Ok(exit_codes::OK);
    }

    let model = HttpModel::new(
        cfg.model.provider,
        cfg.model.base_url.clone(),
        cfg.model.model.clone(),
        cfg.api_key(),
    )?;
    let request = ExecuteRequest {
        instruction,
        schema,
        policy,
        step_budget: cfg.step_budget,
        settings: cfg.tool_settings(),
        request_timeout: cfg.request_timeout(),
        deadline: Some(Instant::now() + cfg.session_timeout()),
        inline_tool_calls: cfg.inline_tool_calls,
    };

    let started = Instant::now();
    let summary = execute(&model, request, print_event)?;

    if let Some(path) = &args.transcript {
        write_summary(path, &summary)?;
    }

    println!();
    println!(
        "{} after {} step(s) in {}",
        summary.termination.as_str(),
        summary.steps_taken,
        format_elapsed(started.elapsed())
    );
    if let Some(error) = &summary.error {
        eprintln!("error: {error}");
    }
    Ok(match summary.termination {
        Termination::Error => exit_codes::ERROR,
        _ => exit_codes::OK,
    })
}

fn print_event(event: &SessionEvent<'_>) {
    match event {
        SessionEvent::TurnStarted { turn } => eprintln!("--- turn {turn}"),
        SessionEvent::Content(text) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::ToolCall { step, call } => {
            let arguments = serde_json::Value::Object(call.arguments.clone());
            eprintln!("[step {step}] {} {}", call.name, truncate(&arguments.to_string(), 200));
        }
        SessionEvent::ToolResult { result, .. } => {
            let first_line = result.render().lines().next().unwrap_or_default().to_string();
            eprintln!("  -> {}", truncate(&first_line, 200));
        }
        SessionEvent::Terminated { .. } => {}
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.1}s", elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_parse_with_overrides() {
        let cli = Cli::try_parse_from([
            "coder",
            "run",
            "add tests",
            "--apply",
            "--max-steps",
            "3",
            "--tools",
            "read,write",
            "--plan-step",
            "read main.py",
        ])
        .expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.apply);
        assert_eq!(args.max_steps, Some(3));
        assert_eq!(args.tools, ["read", "write"]);
        assert_eq!(args.plan, ["read main.py"]);
        assert_eq!(args.root, PathBuf::from("."));
    }

    #[test]
    fn run_defaults_to_dry_run() {
        let cli = Cli::try_parse_from(["coder", "run", "task"]).expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(!args.apply);
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::try_parse_from(["coder", "init", "--force"]).expect("parse");
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
