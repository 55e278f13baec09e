//! Prompt rendering for the seeded system and user messages.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::io::sandbox::SandboxPolicy;
use crate::tools::ToolSchema;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const INSTRUCTION_TEMPLATE: &str = include_str!("prompts/instruction.md");

/// Task text from the planner plus its optional plan steps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instruction {
    pub text: String,
    pub plan: Vec<String>,
}

impl Instruction {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            plan: Vec::new(),
        }
    }

    pub fn with_plan(mut self, plan: Vec<String>) -> Self {
        self.plan = plan;
        self
    }
}

#[derive(Debug, Serialize)]
struct ParamContext {
    name: &'static str,
    description: &'static str,
    required: bool,
    one_of: &'static [&'static str],
}

#[derive(Debug, Serialize)]
struct ToolContext {
    name: &'static str,
    description: &'static str,
    params: Vec<ParamContext>,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("instruction", INSTRUCTION_TEMPLATE)
            .expect("instruction template should be valid");
        Self { env }
    }
}

/// System message: tools, containment rules and the termination rule.
pub fn render_system_prompt(
    schema: &ToolSchema,
    policy: &SandboxPolicy,
    step_budget: u32,
) -> Result<String> {
    let tools: Vec<ToolContext> = schema
        .tools()
        .iter()
        .map(|kind| ToolContext {
            name: kind.name(),
            description: kind.description(),
            params: kind
                .params()
                .iter()
                .map(|param| ParamContext {
                    name: param.name,
                    description: param.description,
                    required: param.required,
                    one_of: param.one_of,
                })
                .collect(),
        })
        .collect();
    let commands: Vec<&str> = policy.allowed_commands().iter().map(String::as_str).collect();

    let engine = PromptEngine::new();
    let rendered = engine.env.get_template("system")?.render(context! {
        root => policy.root().display().to_string(),
        commands => commands,
        timeout_secs => policy.per_call_timeout().as_secs().max(1),
        tools => tools,
        step_budget => step_budget,
    })?;
    Ok(rendered.trim().to_string())
}

/// Initial user message.
pub fn render_instruction(instruction: &Instruction) -> Result<String> {
    let plan: Vec<&str> = instruction
        .plan
        .iter()
        .map(|step| step.trim())
        .filter(|step| !step.is_empty())
        .collect();
    let engine = PromptEngine::new();
    let rendered = engine.env.get_template("instruction")?.render(context! {
        task => instruction.text.trim(),
        plan => plan,
    })?;
    Ok(rendered.trim().to_string())
}
