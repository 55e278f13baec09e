//! Tool registry and schema.
//!
//! The set of tools is closed: each [`ToolKind`] variant owns its name,
//! description, parameter spec and implementation. The schema advertised to
//! the model is generated from the same variants, so the advertised tools and
//! the dispatcher's registry cannot drift apart.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use jsonschema::{Validator, validator_for};
use serde_json::{Map, Value, json};

use crate::core::types::{Arguments, ToolResult};
use crate::io::sandbox::SandboxPolicy;

pub mod code;
pub mod fs;
pub mod shell;

/// Every tool the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKind {
    Read,
    Write,
    List,
    ShellRun,
    CodeRun,
}

/// JSON type accepted for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
}

impl ParamKind {
    pub fn json_type(self) -> &'static str {
        match self {
            ParamKind::String => "string",
        }
    }
}

/// Declared parameter of a tool.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
    /// Allowed values; empty means unrestricted.
    pub one_of: &'static [&'static str],
}

const PATH_PARAM: ParamSpec = ParamSpec {
    name: "path",
    kind: ParamKind::String,
    required: true,
    description: "Path relative to the sandbox root",
    one_of: &[],
};

const READ_PARAMS: &[ParamSpec] = &[PATH_PARAM];

const WRITE_PARAMS: &[ParamSpec] = &[
    PATH_PARAM,
    ParamSpec {
        name: "content",
        kind: ParamKind::String,
        required: true,
        description: "Full UTF-8 content of the file",
        one_of: &[],
    },
];

const LIST_PARAMS: &[ParamSpec] = &[ParamSpec {
    required: false,
    description: "Directory relative to the sandbox root (defaults to the root)",
    ..PATH_PARAM
}];

const SHELL_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "cmd",
    kind: ParamKind::String,
    required: true,
    description: "Command line; the program must be on the allow-list",
    one_of: &[],
}];

const CODE_PARAMS: &[ParamSpec] = &[
    ParamSpec {
        name: "mode",
        kind: ParamKind::String,
        required: true,
        description: "`test` runs the test suite, `snippet` runs `code`",
        one_of: &["test", "snippet"],
    },
    ParamSpec {
        name: "code",
        kind: ParamKind::String,
        required: false,
        description: "Source to execute when mode is `snippet`",
        one_of: &[],
    },
];

impl ToolKind {
    pub const ALL: [ToolKind; 5] = [
        ToolKind::Read,
        ToolKind::Write,
        ToolKind::List,
        ToolKind::ShellRun,
        ToolKind::CodeRun,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Read => "read",
            ToolKind::Write => "write",
            ToolKind::List => "list",
            ToolKind::ShellRun => "shell_run",
            ToolKind::CodeRun => "code_run",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::Read => "Read a UTF-8 text file.",
            ToolKind::Write => {
                "Write or overwrite a UTF-8 text file, creating parent directories."
            }
            ToolKind::List => "List a directory. Directories end with `/`.",
            ToolKind::ShellRun => {
                "Run an allow-listed command in the sandbox root (no shell features)."
            }
            ToolKind::CodeRun => "Run the test suite, or execute a code snippet in isolation.",
        }
    }

    pub fn params(self) -> &'static [ParamSpec] {
        match self {
            ToolKind::Read => READ_PARAMS,
            ToolKind::Write => WRITE_PARAMS,
            ToolKind::List => LIST_PARAMS,
            ToolKind::ShellRun => SHELL_PARAMS,
            ToolKind::CodeRun => CODE_PARAMS,
        }
    }

    /// Check `arguments` against the JSON Schema advertised in
    /// [`ToolKind::declaration`].
    ///
    /// Returns a message naming the first offending argument. Unknown extra
    /// arguments are ignored.
    pub fn validate(self, arguments: &Arguments) -> Result<(), String> {
        let validator = VALIDATORS
            .iter()
            .find(|validator| validator.kind == self)
            .ok_or_else(|| format!("no argument schema for tool {}", self.name()))?;
        validator.check(arguments)
    }

    /// Run the tool with already-validated arguments.
    pub fn invoke(self, arguments: &Arguments, ctx: &ToolContext<'_>) -> ToolResult {
        match self {
            ToolKind::Read => fs::read(arguments, ctx),
            ToolKind::Write => fs::write(arguments, ctx),
            ToolKind::List => fs::list(arguments, ctx),
            ToolKind::ShellRun => shell::shell_run(arguments, ctx),
            ToolKind::CodeRun => code::code_run(arguments, ctx),
        }
    }

    /// OpenAI-style function declaration for this tool.
    pub fn declaration(self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in self.params() {
            let mut prop = json!({
                "type": param.kind.json_type(),
                "description": param.description,
            });
            if !param.one_of.is_empty() {
                prop["enum"] = json!(param.one_of);
            }
            properties.insert(param.name.to_string(), prop);
            if param.required {
                required.push(param.name);
            }
        }
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            },
        })
    }
}

/// Compiled argument schemas for one tool.
///
/// Each property is compiled on its own so a failure can name the argument it
/// belongs to; the whole `parameters` object catches anything else.
struct ArgumentValidator {
    kind: ToolKind,
    required: Vec<String>,
    properties: Vec<(String, Validator)>,
    whole: Validator,
}

impl ArgumentValidator {
    fn compile(kind: ToolKind) -> Result<Self> {
        let declaration = kind.declaration();
        let parameters = &declaration["function"]["parameters"];
        let whole = validator_for(parameters)
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("compile parameters schema for {}", kind.name()))?;
        let required = parameters["required"]
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let mut properties = Vec::new();
        if let Some(props) = parameters["properties"].as_object() {
            for (name, schema) in props {
                let validator = validator_for(schema)
                    .map_err(|err| anyhow::anyhow!("{err}"))
                    .with_context(|| format!("compile schema for {}.{name}", kind.name()))?;
                properties.push((name.clone(), validator));
            }
        }
        Ok(Self {
            kind,
            required,
            properties,
            whole,
        })
    }

    fn check(&self, arguments: &Arguments) -> Result<(), String> {
        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !arguments.contains_key(name.as_str()))
        {
            return Err(format!("missing required argument: {missing}"));
        }
        for (name, validator) in &self.properties {
            let Some(value) = arguments.get(name) else {
                continue;
            };
            if let Some(err) = validator.iter_errors(value).next() {
                return Err(format!("invalid argument `{name}`: {err}"));
            }
        }
        let instance = Value::Object(arguments.clone());
        if let Some(err) = self.whole.iter_errors(&instance).next() {
            return Err(format!("invalid arguments: {err}"));
        }
        Ok(())
    }
}

static VALIDATORS: LazyLock<Vec<ArgumentValidator>> = LazyLock::new(|| {
    ToolKind::ALL
        .into_iter()
        .map(|kind| ArgumentValidator::compile(kind).expect("tool parameter schema should compile"))
        .collect()
});

/// The tools advertised to the model for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchema {
    tools: Vec<ToolKind>,
}

impl ToolSchema {
    pub fn all() -> Self {
        Self {
            tools: ToolKind::ALL.to_vec(),
        }
    }

    /// Build a schema from tool names; any name without an implementation is
    /// a configuration error.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut tools = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            let Some(kind) = ToolKind::from_name(name) else {
                bail!(
                    "tool schema names unregistered tool `{name}` (known: {})",
                    ToolKind::ALL.map(ToolKind::name).join(", ")
                );
            };
            if !tools.contains(&kind) {
                tools.push(kind);
            }
        }
        if tools.is_empty() {
            bail!("tool schema must name at least one tool");
        }
        Ok(Self { tools })
    }

    pub fn tools(&self) -> &[ToolKind] {
        &self.tools
    }

    pub fn contains(&self, kind: ToolKind) -> bool {
        self.tools.contains(&kind)
    }

    /// Declarations sent to the model each turn.
    pub fn declarations(&self) -> Vec<Value> {
        self.tools.iter().map(|kind| kind.declaration()).collect()
    }
}

/// Settings for `code_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRunSettings {
    /// Command that runs the project's test suite in the root.
    pub test_command: Vec<String>,
    /// Interpreter invocation; the snippet file path is appended.
    pub snippet_command: Vec<String>,
    /// File extension for snippet files (without the dot).
    pub snippet_extension: String,
}

/// Operator-controlled tool settings, fixed for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub output_limit_bytes: usize,
    pub code_run: CodeRunSettings,
}

/// Everything a tool needs for one call.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    pub policy: &'a SandboxPolicy,
    pub settings: &'a ToolSettings,
    /// Timeout for this call, already clamped to the session deadline.
    pub timeout: Duration,
}

/// Fetch a string argument that validation has already checked.
pub(crate) fn str_arg<'a>(arguments: &'a Arguments, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(Value::as_str)
}
