//! Conversation driver: one `execute` call runs one session to termination.
//!
//! The loop alternates between asking the model for a turn and dispatching
//! that turn's tool calls. It stops when a turn carries no tool calls
//! (`completed`), when the step budget is spent (`step_budget_exceeded`), or
//! on a transport failure or expired deadline (`error`). Tool failures never
//! stop the loop; they are fed back to the model as results.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::budget::clamp_to_deadline;
use crate::core::parser::TurnParser;
use crate::core::session::{DispatchGate, ExecutionSession};
use crate::core::types::{
    FailureKind, Message, Termination, ToolCall, ToolResult, TurnWarning,
};
use crate::dispatch::Dispatcher;
use crate::io::model::{ChatRequest, ModelEndpoint};
use crate::io::prompt::{Instruction, render_instruction, render_system_prompt};
use crate::io::sandbox::SandboxPolicy;
use crate::tools::{ToolSchema, ToolSettings};

/// Inputs for one session.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub instruction: Instruction,
    pub schema: ToolSchema,
    pub policy: SandboxPolicy,
    pub step_budget: u32,
    pub settings: ToolSettings,
    /// Upper bound for each model call.
    pub request_timeout: Duration,
    /// Wall-clock deadline for the whole session.
    pub deadline: Option<Instant>,
    pub inline_tool_calls: bool,
}

/// Progress reported while a session runs.
#[derive(Debug, Clone, Copy)]
pub enum SessionEvent<'a> {
    /// A model call is about to start; `turn` counts from 1.
    TurnStarted { turn: u32 },
    /// Streamed assistant text.
    Content(&'a str),
    ToolCall { step: u32, call: &'a ToolCall },
    ToolResult {
        step: u32,
        call: &'a ToolCall,
        result: &'a ToolResult,
    },
    Terminated {
        termination: Termination,
        steps_taken: u32,
    },
}

/// A turn warning tagged with the model turn it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWarning {
    pub turn: u32,
    #[serde(flatten)]
    pub warning: TurnWarning,
}

/// Outcome of a session, including the full transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub steps_taken: u32,
    pub terminal_message: String,
    pub termination: Termination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub transcript: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SessionWarning>,
}

/// Run one session against `model`.
///
/// Returns `Err` only when the session cannot start (prompt rendering) or the
/// state machine is misused. Transport failures and deadline expiry end the
/// session with `Termination::Error` and the partial transcript.
#[instrument(skip_all, fields(root = %request.policy.root().display(), step_budget = request.step_budget))]
pub fn execute<M, F>(model: &M, request: ExecuteRequest, mut on_event: F) -> Result<SessionSummary>
where
    M: ModelEndpoint + ?Sized,
    F: FnMut(&SessionEvent<'_>),
{
    let ExecuteRequest {
        instruction,
        schema,
        policy,
        step_budget,
        settings,
        request_timeout,
        deadline,
        inline_tool_calls,
    } = request;

    let system_prompt = render_system_prompt(&schema, &policy, step_budget)?;
    let user_message = render_instruction(&instruction)?;
    let dispatcher = Dispatcher::new(schema, settings);
    let declarations = dispatcher.schema().declarations();
    let parser = TurnParser::new(inline_tool_calls);

    let mut session = ExecutionSession::new(system_prompt, user_message, step_budget);
    let mut warnings = Vec::new();
    let mut error = None;
    let mut turn_number = 0u32;
    info!(tools = declarations.len(), "session started");

    loop {
        let timeout = match clamp_to_deadline(request_timeout, deadline) {
            Ok(timeout) => timeout,
            Err(err) => {
                warn!(turn = turn_number, "session deadline expired");
                error = Some(format!("{err:#}"));
                session.fail();
                break;
            }
        };

        turn_number += 1;
        on_event(&SessionEvent::TurnStarted { turn: turn_number });
        let chat = ChatRequest {
            messages: session.messages(),
            tools: &declarations,
            timeout,
        };
        let turn = model
            .open_stream(&chat)
            .and_then(|stream| parser.parse(stream, |text| on_event(&SessionEvent::Content(text))));
        let turn = match turn {
            Ok(turn) => turn,
            Err(err) => {
                warn!(turn = turn_number, error = %format!("{err:#}"), "model turn failed");
                error = Some(format!("{err:#}"));
                session.fail();
                break;
            }
        };
        warnings.extend(turn.warnings.iter().cloned().map(|warning| SessionWarning {
            turn: turn_number,
            warning,
        }));

        if turn.tool_calls.is_empty() {
            session.complete(turn.content)?;
            break;
        }

        let mut calls = turn.tool_calls;
        let next_step = session.step_count() + 1;
        for call in &mut calls {
            if call.id.is_none() {
                call.id = Some(format!("call_{next_step}_{}", call.index));
            }
        }

        let step = match session.begin_dispatch(Message::assistant(turn.content, calls.clone()))? {
            DispatchGate::Proceed { step } => step,
            DispatchGate::BudgetExceeded => {
                warn!(
                    step_budget,
                    pending_calls = calls.len(),
                    "step budget exhausted, turn not dispatched"
                );
                break;
            }
        };

        for call in &calls {
            on_event(&SessionEvent::ToolCall { step, call });
            let result = match clamp_to_deadline(policy.per_call_timeout(), deadline) {
                Ok(timeout) => dispatcher.dispatch(call, &policy, timeout),
                Err(_) => ToolResult::failure(FailureKind::Timeout, "timeout"),
            };
            on_event(&SessionEvent::ToolResult {
                step,
                call,
                result: &result,
            });
            session.push_tool_result(Message::tool(call, &result))?;
        }
        session.finish_dispatch()?;
    }

    let termination = session.termination();
    let steps_taken = session.step_count();
    let terminal_message = session
        .last_assistant_content()
        .unwrap_or_default()
        .to_string();
    info!(
        termination = termination.as_str(),
        steps_taken,
        turns = turn_number,
        "session finished"
    );
    on_event(&SessionEvent::Terminated {
        termination,
        steps_taken,
    });

    Ok(SessionSummary {
        steps_taken,
        terminal_message,
        termination,
        error,
        transcript: session.into_messages(),
        warnings,
    })
}
