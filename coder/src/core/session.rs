//! Session state machine owned by the conversation driver.
//!
//! The session holds the append-only message history and the step counter.
//! Every mutation goes through a transition method so an out-of-order call
//! (e.g. appending a tool result while awaiting the model) is rejected instead
//! of silently corrupting the transcript.

use std::fmt;

use tracing::debug;

use crate::core::types::{Message, Role, Termination};

/// Driver states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    AwaitingModel,
    Dispatching,
    Terminated(Termination),
}

/// Raised when a transition is attempted from the wrong state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: DriverState,
    pub action: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while {:?}", self.action, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// Result of asking the session to dispatch a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchGate {
    /// Proceed; `step` is the 1-based number of the dispatched turn.
    Proceed { step: u32 },
    /// The budget is spent; the turn's calls must not run.
    BudgetExceeded,
}

#[derive(Debug)]
pub struct ExecutionSession {
    messages: Vec<Message>,
    step_count: u32,
    step_budget: u32,
    state: DriverState,
}

impl ExecutionSession {
    /// Start a session seeded with the system prompt and the user instruction.
    pub fn new(system_prompt: String, instruction: String, step_budget: u32) -> Self {
        Self {
            messages: vec![Message::system(system_prompt), Message::user(instruction)],
            step_count: 0,
            step_budget,
            state: DriverState::AwaitingModel,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn termination(&self) -> Termination {
        match self.state {
            DriverState::Terminated(reason) => reason,
            _ => Termination::Running,
        }
    }

    /// Content of the most recent assistant message, if any.
    pub fn last_assistant_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|msg| msg.role == Role::Assistant)
            .map(|msg| msg.content.as_str())
    }

    /// A turn without tool calls ends the session.
    pub fn complete(&mut self, content: String) -> Result<(), InvalidTransition> {
        self.require(DriverState::AwaitingModel, "complete")?;
        self.messages.push(Message::assistant(content, Vec::new()));
        self.transition(DriverState::Terminated(Termination::Completed));
        Ok(())
    }

    /// Append an assistant turn with tool calls and decide whether it may run.
    ///
    /// When the budget is already spent the turn is still recorded, but the
    /// session terminates and the step counter does not move.
    pub fn begin_dispatch(&mut self, turn: Message) -> Result<DispatchGate, InvalidTransition> {
        self.require(DriverState::AwaitingModel, "dispatch")?;
        self.messages.push(turn);
        if self.step_count >= self.step_budget {
            self.transition(DriverState::Terminated(Termination::StepBudgetExceeded));
            return Ok(DispatchGate::BudgetExceeded);
        }
        self.step_count += 1;
        self.transition(DriverState::Dispatching);
        Ok(DispatchGate::Proceed {
            step: self.step_count,
        })
    }

    pub fn push_tool_result(&mut self, message: Message) -> Result<(), InvalidTransition> {
        self.require(DriverState::Dispatching, "append a tool result")?;
        self.messages.push(message);
        Ok(())
    }

    pub fn finish_dispatch(&mut self) -> Result<(), InvalidTransition> {
        self.require(DriverState::Dispatching, "finish dispatch")?;
        self.transition(DriverState::AwaitingModel);
        Ok(())
    }

    /// Fatal session error; valid from any non-terminal state.
    pub fn fail(&mut self) {
        if !matches!(self.state, DriverState::Terminated(_)) {
            self.transition(DriverState::Terminated(Termination::Error));
        }
    }

    /// Hand the history over once the session has terminated.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    fn require(&self, state: DriverState, action: &'static str) -> Result<(), InvalidTransition> {
        if self.state == state {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.state,
                action,
            })
        }
    }

    fn transition(&mut self, next: DriverState) {
        debug!(from = ?self.state, to = ?next, step = self.step_count, "session transition");
        self.state = next;
    }
}
