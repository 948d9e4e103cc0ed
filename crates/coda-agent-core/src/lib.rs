//! Turn orchestration for coda agents.
//!
//! An [`Orchestrator`] drives one user turn: it rebuilds the conversation
//! from the session store, asks the model for a response, dispatches the
//! requested tool calls through the registry and appends every step back to
//! the session log until the model answers without tool calls.
use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use coda_ai::LlmClient;
use coda_session::SessionStore;
use coda_tools::ToolRegistry;

mod history;
mod token_usage;
mod tool_bridge;
mod tool_listener;
mod turn_loop;


pub use history::conversation_messages;
pub use token_usage::{TokenTracker, TokenUsage};
pub use tool_listener::{
    ListenerFanout, NoopToolListener, ToolExecutionListener, TracingToolListener,
};

/// Public struct `OrchestratorConfig` used across coda components.
///
/// # Examples
///
/// ```
/// use coda_agent_core::OrchestratorConfig;
///
/// let config = OrchestratorConfig {
///     max_turns: 3,
///     ..OrchestratorConfig::default()
/// };
///
/// assert_eq!(config.max_turns, 3);
/// assert_eq!(config.max_parallel_tool_calls, 4);
/// ```
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub system_prompt: String,
    /// Maximum model calls within one turn.
    pub max_turns: usize,
    pub request_timeout_ms: Option<u64>,
    pub tool_timeout_ms: Option<u64>,
    pub max_parallel_tool_calls: usize,
    /// Persist streamed deltas as partial model events.
    pub stream_partial_events: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Working directory handed to every tool invocation.
    pub working_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are coda, a coding assistant working inside the user's \
                            workspace. Use the available tools to inspect and change files, \
                            then answer concisely."
                .to_string(),
            max_turns: 8,
            request_timeout_ms: Some(120_000),
            tool_timeout_ms: None,
            max_parallel_tool_calls: 4,
            stream_partial_events: false,
            max_tokens: None,
            temperature: None,
            working_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// States of the per-turn state machine.
pub enum TurnState {
    Start,
    AwaitModel,
    ModelResponse,
    ExecuteTools,
    AppendResults,
    AppendFinal,
    Done,
    Aborted,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AwaitModel => "await_model",
            Self::ModelResponse => "model_response",
            Self::ExecuteTools => "execute_tools",
            Self::AppendResults => "append_results",
            Self::AppendFinal => "append_final",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Summary of a completed turn.
pub struct TurnOutcome {
    pub final_text: String,
    pub invocation_id: String,
    pub model_calls: usize,
    pub tool_calls: usize,
    /// Tokens consumed by this turn's model calls.
    pub usage: TokenUsage,
    pub transitions: Vec<TurnState>,
}

/// Drives user turns against one model client, tool registry and store.
///
/// The orchestrator holds no per-session state; the active session is passed
/// to every [`Orchestrator::run_turn`] call.
pub struct Orchestrator {
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    store: Arc<SessionStore>,
    config: OrchestratorConfig,
    listener: Arc<dyn ToolExecutionListener>,
    tokens: Arc<TokenTracker>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tools", &self.registry.len())
            .field("store", &self.store.path())
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        store: Arc<SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            registry,
            store,
            config,
            listener: Arc::new(NoopToolListener),
            tokens: Arc::new(TokenTracker::default()),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ToolExecutionListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Cumulative token usage of `session_id` across turns run by this
    /// orchestrator.
    pub fn session_token_usage(&self, session_id: &str) -> Option<TokenUsage> {
        self.tokens.session_usage(session_id)
    }

    pub fn token_tracker(&self) -> &TokenTracker {
        &self.tokens
    }
}

fn timeout_duration_from_ms(timeout_ms: Option<u64>) -> Option<Duration> {
    timeout_ms
        .filter(|timeout_ms| *timeout_ms > 0)
        .map(Duration::from_millis)
}
