//! The per-turn state machine: START -> AWAIT_MODEL -> MODEL_RESPONSE ->
//! (EXECUTE_TOOLS -> APPEND_RESULTS -> AWAIT_MODEL)* -> APPEND_FINAL -> DONE.

use std::sync::Arc;

use coda_ai::{ChatRequest, ChatResponse, ContentBlock, Message, StreamDeltaHandler, ToolCall};
use coda_core::{generate_id, CancellationToken, CodaError, CodaResult, ErrorCode};
use coda_session::{Event, EventPart, Session};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::{
    conversation_messages, timeout_duration_from_ms, tool_bridge::ToolDispatch, Orchestrator,
    TokenUsage, TurnOutcome, TurnState,
};

struct TurnTrace {
    session_id: String,
    invocation_id: String,
    transitions: Vec<TurnState>,
}

impl TurnTrace {
    fn enter(&mut self, state: TurnState) {
        tracing::debug!(
            session_id = %self.session_id,
            invocation_id = %self.invocation_id,
            state = state.as_str(),
            "turn transition"
        );
        self.transitions.push(state);
    }
}

#[derive(Default)]
struct TurnCounters {
    model_calls: usize,
    tool_calls: usize,
    usage: TokenUsage,
}

impl Orchestrator {
    /// Runs one user turn against `session` to completion.
    ///
    /// Tool failures are fed back to the model as error results. Model
    /// failures, store failures, cancellation and exceeding
    /// `max_turns` abort the turn; no step is retried.
    pub async fn run_turn(
        &self,
        session: &Session,
        input: &str,
        cancellation: &CancellationToken,
    ) -> CodaResult<TurnOutcome> {
        let mut trace = TurnTrace {
            session_id: session.id.clone(),
            invocation_id: generate_id("inv"),
            transitions: Vec::new(),
        };
        let mut counters = TurnCounters::default();

        match self
            .drive_turn(session, input, cancellation, &mut trace, &mut counters)
            .await
        {
            Ok(final_text) => {
                trace.enter(TurnState::Done);
                Ok(TurnOutcome {
                    final_text,
                    invocation_id: trace.invocation_id,
                    model_calls: counters.model_calls,
                    tool_calls: counters.tool_calls,
                    usage: counters.usage,
                    transitions: trace.transitions,
                })
            }
            Err(error) => {
                trace.enter(TurnState::Aborted);
                tracing::warn!(
                    session_id = %session.id,
                    invocation_id = %trace.invocation_id,
                    code = %error.code(),
                    error = %error,
                    "turn aborted"
                );
                Err(error)
            }
        }
    }

    async fn drive_turn(
        &self,
        session: &Session,
        input: &str,
        cancellation: &CancellationToken,
        trace: &mut TurnTrace,
        counters: &mut TurnCounters,
    ) -> CodaResult<String> {
        trace.enter(TurnState::Start);
        if cancellation.is_cancelled() {
            return Err(CodaError::cancelled("turn").with_context("session_id", &session.id));
        }
        if input.trim().is_empty() {
            return Err(CodaError::invalid_input("turn input must not be empty"));
        }
        self.store.append_event_owned(
            &session.id,
            Event::user_text(input).with_invocation(&trace.invocation_id),
        )?;

        let dispatch = ToolDispatch {
            registry: Arc::clone(&self.registry),
            listener: Arc::clone(&self.listener),
            working_dir: self.config.working_dir.clone(),
            tool_timeout: timeout_duration_from_ms(self.config.tool_timeout_ms),
            max_parallel: self.config.max_parallel_tool_calls,
        };

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            trace.enter(TurnState::AwaitModel);
            if attempt > self.config.max_turns {
                return Err(CodaError::new(
                    ErrorCode::ExecutionFailed,
                    format!(
                        "turn exceeded the limit of {} model calls",
                        self.config.max_turns
                    ),
                )
                .with_context("max_turns", self.config.max_turns)
                .with_context("attempt", attempt)
                .with_context("session_id", &session.id)
                .with_suggestion("raise the turn limit or narrow the request"));
            }
            if cancellation.is_cancelled() {
                return Err(CodaError::cancelled("turn").with_context("session_id", &session.id));
            }

            let request = self.build_request(&session.id)?;
            let response = self
                .await_model(&session.id, &trace.invocation_id, request, cancellation)
                .await?;
            counters.model_calls += 1;
            counters.usage.record(&response.usage);
            self.tokens.record(&session.id, &response.usage);
            trace.enter(TurnState::ModelResponse);

            let calls = normalize_tool_calls(response.message.tool_calls());
            let parts = response_parts(&response.message, &calls);
            if calls.is_empty() {
                trace.enter(TurnState::AppendFinal);
                self.store.append_event_owned(
                    &session.id,
                    Event::model(parts)
                        .with_invocation(&trace.invocation_id)
                        .turn_complete(),
                )?;
                return Ok(response.message.text_content());
            }

            self.store.append_event_owned(
                &session.id,
                Event::model(parts).with_invocation(&trace.invocation_id),
            )?;

            trace.enter(TurnState::ExecuteTools);
            let results = dispatch.execute(&calls, cancellation).await;
            counters.tool_calls += results.len();

            trace.enter(TurnState::AppendResults);
            for outcome in results {
                let event = match outcome.result {
                    Ok(output) => {
                        Event::tool_result(&outcome.call.id, &outcome.call.name, Some(output), None)
                    }
                    Err(error) => Event::tool_result(
                        &outcome.call.id,
                        &outcome.call.name,
                        None,
                        Some(error.to_payload()),
                    )
                    .with_error(error.code().as_str(), error.message()),
                };
                self.store.append_event_owned(
                    &session.id,
                    event.with_invocation(&trace.invocation_id),
                )?;
            }

            if cancellation.is_cancelled() {
                return Err(CodaError::cancelled("turn").with_context("session_id", &session.id));
            }
        }
    }

    fn build_request(&self, session_id: &str) -> CodaResult<ChatRequest> {
        let session = self.store.get_session(session_id)?.ok_or_else(|| {
            CodaError::invalid_input("session not found").with_context("session_id", session_id)
        })?;
        let events = self.store.conversation_events(session_id)?;

        let mut messages = Vec::with_capacity(events.len() + 1);
        if !self.config.system_prompt.trim().is_empty() {
            messages.push(Message::system(self.config.system_prompt.clone()));
        }
        messages.extend(conversation_messages(&events));

        Ok(ChatRequest {
            model: self.config.model.clone(),
            messages,
            tools: self.registry.definitions(),
            state: session.state,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        })
    }

    /// Awaits one model response, racing cancellation and the request
    /// timeout. Streamed deltas become partial events while the call runs.
    async fn await_model(
        &self,
        session_id: &str,
        invocation_id: &str,
        request: ChatRequest,
        cancellation: &CancellationToken,
    ) -> CodaResult<ChatResponse> {
        let (on_delta, mut deltas) = if self.config.stream_partial_events {
            let (sender, receiver) = unbounded_channel::<String>();
            let handler: StreamDeltaHandler = Arc::new(move |delta: String| {
                let _ = sender.send(delta);
            });
            (Some(handler), Some(receiver))
        } else {
            (None, None)
        };

        let request_timeout = timeout_duration_from_ms(self.config.request_timeout_ms);
        let call = self.client.complete_with_stream(request, on_delta);
        let bounded = async {
            match request_timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| limit),
                None => Ok(call.await),
            }
        };
        tokio::pin!(bounded);

        let mut streamed = String::new();
        let outcome = loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    return Err(CodaError::cancelled("model request")
                        .with_context("session_id", session_id));
                }
                outcome = &mut bounded => break outcome,
                Some(delta) = next_delta(&mut deltas) => {
                    self.append_partial(session_id, invocation_id, &mut streamed, delta)?;
                }
            }
        };
        if let Some(receiver) = deltas.as_mut() {
            while let Ok(delta) = receiver.try_recv() {
                self.append_partial(session_id, invocation_id, &mut streamed, delta)?;
            }
        }

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(CodaError::from(error).with_context("session_id", session_id)),
            Err(limit) => Err(CodaError::timeout("model request")
                .with_context("timeout_ms", limit.as_millis())
                .with_context("session_id", session_id)
                .with_suggestion("raise the request timeout or retry the turn")),
        }
    }

    /// Partial events carry the text accumulated so far, so the latest one
    /// always supersedes its predecessors.
    fn append_partial(
        &self,
        session_id: &str,
        invocation_id: &str,
        streamed: &mut String,
        delta: String,
    ) -> CodaResult<()> {
        if delta.is_empty() {
            return Ok(());
        }
        streamed.push_str(&delta);
        self.store.append_event_owned(
            session_id,
            Event::model_text(streamed.clone())
                .with_invocation(invocation_id)
                .partial(),
        )?;
        Ok(())
    }
}

async fn next_delta(receiver: &mut Option<UnboundedReceiver<String>>) -> Option<String> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Assigns ids to calls the model left unnamed so results can be paired.
fn normalize_tool_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.trim().is_empty() {
                call.id = generate_id("call");
            }
            call
        })
        .collect()
}

fn response_parts(message: &Message, calls: &[ToolCall]) -> Vec<EventPart> {
    let mut parts: Vec<EventPart> = message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => {
                Some(EventPart::Text { text: text.clone() })
            }
            _ => None,
        })
        .collect();
    parts.extend(calls.iter().map(|call| EventPart::ToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments: call.arguments.clone(),
    }));
    parts
}
