//! Conversion from the persisted event log to model messages.

use coda_ai::{ContentBlock, Message};
use coda_core::{CodaError, ErrorCode};
use coda_session::{Event, EventAuthor, EventPart};
use serde_json::Value;

/// Builds model messages from a session log.
///
/// Partial events are skipped. A tool call with no recorded result (a turn
/// that crashed mid-call) is answered with a synthetic `CANCELLED` result so
/// every assistant tool call stays paired in the request.
pub fn conversation_messages(events: &[Event]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(events.len());
    let mut pending: Vec<(String, String)> = Vec::new();

    for event in events.iter().filter(|event| !event.partial) {
        if event.author != EventAuthor::Tool {
            close_pending_calls(&mut messages, &mut pending);
        }
        match event.author {
            EventAuthor::User => {
                let text = event.text();
                if !text.is_empty() {
                    messages.push(Message::user(text));
                }
            }
            EventAuthor::Model => {
                let blocks = model_blocks(&event.content);
                if blocks.is_empty() {
                    continue;
                }
                pending.extend(
                    event
                        .tool_call_ids()
                        .into_iter()
                        .map(|(id, name)| (id.to_string(), name.to_string())),
                );
                messages.push(Message::assistant_blocks(blocks));
            }
            EventAuthor::Tool => {
                for part in &event.content {
                    let EventPart::ToolResult {
                        id,
                        name,
                        output,
                        error,
                    } = part
                    else {
                        continue;
                    };
                    pending.retain(|(pending_id, _)| pending_id != id);
                    let (payload, is_error) = match (error, output) {
                        (Some(error), _) => (error, true),
                        (None, Some(output)) => (output, false),
                        (None, None) => (&Value::Null, false),
                    };
                    messages.push(Message::tool_result(
                        id.as_str(),
                        name.as_str(),
                        render_payload(payload),
                        is_error,
                    ));
                }
            }
        }
    }
    close_pending_calls(&mut messages, &mut pending);
    messages
}

fn model_blocks(parts: &[EventPart]) -> Vec<ContentBlock> {
    parts
        .iter()
        .filter_map(|part| match part {
            EventPart::Text { text } if !text.is_empty() => {
                Some(ContentBlock::Text { text: text.clone() })
            }
            EventPart::ToolCall {
                id,
                name,
                arguments,
            } => Some(ContentBlock::ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn close_pending_calls(messages: &mut Vec<Message>, pending: &mut Vec<(String, String)>) {
    for (id, name) in pending.drain(..) {
        let payload = CodaError::new(
            ErrorCode::Cancelled,
            "tool call was interrupted before a result was recorded",
        )
        .with_context("tool", &name)
        .to_payload();
        messages.push(Message::tool_result(id, name, render_payload(&payload), true));
    }
}

fn render_payload(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
