//! Event constructors, the paged event cursor and partial-event folding.
use super::*;

impl Event {
    fn new(author: EventAuthor, content: Vec<EventPart>) -> Self {
        Self {
            id: String::new(),
            session_id: String::new(),
            invocation_id: String::new(),
            author,
            timestamp_ms: 0,
            content,
            state_delta: StateMap::new(),
            partial: false,
            turn_complete: false,
            error: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(EventAuthor::User, vec![EventPart::Text { text: text.into() }])
    }

    pub fn model(content: Vec<EventPart>) -> Self {
        Self::new(EventAuthor::Model, content)
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::model(vec![EventPart::Text { text: text.into() }])
    }

    /// Tool-result event; exactly one of `output` / `error` is expected.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: Option<Value>,
        error: Option<Value>,
    ) -> Self {
        Self::new(
            EventAuthor::Tool,
            vec![EventPart::ToolResult {
                id: call_id.into(),
                name: tool_name.into(),
                output,
                error,
            }],
        )
    }

    pub fn with_state_delta(mut self, delta: StateMap) -> Self {
        self.state_delta = delta;
        self
    }

    pub fn with_invocation(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = invocation_id.into();
        self
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn turn_complete(mut self) -> Self {
        self.turn_complete = true;
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(EventError {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                EventPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// `(call id, tool name)` pairs for every tool call in this event.
    pub fn tool_call_ids(&self) -> Vec<(&str, &str)> {
        self.content
            .iter()
            .filter_map(|part| match part {
                EventPart::ToolCall { id, name, .. } => Some((id.as_str(), name.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|part| match part {
                EventPart::ToolResult { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Lazy iterator over a session log, ordered by append sequence.
///
/// At most one page of events is buffered. A cursor created with the same
/// arguments yields the same sequence; `last_event_id` lets callers resume
/// from where a previous cursor stopped.
pub struct EventCursor {
    connection: Connection,
    session_id: String,
    after_seq: i64,
    page_size: usize,
    buffered: VecDeque<(i64, Event)>,
    exhausted: bool,
    last_event_id: Option<String>,
}

impl EventCursor {
    pub(super) fn new(
        connection: Connection,
        session_id: String,
        after_seq: i64,
        page_size: usize,
    ) -> Self {
        Self {
            connection,
            session_id,
            after_seq,
            page_size,
            buffered: VecDeque::new(),
            exhausted: false,
            last_event_id: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Id of the most recently yielded event.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn fill_page(&mut self) -> CodaResult<()> {
        let page = session_storage::read_event_page(
            &self.connection,
            &self.session_id,
            self.after_seq,
            self.page_size,
        )?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffered.extend(page);
        Ok(())
    }
}

impl Iterator for EventCursor {
    type Item = CodaResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            if let Err(error) = self.fill_page() {
                self.exhausted = true;
                return Some(Err(error));
            }
        }
        let (seq, event) = self.buffered.pop_front()?;
        self.after_seq = seq;
        self.last_event_id = Some(event.id.clone());
        Some(Ok(event))
    }
}

/// Drops partial events that a later final model event supersedes.
///
/// A partial tagged with an invocation id is superseded by a later final
/// model event of the same invocation. An untagged partial is superseded by
/// any later final model event.
pub fn conversation_view(events: Vec<Event>) -> Vec<Event> {
    let mut finalized = HashSet::new();
    let mut later_final_model = false;
    let mut kept = Vec::with_capacity(events.len());
    for event in events.into_iter().rev() {
        if event.partial {
            let superseded = if event.invocation_id.is_empty() {
                later_final_model
            } else {
                finalized.contains(&event.invocation_id)
            };
            if superseded {
                continue;
            }
        } else if event.author == EventAuthor::Model {
            later_final_model = true;
            if !event.invocation_id.is_empty() {
                finalized.insert(event.invocation_id.clone());
            }
        }
        kept.push(event);
    }
    kept.reverse();
    kept
}
