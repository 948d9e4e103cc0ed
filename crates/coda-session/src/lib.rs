//! Durable session and event store backed by SQLite.
//!
//! Each session owns an append-only event log plus a session-local state
//! layer. App-wide and user-wide layers are shared across sessions and are
//! only ever mutated through the state delta carried by appended events.
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use coda_core::{
    current_unix_timestamp_ms, generate_id, CodaError, CodaResult, ErrorCode, ResultExt,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod session_events;
mod session_locking;
mod session_state;
mod session_storage;
#[cfg(test)]
mod tests;

pub use session_events::{conversation_view, EventCursor};
pub use session_state::{
    merge_state_layers, split_state_delta, trim_temp_delta, ScopedStateDelta, StateLayers,
    APP_PREFIX, TEMP_PREFIX, USER_PREFIX,
};

use session_locking::{lock_or_recover, SessionLockRegistry};
use session_storage::{
    load_session_row, open_session_sqlite_connection, read_state_layers, SessionRow,
};

const DEFAULT_EVENT_PAGE_SIZE: usize = 64;

/// Key/value state map used by every layer and by event deltas.
pub type StateMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One continuous conversation with its merged state view.
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub name: String,
    pub create_time_ms: u64,
    pub update_time_ms: u64,
    pub state: StateMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `SessionSummary` used across coda components.
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub app_name: String,
    pub user_id: String,
    pub create_time_ms: u64,
    pub update_time_ms: u64,
    pub event_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `EventAuthor` values.
pub enum EventAuthor {
    User,
    Model,
    Tool,
}

impl EventAuthor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
        }
    }

    fn parse(raw: &str) -> CodaResult<Self> {
        match raw {
            "user" => Ok(Self::User),
            "model" => Ok(Self::Model),
            "tool" => Ok(Self::Tool),
            other => Err(CodaError::internal(format!(
                "unknown event author '{other}' in session store"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Portable event payload: text, a tool call, or a tool result.
pub enum EventPart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `EventError` used across coda components.
pub struct EventError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Immutable record appended to a session log.
///
/// `id`, `session_id` and `timestamp_ms` are assigned by the store on
/// append; values set by callers are overwritten except for a non-empty id.
pub struct Event {
    pub id: String,
    pub session_id: String,
    pub invocation_id: String,
    pub author: EventAuthor,
    pub timestamp_ms: u64,
    pub content: Vec<EventPart>,
    pub state_delta: StateMap,
    pub partial: bool,
    pub turn_complete: bool,
    pub error: Option<EventError>,
}

#[derive(Debug, Clone, Default)]
/// Public struct `CreateSessionOptions` used across coda components.
pub struct CreateSessionOptions {
    pub initial_state: StateMap,
    pub resume_existing: bool,
}

#[derive(Debug, Clone)]
/// Public struct `SessionStoreOptions` used across coda components.
pub struct SessionStoreOptions {
    pub event_page_size: usize,
}

impl Default for SessionStoreOptions {
    fn default() -> Self {
        Self {
            event_page_size: DEFAULT_EVENT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Points inside the append transaction where a fault hook runs.
pub enum AppendStage {
    EventWritten,
    StateApplied,
}

/// Fault-injection hook consulted during `append_event`; an `Err` rolls the
/// transaction back.
pub type AppendFaultHook = Arc<dyn Fn(AppendStage) -> CodaResult<()> + Send + Sync>;

/// SQLite-backed store for sessions, events and state layers.
///
/// Connections are opened per operation; the store itself only holds the
/// database path and in-process coordination state, so it is shared as
/// `Arc<SessionStore>`.
pub struct SessionStore {
    path: PathBuf,
    options: SessionStoreOptions,
    locks: SessionLockRegistry,
    fault_hook: Mutex<Option<AppendFaultHook>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl SessionStore {
    /// Opens (creating if needed) the store at `path` with default options.
    pub fn open(path: impl Into<PathBuf>) -> CodaResult<Self> {
        Self::open_with_options(path, SessionStoreOptions::default())
    }

    pub fn open_with_options(
        path: impl Into<PathBuf>,
        options: SessionStoreOptions,
    ) -> CodaResult<Self> {
        if options.event_page_size == 0 {
            return Err(CodaError::invalid_input("event_page_size must be at least 1"));
        }
        let path = path.into();
        let connection = open_session_sqlite_connection(&path)?;
        session_storage::initialize_session_sqlite_schema(&connection)?;
        tracing::debug!(path = %path.display(), "opened session store");
        Ok(Self {
            path,
            options,
            locks: SessionLockRegistry::default(),
            fault_hook: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Installs or clears the append fault-injection hook.
    pub fn set_append_fault_hook(&self, hook: Option<AppendFaultHook>) {
        *lock_or_recover(&self.fault_hook) = hook;
    }

    pub fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        name: &str,
        options: CreateSessionOptions,
    ) -> CodaResult<Session> {
        for (field, value) in [("app_name", app_name), ("user_id", user_id), ("name", name)] {
            if value.trim().is_empty() {
                return Err(CodaError::invalid_input(format!("{field} must not be empty")));
            }
        }

        let mut connection = self.connect()?;
        let id = session_storage::insert_session(
            &mut connection,
            app_name,
            user_id,
            name,
            options.initial_state,
            options.resume_existing,
        )?;
        self.get_session(&id)?.ok_or_else(|| {
            CodaError::internal("session disappeared after creation").with_context("session_id", &id)
        })
    }

    pub fn get_session(&self, id: &str) -> CodaResult<Option<Session>> {
        let connection = self.connect()?;
        let Some(row) = load_session_row(&connection, id)? else {
            return Ok(None);
        };
        Ok(Some(session_from_row(&connection, row)?))
    }

    /// Looks a session up by its `(app, user, name)` triple.
    pub fn find_session(
        &self,
        app_name: &str,
        user_id: &str,
        name: &str,
    ) -> CodaResult<Option<Session>> {
        let connection = self.connect()?;
        let Some(id) = session_storage::find_session_id(&connection, app_name, user_id, name)?
        else {
            return Ok(None);
        };
        let Some(row) = load_session_row(&connection, &id)? else {
            return Ok(None);
        };
        Ok(Some(session_from_row(&connection, row)?))
    }

    pub fn list_sessions(&self, app_name: &str, user_id: &str) -> CodaResult<Vec<SessionSummary>> {
        let connection = self.connect()?;
        session_storage::list_session_summaries(&connection, app_name, user_id)
    }

    /// Appends `event` to the session log, filling its id, session id and
    /// timestamp. The event row, all three state layers and the session
    /// update time are written in one transaction.
    pub fn append_event(&self, session_id: &str, event: &mut Event) -> CodaResult<()> {
        let lock = self.locks.lock_for(session_id);
        let _guard = lock_or_recover(&lock);
        let hook = lock_or_recover(&self.fault_hook).clone();

        let mut connection = self.connect()?;
        session_storage::append_event_in_transaction(
            &mut connection,
            session_id,
            event,
            hook.as_ref(),
        )?;
        tracing::debug!(
            session_id = %session_id,
            event_id = %event.id,
            author = event.author.as_str(),
            partial = event.partial,
            "appended session event"
        );
        Ok(())
    }

    /// Owned variant of [`SessionStore::append_event`] returning the stored event.
    pub fn append_event_owned(&self, session_id: &str, mut event: Event) -> CodaResult<Event> {
        self.append_event(session_id, &mut event)?;
        Ok(event)
    }

    pub fn delete_session(&self, id: &str) -> CodaResult<()> {
        let lock = self.locks.lock_for(id);
        {
            let _guard = lock_or_recover(&lock);
            let connection = self.connect()?;
            let removed = connection
                .execute("DELETE FROM sessions WHERE id = ?1", params![id])
                .with_code(ErrorCode::Internal, "failed to delete session")?;
            if removed == 0 {
                return Err(session_not_found(id));
            }
        }
        self.locks.forget(id);
        tracing::debug!(session_id = %id, "deleted session");
        Ok(())
    }

    /// Returns a lazy, paged cursor over events appended after
    /// `since_event_id` (exclusive), or from the start when `None`.
    pub fn read_events(
        &self,
        session_id: &str,
        since_event_id: Option<&str>,
    ) -> CodaResult<EventCursor> {
        let connection = self.connect()?;
        if load_session_row(&connection, session_id)?.is_none() {
            return Err(session_not_found(session_id));
        }
        let after_seq = match since_event_id {
            Some(event_id) => session_storage::event_sequence(&connection, session_id, event_id)?
                .ok_or_else(|| {
                    CodaError::invalid_input("since event id is not part of this session")
                        .with_context("session_id", session_id)
                        .with_context("event_id", event_id)
                })?,
            None => 0,
        };
        Ok(EventCursor::new(
            connection,
            session_id.to_string(),
            after_seq,
            self.options.event_page_size,
        ))
    }

    /// Replays the full log, dropping partial events superseded by a final
    /// model event of the same invocation.
    pub fn conversation_events(&self, session_id: &str) -> CodaResult<Vec<Event>> {
        let events = self
            .read_events(session_id, None)?
            .collect::<CodaResult<Vec<_>>>()?;
        Ok(conversation_view(events))
    }

    /// Raw app, user and session layers for inspection.
    pub fn load_state_layers(&self, session_id: &str) -> CodaResult<StateLayers> {
        let connection = self.connect()?;
        let row = load_session_row(&connection, session_id)?
            .ok_or_else(|| session_not_found(session_id))?;
        read_state_layers(&connection, &row)
    }

    fn connect(&self) -> CodaResult<Connection> {
        open_session_sqlite_connection(&self.path)
    }
}

fn session_from_row(connection: &Connection, row: SessionRow) -> CodaResult<Session> {
    let layers = read_state_layers(connection, &row)?;
    Ok(Session {
        id: row.id,
        app_name: row.app_name,
        user_id: row.user_id,
        name: row.name,
        create_time_ms: row.create_time_ms,
        update_time_ms: row.update_time_ms,
        state: layers.merged(),
    })
}

fn session_not_found(id: &str) -> CodaError {
    CodaError::invalid_input("session not found").with_context("session_id", id)
}
