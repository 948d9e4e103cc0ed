//! SQLite schema, row mapping and transactional writes.
use super::*;
use super::session_state::{apply_layer_delta, decode_state_map, encode_state_map};

pub(super) struct SessionRow {
    pub(super) id: String,
    pub(super) app_name: String,
    pub(super) user_id: String,
    pub(super) name: String,
    pub(super) state_json: String,
    pub(super) create_time_ms: u64,
    pub(super) update_time_ms: u64,
}

pub(super) fn open_session_sqlite_connection(path: &Path) -> CodaResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_code_lazy(ErrorCode::Internal, || {
                format!("failed to create session directory {}", parent.display())
            })?;
        }
    }
    let connection = Connection::open(path).with_code_lazy(ErrorCode::Internal, || {
        format!("failed to open sqlite session store {}", path.display())
    })?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .with_code(ErrorCode::Internal, "failed to configure sqlite busy timeout")?;
    connection
        .execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .with_code(ErrorCode::Internal, "failed to configure sqlite session store")?;
    Ok(connection)
}

pub(super) fn initialize_session_sqlite_schema(connection: &Connection) -> CodaResult<()> {
    connection
        .execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                state_json TEXT NOT NULL DEFAULT '{}',
                create_time_ms INTEGER NOT NULL,
                update_time_ms INTEGER NOT NULL,
                UNIQUE (app_name, user_id, name)
            );
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                invocation_id TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                content_json TEXT NOT NULL,
                state_delta_json TEXT NOT NULL DEFAULT '{}',
                partial INTEGER NOT NULL DEFAULT 0,
                turn_complete INTEGER NOT NULL DEFAULT 0,
                error_code TEXT NULL,
                error_message TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_session_seq
                ON events(session_id, seq);
            CREATE TABLE IF NOT EXISTS app_states (
                app_name TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                update_time_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_states (
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                update_time_ms INTEGER NOT NULL,
                PRIMARY KEY (app_name, user_id)
            );
            "#,
        )
        .with_code(ErrorCode::Internal, "failed to initialize sqlite session schema")
}

pub(super) fn load_session_row(
    connection: &Connection,
    id: &str,
) -> CodaResult<Option<SessionRow>> {
    connection
        .query_row(
            "SELECT id, app_name, user_id, name, state_json, create_time_ms, update_time_ms
             FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    app_name: row.get(1)?,
                    user_id: row.get(2)?,
                    name: row.get(3)?,
                    state_json: row.get(4)?,
                    create_time_ms: from_sql_millis(row.get(5)?),
                    update_time_ms: from_sql_millis(row.get(6)?),
                })
            },
        )
        .optional()
        .with_code(ErrorCode::Internal, "failed to load session")
}

pub(super) fn find_session_id(
    connection: &Connection,
    app_name: &str,
    user_id: &str,
    name: &str,
) -> CodaResult<Option<String>> {
    connection
        .query_row(
            "SELECT id FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND name = ?3",
            params![app_name, user_id, name],
            |row| row.get(0),
        )
        .optional()
        .with_code(ErrorCode::Internal, "failed to look up session")
}

pub(super) fn list_session_summaries(
    connection: &Connection,
    app_name: &str,
    user_id: &str,
) -> CodaResult<Vec<SessionSummary>> {
    let mut statement = connection
        .prepare(
            "SELECT s.id, s.name, s.app_name, s.user_id, s.create_time_ms, s.update_time_ms,
                    (SELECT COUNT(*) FROM events e WHERE e.session_id = s.id)
             FROM sessions s
             WHERE s.app_name = ?1 AND s.user_id = ?2
             ORDER BY s.update_time_ms DESC, s.name ASC",
        )
        .with_code(ErrorCode::Internal, "failed to prepare session listing")?;
    let rows = statement
        .query_map(params![app_name, user_id], |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                app_name: row.get(2)?,
                user_id: row.get(3)?,
                create_time_ms: from_sql_millis(row.get(4)?),
                update_time_ms: from_sql_millis(row.get(5)?),
                event_count: from_sql_millis(row.get(6)?),
            })
        })
        .with_code(ErrorCode::Internal, "failed to list sessions")?;
    rows.collect::<Result<Vec<_>, _>>()
        .with_code(ErrorCode::Internal, "failed to read session listing")
}

pub(super) fn insert_session(
    connection: &mut Connection,
    app_name: &str,
    user_id: &str,
    name: &str,
    mut initial_state: StateMap,
    resume_existing: bool,
) -> CodaResult<String> {
    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .with_code(ErrorCode::Internal, "failed to begin session transaction")?;

    if let Some(existing) = find_session_id(&transaction, app_name, user_id, name)? {
        if resume_existing {
            tracing::debug!(session_id = %existing, "resuming existing session");
            return Ok(existing);
        }
        return Err(CodaError::internal("session already exists")
            .with_context("app_name", app_name)
            .with_context("user_id", user_id)
            .with_context("name", name)
            .with_suggestion("resume the existing session or choose another name"));
    }

    trim_temp_delta(&mut initial_state);
    let scoped = split_state_delta(&initial_state);
    let id = generate_id("ses");
    let now = current_unix_timestamp_ms();
    transaction
        .execute(
            "INSERT INTO sessions
                (id, app_name, user_id, name, state_json, create_time_ms, update_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id,
                app_name,
                user_id,
                name,
                encode_state_map(&scoped.session)?,
                to_sql_millis(now)
            ],
        )
        .with_code(ErrorCode::Internal, "failed to insert session")?;
    apply_shared_layers(&transaction, app_name, user_id, &scoped, now)?;
    transaction
        .commit()
        .with_code(ErrorCode::Internal, "failed to commit session creation")?;

    tracing::debug!(session_id = %id, app = %app_name, user = %user_id, "created session");
    Ok(id)
}

pub(super) fn append_event_in_transaction(
    connection: &mut Connection,
    session_id: &str,
    event: &mut Event,
    fault_hook: Option<&AppendFaultHook>,
) -> CodaResult<()> {
    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .with_code(ErrorCode::Internal, "failed to begin append transaction")?;

    let row = load_session_row(&transaction, session_id)?
        .ok_or_else(|| session_not_found(session_id))?;

    if event.id.trim().is_empty() {
        event.id = generate_id("evt");
    }
    event.session_id = row.id.clone();
    event.timestamp_ms = current_unix_timestamp_ms().max(row.update_time_ms);
    trim_temp_delta(&mut event.state_delta);

    let content_json = serde_json::to_string(&event.content)
        .with_code(ErrorCode::Internal, "failed to encode event content")?;
    let (error_code, error_message) = match &event.error {
        Some(error) => (Some(error.code.as_str()), Some(error.message.as_str())),
        None => (None, None),
    };
    transaction
        .execute(
            "INSERT INTO events
                (id, session_id, invocation_id, author, timestamp_ms, content_json,
                 state_delta_json, partial, turn_complete, error_code, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.id,
                event.session_id,
                event.invocation_id,
                event.author.as_str(),
                to_sql_millis(event.timestamp_ms),
                content_json,
                encode_state_map(&event.state_delta)?,
                event.partial,
                event.turn_complete,
                error_code,
                error_message,
            ],
        )
        .with_code_lazy(ErrorCode::Internal, || {
            format!("failed to insert event {}", event.id)
        })?;
    run_fault_hook(fault_hook, AppendStage::EventWritten)?;

    let mut session_state = decode_state_map(&row.state_json)?;
    if !event.partial {
        let scoped = split_state_delta(&event.state_delta);
        apply_layer_delta(&mut session_state, &scoped.session);
        apply_shared_layers(
            &transaction,
            &row.app_name,
            &row.user_id,
            &scoped,
            event.timestamp_ms,
        )?;
    }
    run_fault_hook(fault_hook, AppendStage::StateApplied)?;

    transaction
        .execute(
            "UPDATE sessions SET state_json = ?1, update_time_ms = ?2 WHERE id = ?3",
            params![
                encode_state_map(&session_state)?,
                to_sql_millis(event.timestamp_ms),
                row.id
            ],
        )
        .with_code(ErrorCode::Internal, "failed to update session")?;
    transaction
        .commit()
        .with_code(ErrorCode::Internal, "failed to commit event append")
}

pub(super) fn read_state_layers(
    connection: &Connection,
    row: &SessionRow,
) -> CodaResult<StateLayers> {
    let app = connection
        .query_row(
            "SELECT state_json FROM app_states WHERE app_name = ?1",
            params![row.app_name],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_code(ErrorCode::Internal, "failed to read app state")?;
    let user = connection
        .query_row(
            "SELECT state_json FROM user_states WHERE app_name = ?1 AND user_id = ?2",
            params![row.app_name, row.user_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_code(ErrorCode::Internal, "failed to read user state")?;

    Ok(StateLayers {
        app: decode_state_map(app.as_deref().unwrap_or_default())?,
        user: decode_state_map(user.as_deref().unwrap_or_default())?,
        session: decode_state_map(&row.state_json)?,
    })
}

pub(super) fn event_sequence(
    connection: &Connection,
    session_id: &str,
    event_id: &str,
) -> CodaResult<Option<i64>> {
    connection
        .query_row(
            "SELECT seq FROM events WHERE session_id = ?1 AND id = ?2",
            params![session_id, event_id],
            |row| row.get(0),
        )
        .optional()
        .with_code(ErrorCode::Internal, "failed to locate event")
}

pub(super) fn read_event_page(
    connection: &Connection,
    session_id: &str,
    after_seq: i64,
    page_size: usize,
) -> CodaResult<Vec<(i64, Event)>> {
    let mut statement = connection
        .prepare_cached(
            "SELECT seq, id, session_id, invocation_id, author, timestamp_ms, content_json,
                    state_delta_json, partial, turn_complete, error_code, error_message
             FROM events
             WHERE session_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
        )
        .with_code(ErrorCode::Internal, "failed to prepare event page query")?;
    let limit = i64::try_from(page_size).unwrap_or(i64::MAX);
    let rows = statement
        .query_map(params![session_id, after_seq, limit], |row| {
            Ok(RawEventRow {
                seq: row.get(0)?,
                id: row.get(1)?,
                session_id: row.get(2)?,
                invocation_id: row.get(3)?,
                author: row.get(4)?,
                timestamp_ms: from_sql_millis(row.get(5)?),
                content_json: row.get(6)?,
                state_delta_json: row.get(7)?,
                partial: row.get(8)?,
                turn_complete: row.get(9)?,
                error_code: row.get(10)?,
                error_message: row.get(11)?,
            })
        })
        .with_code(ErrorCode::Internal, "failed to read events")?;

    let mut page = Vec::with_capacity(page_size);
    for row in rows {
        let raw = row.with_code(ErrorCode::Internal, "failed to read event row")?;
        page.push(raw.into_event()?);
    }
    Ok(page)
}

struct RawEventRow {
    seq: i64,
    id: String,
    session_id: String,
    invocation_id: String,
    author: String,
    timestamp_ms: u64,
    content_json: String,
    state_delta_json: String,
    partial: bool,
    turn_complete: bool,
    error_code: Option<String>,
    error_message: Option<String>,
}

impl RawEventRow {
    fn into_event(self) -> CodaResult<(i64, Event)> {
        let content: Vec<EventPart> = serde_json::from_str(&self.content_json)
            .with_code_lazy(ErrorCode::Internal, || {
                format!("failed to decode content of event {}", self.id)
            })?;
        let error = self.error_code.map(|code| EventError {
            code,
            message: self.error_message.unwrap_or_default(),
        });
        Ok((
            self.seq,
            Event {
                id: self.id,
                session_id: self.session_id,
                invocation_id: self.invocation_id,
                author: EventAuthor::parse(&self.author)?,
                timestamp_ms: self.timestamp_ms,
                content,
                state_delta: decode_state_map(&self.state_delta_json)?,
                partial: self.partial,
                turn_complete: self.turn_complete,
                error,
            },
        ))
    }
}

fn apply_shared_layers(
    connection: &Connection,
    app_name: &str,
    user_id: &str,
    scoped: &ScopedStateDelta,
    now_ms: u64,
) -> CodaResult<()> {
    if !scoped.app.is_empty() {
        let current = connection
            .query_row(
                "SELECT state_json FROM app_states WHERE app_name = ?1",
                params![app_name],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_code(ErrorCode::Internal, "failed to read app state")?;
        let mut state = decode_state_map(current.as_deref().unwrap_or_default())?;
        apply_layer_delta(&mut state, &scoped.app);
        connection
            .execute(
                "INSERT INTO app_states (app_name, state_json, update_time_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(app_name) DO UPDATE SET
                    state_json = excluded.state_json,
                    update_time_ms = excluded.update_time_ms",
                params![app_name, encode_state_map(&state)?, to_sql_millis(now_ms)],
            )
            .with_code(ErrorCode::Internal, "failed to write app state")?;
    }

    if !scoped.user.is_empty() {
        let current = connection
            .query_row(
                "SELECT state_json FROM user_states WHERE app_name = ?1 AND user_id = ?2",
                params![app_name, user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_code(ErrorCode::Internal, "failed to read user state")?;
        let mut state = decode_state_map(current.as_deref().unwrap_or_default())?;
        apply_layer_delta(&mut state, &scoped.user);
        connection
            .execute(
                "INSERT INTO user_states (app_name, user_id, state_json, update_time_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(app_name, user_id) DO UPDATE SET
                    state_json = excluded.state_json,
                    update_time_ms = excluded.update_time_ms",
                params![
                    app_name,
                    user_id,
                    encode_state_map(&state)?,
                    to_sql_millis(now_ms)
                ],
            )
            .with_code(ErrorCode::Internal, "failed to write user state")?;
    }

    Ok(())
}

fn run_fault_hook(hook: Option<&AppendFaultHook>, stage: AppendStage) -> CodaResult<()> {
    match hook {
        Some(hook) => hook(stage),
        None => Ok(()),
    }
}

fn to_sql_millis(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_millis(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
