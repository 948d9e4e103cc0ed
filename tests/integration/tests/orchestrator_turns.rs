use std::{
    collections::{HashSet, VecDeque},
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use coda_agent_core::{Orchestrator, OrchestratorConfig};
use coda_ai::{
    ChatRequest, ChatResponse, ChatUsage, CodaAiError, ContentBlock, LlmClient, Message,
    ToolDefinition,
};
use coda_core::{CancellationToken, CodaError, CodaResult, ErrorCode};
use coda_session::{CreateSessionOptions, Event, EventAuthor, Session, SessionStore};
use coda_tools::{register_builtin_tools, ToolContext, ToolHandler, ToolPolicy, ToolRegistry};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tokio::sync::Mutex as AsyncMutex;

struct ScriptedClient {
    responses: AsyncMutex<VecDeque<ChatResponse>>,
    requests: AsyncMutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: AsyncMutex::new(VecDeque::from(responses)),
            requests: AsyncMutex::new(Vec::new()),
        }
    }

    async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, CodaAiError> {
        self.requests.lock().await.push(request);
        let mut responses = self.responses.lock().await;
        responses
            .pop_front()
            .ok_or_else(|| CodaAiError::InvalidResponse("scripted response queue exhausted".into()))
    }
}

/// Requests one more `list_directory` call on every attempt.
#[derive(Default)]
struct EndlessToolCallClient {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for EndlessToolCallClient {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, CodaAiError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(scripted_tool_calls(vec![(
            format!("call-{attempt}"),
            "list_directory",
            json!({ "path": "." }),
        )]))
    }
}

/// Blocks until the turn is cancelled.
struct WaitForCancelTool;

#[async_trait]
impl ToolHandler for WaitForCancelTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "wait_for_cancel".to_string(),
            description: "Blocks until cancelled".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn invoke(&self, _arguments: Value, context: ToolContext) -> CodaResult<Value> {
        context.cancellation.cancelled().await;
        Err(CodaError::cancelled("wait_for_cancel"))
    }
}

fn scripted_tool_calls(calls: Vec<(String, &str, Value)>) -> ChatResponse {
    ChatResponse {
        message: Message::assistant_blocks(
            calls
                .into_iter()
                .map(|(id, name, arguments)| ContentBlock::ToolCall {
                    id,
                    name: name.to_string(),
                    arguments,
                })
                .collect(),
        ),
        finish_reason: Some("tool_calls".to_string()),
        usage: ChatUsage::default(),
    }
}

fn scripted_assistant_text(text: &str) -> ChatResponse {
    ChatResponse {
        message: Message::assistant_text(text),
        finish_reason: Some("stop".to_string()),
        usage: ChatUsage::default(),
    }
}

struct Fixture {
    _temp: TempDir,
    workspace: std::path::PathBuf,
    store: Arc<SessionStore>,
    session: Session,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path().join("workspace");
        fs::create_dir_all(&workspace).expect("workspace");
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(workspace.join(name), name).expect("write fixture");
        }
        let store =
            Arc::new(SessionStore::open(temp.path().join("sessions.sqlite")).expect("open store"));
        let session = store
            .create_session("coda", "alice", "demo", CreateSessionOptions::default())
            .expect("create session");
        Self {
            _temp: temp,
            workspace,
            store,
            session,
        }
    }

    fn registry(&self, extra: Vec<Arc<dyn ToolHandler>>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, ToolPolicy::new(&self.workspace))
            .expect("register builtins");
        for handler in extra {
            registry.register(handler).expect("register extra tool");
        }
        Arc::new(registry)
    }

    fn orchestrator(
        &self,
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        max_turns: usize,
    ) -> Orchestrator {
        Orchestrator::new(
            client,
            registry,
            Arc::clone(&self.store),
            OrchestratorConfig {
                max_turns,
                working_dir: self.workspace.clone(),
                ..OrchestratorConfig::default()
            },
        )
    }

    fn events(&self) -> Vec<Event> {
        self.store
            .read_events(&self.session.id, None)
            .expect("read events")
            .collect::<Result<Vec<_>, _>>()
            .expect("decode events")
    }
}

fn assert_every_tool_call_answered(events: &[Event]) {
    let mut open: HashSet<String> = HashSet::new();
    for event in events {
        match event.author {
            EventAuthor::Model => {
                assert!(open.is_empty(), "model event while calls open: {open:?}");
                open.extend(event.tool_call_ids().into_iter().map(|(id, _)| id.to_string()));
            }
            EventAuthor::Tool => {
                for id in event.tool_result_ids() {
                    assert!(open.remove(id), "result without matching call: {id}");
                }
            }
            EventAuthor::User => {}
        }
    }
    assert!(open.is_empty(), "orphaned tool calls: {open:?}");
}

#[tokio::test]
async fn integration_orchestrated_demo_turn_lists_workspace_files() {
    let fixture = Fixture::new();
    let client = Arc::new(ScriptedClient::new(vec![
        scripted_tool_calls(vec![(
            "call-1".to_string(),
            "list_directory",
            json!({ "path": "." }),
        )]),
        scripted_assistant_text("found 3 files"),
    ]));
    let orchestrator = fixture.orchestrator(client.clone(), fixture.registry(Vec::new()), 8);

    let outcome = orchestrator
        .run_turn(&fixture.session, "list files", &CancellationToken::new())
        .await
        .expect("turn succeeds");

    assert_eq!(outcome.final_text, "found 3 files");
    assert_eq!(outcome.model_calls, 2);
    assert_eq!(outcome.tool_calls, 1);
    assert_eq!(client.request_count().await, 2);

    let events = fixture.events();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].text(), "list files");
    assert_eq!(events[1].tool_call_ids(), vec![("call-1", "list_directory")]);
    assert_eq!(events[2].tool_result_ids(), vec!["call-1"]);
    assert!(events[2].error.is_none());
    assert!(events[3].turn_complete);
    assert!(events
        .iter()
        .all(|event| event.invocation_id == outcome.invocation_id));
    assert_every_tool_call_answered(&events);
}

#[tokio::test]
async fn integration_turn_limit_aborts_at_fourth_model_attempt() {
    let fixture = Fixture::new();
    let client = Arc::new(EndlessToolCallClient::default());
    let orchestrator = fixture.orchestrator(client.clone(), fixture.registry(Vec::new()), 3);

    let error = orchestrator
        .run_turn(&fixture.session, "keep going", &CancellationToken::new())
        .await
        .expect_err("turn limit must abort");

    assert_eq!(error.code(), ErrorCode::ExecutionFailed);
    assert_eq!(error.context_value("max_turns"), Some("3"));
    assert_eq!(error.context_value("attempt"), Some("4"));
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);

    let events = fixture.events();
    assert_eq!(events.len(), 1 + 3 * 2);
    assert_every_tool_call_answered(&events);
}

#[tokio::test]
async fn integration_cancellation_mid_tool_leaves_no_orphaned_calls() {
    let fixture = Fixture::new();
    let client = Arc::new(ScriptedClient::new(vec![scripted_tool_calls(vec![
        ("call-wait".to_string(), "wait_for_cancel", json!({})),
        ("call-list".to_string(), "list_directory", json!({ "path": "." })),
    ])]));
    let registry = fixture.registry(vec![Arc::new(WaitForCancelTool)]);
    let orchestrator = fixture.orchestrator(client, registry, 8);

    let cancellation = CancellationToken::new();
    let trigger = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let error = orchestrator
        .run_turn(&fixture.session, "wait then list", &cancellation)
        .await
        .expect_err("cancelled turn must fail");
    assert_eq!(error.code(), ErrorCode::Cancelled);

    let events = fixture.events();
    assert_eq!(events.len(), 4);
    assert_every_tool_call_answered(&events);
    for event in &events[2..] {
        let recorded = event.error.as_ref().expect("cancelled result carries an error");
        assert_eq!(recorded.code, "CANCELLED");
    }
}

#[tokio::test]
async fn integration_resumed_session_replays_prior_turns_into_the_request() {
    let fixture = Fixture::new();
    let client = Arc::new(ScriptedClient::new(vec![
        scripted_assistant_text("first answer"),
        scripted_assistant_text("second answer"),
    ]));
    let orchestrator = fixture.orchestrator(client.clone(), fixture.registry(Vec::new()), 8);

    orchestrator
        .run_turn(&fixture.session, "first question", &CancellationToken::new())
        .await
        .expect("first turn");

    let resumed = fixture
        .store
        .create_session(
            "coda",
            "alice",
            "demo",
            CreateSessionOptions {
                resume_existing: true,
                ..CreateSessionOptions::default()
            },
        )
        .expect("resume");
    assert_eq!(resumed.id, fixture.session.id);

    orchestrator
        .run_turn(&resumed, "second question", &CancellationToken::new())
        .await
        .expect("second turn");

    let requests = client.requests.lock().await;
    let texts: Vec<String> = requests[1]
        .messages
        .iter()
        .filter(|message| message.role != coda_ai::MessageRole::System)
        .map(Message::text_content)
        .collect();
    assert_eq!(
        texts,
        vec!["first question", "first answer", "second question"]
    );
}
