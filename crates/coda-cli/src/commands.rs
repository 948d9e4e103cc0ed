use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use coda_agent_core::{
    ListenerFanout, Orchestrator, OrchestratorConfig, TokenUsage, ToolExecutionListener,
    TracingToolListener,
};
use coda_ai::{OpenAiClient, OpenAiConfig};
use coda_core::{CancellationToken, CodaError};
use coda_session::{CreateSessionOptions, Event, SessionStore};
use coda_tools::{register_builtin_tools, ToolPolicy, ToolRegistry};
use serde_json::{json, Value};

use crate::{
    bootstrap_helpers::default_database_path,
    cli_args::{Cli, CliCommand, RunArgs, SessionCommand, ToolsCommand},
};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    match &cli.command {
        CliCommand::Session(command) => execute_session_command(&cli, command),
        CliCommand::Tools(ToolsCommand::List) => execute_tools_list(&cli),
        CliCommand::Run(args) => execute_run(&cli, args).await,
    }
}

fn open_store(cli: &Cli) -> Result<SessionStore> {
    let path = cli.db.clone().unwrap_or_else(default_database_path);
    let store = SessionStore::open(&path)?;
    Ok(store)
}

fn execute_session_command(cli: &Cli, command: &SessionCommand) -> Result<()> {
    let store = open_store(cli)?;
    match command {
        SessionCommand::New { name, resume } => {
            let session = store.create_session(
                &cli.app,
                &cli.user,
                name,
                CreateSessionOptions {
                    resume_existing: *resume,
                    ..CreateSessionOptions::default()
                },
            )?;
            println!(
                "session {} name={} created={}",
                session.id,
                session.name,
                format_timestamp_ms(session.create_time_ms)
            );
        }
        SessionCommand::List => {
            let sessions = store.list_sessions(&cli.app, &cli.user)?;
            if sessions.is_empty() {
                println!("no sessions");
            }
            for summary in sessions {
                println!(
                    "{}\t{}\tevents={}\tupdated={}",
                    summary.id,
                    summary.name,
                    summary.event_count,
                    format_timestamp_ms(summary.update_time_ms)
                );
            }
        }
        SessionCommand::Show { id, since } => {
            for event in store.read_events(id, since.as_deref())? {
                let event = event?;
                println!("{}", render_event_line(&event)?);
            }
        }
        SessionCommand::Delete { id } => {
            store.delete_session(id)?;
            println!("deleted session {id}");
        }
        SessionCommand::State { id } => {
            let layers = store.load_state_layers(id)?;
            let payload = json!({
                "merged": layers.merged(),
                "app": layers.app,
                "user": layers.user,
                "session": layers.session,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to render state")?
            );
        }
    }
    Ok(())
}

fn build_registry(workspace: &Path) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, ToolPolicy::new(workspace))?;
    Ok(registry)
}

fn execute_tools_list(cli: &Cli) -> Result<()> {
    let registry = build_registry(&cli.workspace)?;
    for entry in registry.list() {
        let mode = if entry.is_independent() {
            "independent"
        } else {
            "sequential"
        };
        println!("{}\t{}\t{}", entry.name(), mode, entry.description());
    }
    Ok(())
}

async fn execute_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let prompt = args.prompt.join(" ");
    let client = OpenAiClient::new(OpenAiConfig {
        api_base: cli.api_base.clone(),
        api_key: cli.api_key.clone().unwrap_or_default(),
        request_timeout_ms: cli.request_timeout_ms,
        ..OpenAiConfig::default()
    })
    .map_err(CodaError::from)?;
    let registry = Arc::new(build_registry(&cli.workspace)?);

    let store = Arc::new(open_store(cli)?);
    let session = store.create_session(
        &cli.app,
        &cli.user,
        &args.session,
        CreateSessionOptions {
            resume_existing: true,
            ..CreateSessionOptions::default()
        },
    )?;

    let defaults = OrchestratorConfig::default();
    let config = OrchestratorConfig {
        model: cli.model.clone(),
        system_prompt: args
            .system_prompt
            .clone()
            .unwrap_or(defaults.system_prompt.clone()),
        max_turns: cli.max_turns,
        request_timeout_ms: Some(cli.request_timeout_ms),
        tool_timeout_ms: cli.tool_timeout_ms,
        max_parallel_tool_calls: cli.max_parallel_tools,
        stream_partial_events: args.stream,
        working_dir: cli.workspace.clone(),
        ..defaults
    };
    let listener = ListenerFanout::new(vec![
        Arc::new(TracingToolListener) as Arc<dyn ToolExecutionListener>,
        Arc::new(StderrProgressListener),
    ]);
    let orchestrator = Orchestrator::new(Arc::new(client), registry, store, config)
        .with_listener(Arc::new(listener));

    let cancellation = CancellationToken::new();
    let interrupt = cancellation.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; cancelling turn");
            interrupt.cancel();
        }
    });

    let outcome = orchestrator.run_turn(&session, &prompt, &cancellation).await;
    signal_task.abort();
    let outcome = outcome?;

    tracing::info!(
        session_id = %session.id,
        invocation_id = %outcome.invocation_id,
        model_calls = outcome.model_calls,
        tool_calls = outcome.tool_calls,
        input_tokens = outcome.usage.input_tokens,
        output_tokens = outcome.usage.output_tokens,
        total_tokens = outcome.usage.total_tokens,
        "turn finished"
    );
    println!("{}", outcome.final_text);
    eprintln!("{}", format_usage_line(&outcome.usage));
    Ok(())
}

/// Prints one short line per tool lifecycle callback.
struct StderrProgressListener;

impl ToolExecutionListener for StderrProgressListener {
    fn on_start(&self, _call_id: &str, tool_name: &str, _arguments: &Value) {
        eprintln!("[tool] {tool_name} started");
    }

    fn on_progress(&self, _call_id: &str, tool_name: &str, info: &Value) {
        eprintln!("[tool] {tool_name} {info}");
    }

    fn on_complete(&self, _call_id: &str, tool_name: &str, result: Result<&Value, &CodaError>) {
        match result {
            Ok(_) => eprintln!("[tool] {tool_name} ok"),
            Err(error) => eprintln!("[tool] {tool_name} failed: {error}"),
        }
    }
}

fn render_event_line(event: &Event) -> Result<String> {
    let mut value = serde_json::to_value(event).context("failed to render event")?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "time".to_string(),
            Value::String(format_timestamp_ms(event.timestamp_ms)),
        );
    }
    Ok(value.to_string())
}

fn format_usage_line(usage: &TokenUsage) -> String {
    format!(
        "[usage] requests={} input_tokens={} output_tokens={} total_tokens={}",
        usage.requests, usage.input_tokens, usage.output_tokens, usage.total_tokens
    )
}

pub(crate) fn format_timestamp_ms(timestamp_ms: u64) -> String {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| timestamp_ms.to_string())
}
