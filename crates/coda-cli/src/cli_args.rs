use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "coda",
    about = "Coding agent with durable sessions and local tools",
    version
)]
/// Top-level `coda` command line.
pub(crate) struct Cli {
    #[arg(
        long,
        env = "CODA_DB",
        global = true,
        help = "Session database path (defaults to ~/.coda/sessions.sqlite)"
    )]
    pub(crate) db: Option<PathBuf>,

    #[arg(
        long,
        env = "CODA_APP",
        default_value = "coda",
        global = true,
        help = "Application name that scopes app-level state"
    )]
    pub(crate) app: String,

    #[arg(
        long,
        env = "CODA_USER",
        default_value = "local",
        global = true,
        help = "User id that scopes sessions and user-level state"
    )]
    pub(crate) user: String,

    #[arg(
        long,
        env = "CODA_MODEL",
        default_value = "gpt-4o-mini",
        global = true,
        help = "Model name sent with every chat request"
    )]
    pub(crate) model: String,

    #[arg(
        long,
        env = "CODA_API_BASE",
        default_value = "https://api.openai.com/v1",
        global = true,
        help = "Base URL for OpenAI-compatible APIs"
    )]
    pub(crate) api_base: String,

    #[arg(
        long,
        env = "OPENAI_API_KEY",
        hide_env_values = true,
        global = true,
        help = "API key for the OpenAI-compatible endpoint"
    )]
    pub(crate) api_key: Option<String>,

    #[arg(
        long,
        env = "CODA_WORKSPACE",
        default_value = ".",
        global = true,
        help = "Workspace root that bounds every file and command tool"
    )]
    pub(crate) workspace: PathBuf,

    #[arg(
        long,
        env = "CODA_MAX_TURNS",
        default_value_t = 8,
        value_parser = parse_positive_usize,
        global = true,
        help = "Maximum model calls per turn before the turn is aborted"
    )]
    pub(crate) max_turns: usize,

    #[arg(
        long = "request-timeout-ms",
        env = "CODA_REQUEST_TIMEOUT_MS",
        default_value_t = 120_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Timeout in milliseconds for one model request"
    )]
    pub(crate) request_timeout_ms: u64,

    #[arg(
        long = "tool-timeout-ms",
        env = "CODA_TOOL_TIMEOUT_MS",
        value_parser = parse_positive_u64,
        global = true,
        help = "Optional timeout in milliseconds for one tool call"
    )]
    pub(crate) tool_timeout_ms: Option<u64>,

    #[arg(
        long = "max-parallel-tools",
        env = "CODA_MAX_PARALLEL_TOOLS",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        global = true,
        help = "Maximum number of independent tool calls executed concurrently"
    )]
    pub(crate) max_parallel_tools: usize,

    #[arg(
        long = "log-level",
        env = "CODA_LOG",
        global = true,
        help = "Default tracing directive (for example info or coda_session=debug)"
    )]
    pub(crate) log_level: Option<String>,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Create, inspect and delete sessions.
    #[command(subcommand)]
    Session(SessionCommand),
    /// Inspect registered tools.
    #[command(subcommand)]
    Tools(ToolsCommand),
    /// Run one turn against a session and print the final answer.
    Run(RunArgs),
}

#[derive(Debug, Subcommand)]
pub(crate) enum SessionCommand {
    /// Create a session, or resume it with --resume.
    New {
        name: String,
        #[arg(long, help = "Return the existing session with this name instead of failing")]
        resume: bool,
    },
    /// List sessions for the current app and user.
    List,
    /// Print the events of a session.
    Show {
        id: String,
        #[arg(long, help = "Only print events appended after this event id")]
        since: Option<String>,
    },
    /// Delete a session and its events.
    Delete { id: String },
    /// Print the merged app/user/session state.
    State { id: String },
}

#[derive(Debug, Subcommand)]
pub(crate) enum ToolsCommand {
    /// List built-in tools with their descriptions.
    List,
}

#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    #[arg(
        long,
        default_value = "default",
        help = "Session name; created on first use and resumed afterwards"
    )]
    pub(crate) session: String,

    #[arg(
        long = "system-prompt",
        env = "CODA_SYSTEM_PROMPT",
        help = "Override the built-in system prompt"
    )]
    pub(crate) system_prompt: Option<String>,

    #[arg(long, help = "Persist streamed text deltas as partial events")]
    pub(crate) stream: bool,

    #[arg(required = true, num_args = 1.., help = "Prompt text")]
    pub(crate) prompt: Vec<String>,
}
