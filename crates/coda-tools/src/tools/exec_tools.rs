//! Process execution tools: shell commands and direct program launches.

use super::*;

/// Public struct `ExecuteCommandTool` used across coda components.
pub struct ExecuteCommandTool {
    policy: Arc<ToolPolicy>,
}

impl ExecuteCommandTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for ExecuteCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "execute_command".to_string(),
            description: "Run a shell command (sh -c) inside the workspace and capture its \
                          output. A non-zero exit status is reported, not raised."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "minLength": 1 },
                    "working_dir": { "type": "string" },
                    "timeout": { "type": "integer", "minimum": 1, "description": "Seconds" }
                },
                "required": ["command"],
                "additionalProperties": false
            }),
        }
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let command = required_string(&arguments, "command")?;
        if command.trim().is_empty() {
            return Err(CodaError::invalid_input("command must not be empty"));
        }
        let mut builder = Command::new("sh");
        builder.arg("-c").arg(&command);
        run_process(&self.policy, &arguments, &context, builder, command).await
    }
}

/// Public struct `ExecuteProgramTool` used across coda components.
pub struct ExecuteProgramTool {
    policy: Arc<ToolPolicy>,
}

impl ExecuteProgramTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for ExecuteProgramTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "execute_program".to_string(),
            description: "Run a program with an explicit argument list, without shell \
                          interpretation"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "program": { "type": "string", "minLength": 1 },
                    "args": { "type": "array", "items": { "type": "string" } },
                    "working_dir": { "type": "string" },
                    "timeout": { "type": "integer", "minimum": 1, "description": "Seconds" }
                },
                "required": ["program"],
                "additionalProperties": false
            }),
        }
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let program = required_string(&arguments, "program")?;
        let args: Vec<String> = match arguments.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        CodaError::invalid_input("every entry in 'args' must be a string")
                    })
                })
                .collect::<CodaResult<_>>()?,
            Some(_) => return Err(CodaError::invalid_input("'args' must be an array")),
        };

        let command_line = shell_words::join(
            std::iter::once(program.as_str()).chain(args.iter().map(String::as_str)),
        );
        let mut builder = Command::new(&program);
        builder.args(&args);
        run_process(&self.policy, &arguments, &context, builder, command_line).await
    }
}

async fn run_process(
    policy: &ToolPolicy,
    arguments: &Value,
    context: &ToolContext,
    mut builder: Command,
    command_line: String,
) -> CodaResult<Value> {
    let working_dir = match optional_string(arguments, "working_dir")? {
        Some(dir) => resolve_workspace_path(&dir, policy, context, PathMode::Directory)?,
        None => resolve_workspace_path(".", policy, context, PathMode::Directory)?,
    };
    let timeout_ms = optional_usize(arguments, "timeout")?
        .map(|seconds| (seconds as u64).saturating_mul(1_000))
        .unwrap_or(policy.command_timeout_ms)
        .max(1);

    if context.cancellation.is_cancelled() {
        return Err(CodaError::cancelled("execute").with_context("command", &command_line));
    }

    builder
        .current_dir(&working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = builder
        .spawn()
        .map_err(|error| CodaError::execution_failed(&command_line, error))?;
    context.report_progress(json!({
        "stage": "spawned",
        "command": command_line,
        "pid": child.id(),
    }));
    tracing::debug!(
        command = %command_line,
        working_dir = %working_dir.display(),
        "spawned process"
    );

    let output = tokio::select! {
        _ = context.cancellation.cancelled() => {
            return Err(CodaError::cancelled("execute").with_context("command", &command_line));
        }
        result = timeout(Duration::from_millis(timeout_ms), child.wait_with_output()) => {
            match result {
                Ok(Ok(output)) => output,
                Ok(Err(error)) => return Err(CodaError::execution_failed(&command_line, error)),
                Err(_) => {
                    return Err(CodaError::timeout("execute")
                        .with_context("command", &command_line)
                        .with_context("timeout_ms", timeout_ms)
                        .with_suggestion("raise the timeout argument for long-running commands"));
                }
            }
        }
    };

    let exit_code = output.status.code();
    context.report_progress(json!({
        "stage": "exited",
        "exit_code": exit_code,
    }));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(json!({
        "command": command_line,
        "working_dir": workspace_relative(policy, &working_dir),
        "stdout": truncate_bytes(&stdout, policy.max_command_output_bytes),
        "stderr": truncate_bytes(&stderr, policy.max_command_output_bytes),
        "exit_code": exit_code,
        "success": output.status.success(),
    }))
}
