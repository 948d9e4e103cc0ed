//! Name-keyed tool catalog with schema-validated dispatch.
use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use coda_ai::ToolDefinition;
use coda_core::{CancellationToken, CodaError, CodaResult};
use jsonschema::{validator_for, Validator};
use serde_json::Value;

/// Callback receiving structured progress from a running tool.
pub type ToolProgressSink = Arc<dyn Fn(Value) + Send + Sync>;

#[async_trait]
/// Trait contract for `ToolHandler` behavior.
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Independent tools have no ordering dependency on sibling calls and may
    /// run concurrently with them.
    fn is_independent(&self) -> bool {
        false
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value>;
}

#[derive(Clone)]
/// Per-invocation execution context handed to handlers.
pub struct ToolContext {
    pub cancellation: CancellationToken,
    pub working_dir: PathBuf,
    pub progress: Option<ToolProgressSink>,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            working_dir: working_dir.into(),
            progress: None,
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_progress(mut self, progress: ToolProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn report_progress(&self, info: Value) {
        if let Some(progress) = &self.progress {
            progress(info);
        }
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("working_dir", &self.working_dir)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// A registered tool: descriptor, compiled input schema and handler.
pub struct ToolEntry {
    name: String,
    description: String,
    input_schema: Value,
    independent: bool,
    handler: Arc<dyn ToolHandler>,
    validator: Validator,
}

impl ToolEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    pub fn is_independent(&self) -> bool {
        self.independent
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }

    fn validate_arguments(&self, arguments: &Value) -> CodaResult<()> {
        let messages: Vec<String> = self
            .validator
            .iter_errors(arguments)
            .map(|error| error.to_string())
            .collect();
        if messages.is_empty() {
            return Ok(());
        }
        Err(CodaError::invalid_input(format!(
            "invalid arguments for '{}': {}",
            self.name,
            messages.join("; ")
        ))
        .with_context("tool", &self.name))
    }
}

impl fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolEntry")
            .field("name", &self.name)
            .field("independent", &self.independent)
            .finish()
    }
}

#[derive(Debug, Default)]
/// Process-wide tool catalog.
///
/// Registration needs `&mut self`; once populated the registry is shared
/// read-only (typically as `Arc<ToolRegistry>`), so dispatch takes no locks.
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool. Duplicate names, empty names and malformed schemas are
    /// rejected with `InvalidInput`; an existing entry is never replaced.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> CodaResult<()> {
        let definition = handler.definition();
        let name = definition.name.trim().to_string();
        if name.is_empty() {
            return Err(CodaError::invalid_input("tool name must not be empty"));
        }
        if self.index.contains_key(&name) {
            return Err(
                CodaError::invalid_input(format!("tool '{name}' is already registered"))
                    .with_context("tool", &name),
            );
        }
        if !definition.parameters.is_object() {
            return Err(
                CodaError::invalid_input(format!("input schema for '{name}' must be an object"))
                    .with_context("tool", &name),
            );
        }
        let validator = validator_for(&definition.parameters).map_err(|error| {
            CodaError::invalid_input(format!("invalid JSON schema for '{name}': {error}"))
                .with_context("tool", &name)
        })?;

        tracing::debug!(tool = %name, independent = handler.is_independent(), "registered tool");
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push(ToolEntry {
            name,
            description: definition.description,
            input_schema: definition.parameters,
            independent: handler.is_independent(),
            handler,
            validator,
        });
        Ok(())
    }

    pub fn register_tool<T>(&mut self, tool: T) -> CodaResult<()>
    where
        T: ToolHandler + 'static,
    {
        self.register(Arc::new(tool))
    }

    pub fn lookup(&self, name: &str) -> Option<&ToolEntry> {
        self.index.get(name).map(|position| &self.entries[*position])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Entries in registration order.
    pub fn list(&self) -> &[ToolEntry] {
        &self.entries
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(ToolEntry::definition).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validates `arguments` against the tool schema, then runs the handler.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        context: ToolContext,
    ) -> CodaResult<Value> {
        let entry = self.lookup(name).ok_or_else(|| {
            CodaError::not_supported(format!("tool '{name}'")).with_context("tool", name)
        })?;
        entry.validate_arguments(&arguments)?;

        tracing::debug!(tool = %name, "invoking tool");
        entry
            .handler
            .invoke(arguments, context)
            .await
            .map_err(|error| match error.context_value("tool") {
                Some(_) => error,
                None => error.with_context("tool", name),
            })
    }
}
