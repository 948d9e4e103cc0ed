//! External tool providers (e.g. MCP servers) enumerated at agent-build time.
use std::sync::Arc;

use async_trait::async_trait;
use coda_core::{CodaError, CodaResult};

use crate::{ToolHandler, ToolRegistry};

#[async_trait]
/// Source of additional tools registered next to the built-ins.
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> CodaResult<Vec<Arc<dyn ToolHandler>>>;
}

/// In-process provider serving a fixed tool list.
pub struct StaticToolProvider {
    name: String,
    tools: Vec<Arc<dyn ToolHandler>>,
}

impl StaticToolProvider {
    pub fn new(name: impl Into<String>, tools: Vec<Arc<dyn ToolHandler>>) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }
}

#[async_trait]
impl ToolProvider for StaticToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> CodaResult<Vec<Arc<dyn ToolHandler>>> {
        Ok(self.tools.clone())
    }
}

/// Enumerates `provider` and registers every tool it offers.
///
/// Returns the registered names. A name clash stops registration with
/// `InvalidInput`; tools registered before the clash stay registered.
pub async fn register_provider_tools(
    registry: &mut ToolRegistry,
    provider: &dyn ToolProvider,
) -> CodaResult<Vec<String>> {
    let tools = provider.list_tools().await.map_err(|error| {
        error.with_context("provider", provider.name())
    })?;

    let mut registered = Vec::with_capacity(tools.len());
    for tool in tools {
        let name = tool.definition().name;
        registry
            .register(tool)
            .map_err(|error: CodaError| error.with_context("provider", provider.name()))?;
        registered.push(name);
    }
    tracing::debug!(
        provider = %provider.name(),
        tools = registered.len(),
        "registered provider tools"
    );
    Ok(registered)
}
