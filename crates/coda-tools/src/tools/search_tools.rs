//! File-name and content search tools.

use super::*;

/// Public struct `SearchFilesTool` used across coda components.
pub struct SearchFilesTool {
    policy: Arc<ToolPolicy>,
}

impl SearchFilesTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for SearchFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_files".to_string(),
            description: "Find files whose name matches a wildcard pattern (* and ?), e.g. \
                          '*.rs' or 'test_*.py'"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "default": "." },
                    "pattern": { "type": "string", "minLength": 1 },
                    "max_results": { "type": "integer", "minimum": 1 }
                },
                "required": ["pattern"],
                "additionalProperties": false
            }),
        }
    }

    fn is_independent(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = optional_string(&arguments, "path")?.unwrap_or_else(|| ".".to_string());
        let pattern = required_string(&arguments, "pattern")?;
        let max_results = optional_usize(&arguments, "max_results")?
            .unwrap_or(self.policy.max_search_results)
            .min(self.policy.max_search_results);
        let matcher = wildcard_regex(&pattern)?;
        let resolved =
            resolve_workspace_path(&path, &self.policy, &context, PathMode::Directory)?;

        let entries =
            walk_directory(&self.policy, &resolved, true, true, &context.cancellation).await?;
        let mut matches: Vec<String> = entries
            .iter()
            .filter(|entry| !entry.is_dir && matcher.is_match(&entry.name))
            .map(|entry| workspace_relative(&self.policy, &entry.path))
            .collect();
        let truncated = matches.len() > max_results;
        matches.truncate(max_results);

        Ok(json!({
            "pattern": pattern,
            "count": matches.len(),
            "matches": matches,
            "truncated": truncated,
        }))
    }
}

/// Public struct `GrepSearchTool` used across coda components.
pub struct GrepSearchTool {
    policy: Arc<ToolPolicy>,
}

impl GrepSearchTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for GrepSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "grep_search".to_string(),
            description: "Search file contents with a regular expression; returns matching \
                          lines with 1-based line numbers"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "default": "." },
                    "pattern": { "type": "string", "minLength": 1 },
                    "case_sensitive": { "type": "boolean", "default": false },
                    "file_pattern": { "type": "string" }
                },
                "required": ["pattern"],
                "additionalProperties": false
            }),
        }
    }

    fn is_independent(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = optional_string(&arguments, "path")?.unwrap_or_else(|| ".".to_string());
        let pattern = required_string(&arguments, "pattern")?;
        let case_sensitive = optional_bool(&arguments, "case_sensitive", false)?;
        let file_filter = optional_string(&arguments, "file_pattern")?
            .map(|value| wildcard_regex(&value))
            .transpose()?;
        let matcher = RegexBuilder::new(&pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|error| {
                CodaError::invalid_input(format!("invalid regular expression: {error}"))
                    .with_context("pattern", &pattern)
            })?;

        let resolved =
            resolve_workspace_path(&path, &self.policy, &context, PathMode::Existing)?;
        let candidates = if resolved.is_dir() {
            walk_directory(&self.policy, &resolved, true, true, &context.cancellation)
                .await?
                .into_iter()
                .filter(|entry| !entry.is_dir)
                .collect::<Vec<_>>()
        } else {
            let size = tokio::fs::metadata(&resolved)
                .await
                .map_err(|error| io_error(&resolved, "inspect", error))?
                .len();
            vec![WalkEntry {
                name: resolved
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default(),
                path: resolved.clone(),
                is_dir: false,
                size,
            }]
        };

        let limit = self.policy.max_search_results;
        let mut matches = Vec::new();
        let mut truncated = false;
        'files: for entry in candidates {
            if context.cancellation.is_cancelled() {
                return Err(CodaError::cancelled("grep_search"));
            }
            if entry.size > self.policy.max_file_read_bytes as u64 {
                continue;
            }
            if let Some(filter) = &file_filter {
                if !filter.is_match(&entry.name) {
                    continue;
                }
            }
            let Ok(content) = tokio::fs::read_to_string(&entry.path).await else {
                continue;
            };
            for (index, line) in content.lines().enumerate() {
                if !matcher.is_match(line) {
                    continue;
                }
                if matches.len() == limit {
                    truncated = true;
                    break 'files;
                }
                matches.push(json!({
                    "file": workspace_relative(&self.policy, &entry.path),
                    "line": index + 1,
                    "content": line,
                }));
            }
        }

        Ok(json!({
            "pattern": pattern,
            "count": matches.len(),
            "matches": matches,
            "truncated": truncated,
        }))
    }
}
