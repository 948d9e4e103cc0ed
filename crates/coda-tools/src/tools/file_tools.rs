//! File read, write, in-place replace and directory listing tools.

use super::*;

/// Content shorter than this fraction of the existing file is treated as an
/// accidental truncation.
const SIZE_REDUCTION_FLOOR_RATIO: f64 = 0.1;

/// Public struct `ReadFileTool` used across coda components.
pub struct ReadFileTool {
    policy: Arc<ToolPolicy>,
}

impl ReadFileTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read a UTF-8 text file. Use offset (1-based start line) and limit \
                          (line count) to page through large files."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path to read" },
                    "offset": { "type": "integer", "minimum": 1 },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        }
    }

    fn is_independent(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = required_string(&arguments, "path")?;
        let offset = optional_usize(&arguments, "offset")?.unwrap_or(1);
        let limit = optional_usize(&arguments, "limit")?.unwrap_or(self.policy.max_read_lines);

        let resolved = resolve_workspace_path(&path, &self.policy, &context, PathMode::Read)?;
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|error| io_error(&resolved, "inspect", error))?;
        if metadata.len() > self.policy.max_file_read_bytes as u64 {
            return Err(CodaError::invalid_input(format!(
                "file is too large ({} bytes), limit is {} bytes",
                metadata.len(),
                self.policy.max_file_read_bytes
            ))
            .with_context("path", resolved.display())
            .with_suggestion("use grep_search to locate the relevant section"));
        }

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|error| io_error(&resolved, "read", error))?;
        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        if total_lines > 0 && offset > total_lines {
            return Err(CodaError::invalid_input(format!(
                "offset {offset} is past the end of the file ({total_lines} lines)"
            ))
            .with_context("path", resolved.display()));
        }

        let start_index = offset.saturating_sub(1).min(total_lines);
        let end_index = start_index.saturating_add(limit).min(total_lines);
        let selected = if start_index == 0 && end_index == total_lines {
            content.clone()
        } else {
            lines[start_index..end_index].join("\n")
        };

        Ok(json!({
            "path": workspace_relative(&self.policy, &resolved),
            "content": selected,
            "total_lines": total_lines,
            "start_line": start_index + 1,
            "end_line": end_index,
            "returned_lines": end_index - start_index,
        }))
    }
}

/// Public struct `WriteFileTool` used across coda components.
pub struct WriteFileTool {
    policy: Arc<ToolPolicy>,
}

impl WriteFileTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".to_string(),
            description: "Write UTF-8 text to a file atomically, creating parent directories \
                          unless create_dirs is false"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                    "create_dirs": { "type": "boolean", "default": true },
                    "allow_size_reduce": { "type": "boolean", "default": false }
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }),
        }
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = required_string(&arguments, "path")?;
        let content = required_string(&arguments, "content")?;
        let create_dirs = optional_bool(&arguments, "create_dirs", true)?;
        let allow_size_reduce = optional_bool(&arguments, "allow_size_reduce", false)?;
        if content.len() > self.policy.max_file_write_bytes {
            return Err(CodaError::invalid_input(format!(
                "content is too large ({} bytes), limit is {} bytes",
                content.len(),
                self.policy.max_file_write_bytes
            ))
            .with_context("path", &path));
        }

        let resolved = resolve_workspace_path(&path, &self.policy, &context, PathMode::Write)?;
        if let Ok(existing) = tokio::fs::metadata(&resolved).await {
            let floor = (existing.len() as f64 * SIZE_REDUCTION_FLOOR_RATIO) as u64;
            if !allow_size_reduce && existing.len() > 0 && (content.len() as u64) < floor {
                return Err(CodaError::invalid_input(format!(
                    "refusing to shrink '{}' from {} to {} bytes",
                    path,
                    existing.len(),
                    content.len()
                ))
                .with_context("path", resolved.display())
                .with_suggestion("set allow_size_reduce to true if the reduction is intended"));
            }
        }

        if let Some(parent) = resolved.parent() {
            if !parent.exists() {
                if !create_dirs {
                    return Err(CodaError::file_not_found(parent.display())
                        .with_suggestion("set create_dirs to true to create missing directories"));
                }
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| io_error(parent, "create directory", error))?;
            }
        }

        write_file_atomically(&resolved, &content)?;
        Ok(json!({
            "path": workspace_relative(&self.policy, &resolved),
            "bytes_written": content.len(),
        }))
    }
}

/// Public struct `ReplaceInFileTool` used across coda components.
pub struct ReplaceInFileTool {
    policy: Arc<ToolPolicy>,
}

impl ReplaceInFileTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for ReplaceInFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "replace_in_file".to_string(),
            description: "Replace exact occurrences of old_text with new_text in a file".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_text": { "type": "string", "minLength": 1 },
                    "new_text": { "type": "string" },
                    "max_replacements": { "type": "integer", "minimum": 1 }
                },
                "required": ["path", "old_text", "new_text"],
                "additionalProperties": false
            }),
        }
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = required_string(&arguments, "path")?;
        let old_text = required_string(&arguments, "old_text")?;
        let new_text = required_string(&arguments, "new_text")?;
        let max_replacements = optional_usize(&arguments, "max_replacements")?;
        if old_text.is_empty() {
            return Err(CodaError::invalid_input("old_text must not be empty"));
        }

        let resolved = resolve_workspace_path(&path, &self.policy, &context, PathMode::Read)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|error| io_error(&resolved, "read", error))?;

        let occurrences = content.matches(old_text.as_str()).count();
        if occurrences == 0 {
            return Err(CodaError::invalid_input("old_text was not found in the file")
                .with_context("path", resolved.display())
                .with_suggestion("read the file again and copy the exact text to replace"));
        }
        if let Some(max) = max_replacements {
            if occurrences > max {
                return Err(CodaError::invalid_input(format!(
                    "found {occurrences} occurrences, more than max_replacements {max}"
                ))
                .with_context("path", resolved.display())
                .with_suggestion("include more surrounding context in old_text"));
            }
        }

        let updated = content.replace(old_text.as_str(), &new_text);
        write_file_atomically(&resolved, &updated)?;
        Ok(json!({
            "path": workspace_relative(&self.policy, &resolved),
            "replacement_count": occurrences,
        }))
    }
}

/// Public struct `ListDirectoryTool` used across coda components.
pub struct ListDirectoryTool {
    policy: Arc<ToolPolicy>,
}

impl ListDirectoryTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for ListDirectoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_directory".to_string(),
            description: "List files and directories, optionally recursively".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "default": "." },
                    "recursive": { "type": "boolean", "default": false }
                },
                "additionalProperties": false
            }),
        }
    }

    fn is_independent(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = optional_string(&arguments, "path")?.unwrap_or_else(|| ".".to_string());
        let recursive = optional_bool(&arguments, "recursive", false)?;
        let resolved =
            resolve_workspace_path(&path, &self.policy, &context, PathMode::Directory)?;

        let entries = walk_directory(
            &self.policy,
            &resolved,
            recursive,
            false,
            &context.cancellation,
        )
        .await?;
        let truncated = entries.len() > self.policy.max_list_entries;
        let files: Vec<Value> = entries
            .into_iter()
            .take(self.policy.max_list_entries)
            .map(|entry| {
                json!({
                    "name": entry.name,
                    "path": workspace_relative(&self.policy, &entry.path),
                    "is_dir": entry.is_dir,
                    "size": entry.size,
                })
            })
            .collect();

        Ok(json!({
            "path": workspace_relative(&self.policy, &resolved),
            "count": files.len(),
            "files": files,
            "truncated": truncated,
        }))
    }
}
