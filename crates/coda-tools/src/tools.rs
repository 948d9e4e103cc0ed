use std::{
    collections::VecDeque,
    ffi::OsString,
    path::{Component, Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use coda_ai::ToolDefinition;
use coda_core::{write_text_atomic, CodaError, CodaResult};
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use tokio::{process::Command, time::timeout};

use crate::{ToolContext, ToolHandler, ToolRegistry};

mod edit_tools;
mod exec_tools;
mod file_tools;
mod patch_tool;
mod search_tools;
mod tool_policy;


pub use edit_tools::{EditLinesTool, PreviewReplaceTool, SearchReplaceTool};
pub use exec_tools::{ExecuteCommandTool, ExecuteProgramTool};
pub use file_tools::{ListDirectoryTool, ReadFileTool, ReplaceInFileTool, WriteFileTool};
pub use patch_tool::ApplyPatchTool;
pub use search_tools::{GrepSearchTool, SearchFilesTool};
pub use tool_policy::ToolPolicy;

use tool_policy::{
    canonicalize_best_effort, resolve_workspace_path, workspace_relative, PathMode,
};

const SKIPPED_DIRECTORY_NAMES: &[&str] = &[".git"];

/// Names of the tools installed by [`register_builtin_tools`], in order.
pub fn builtin_tool_names() -> &'static [&'static str] {
    &[
        "read_file",
        "write_file",
        "replace_in_file",
        "preview_replace_in_file",
        "edit_lines",
        "search_replace",
        "list_directory",
        "search_files",
        "grep_search",
        "execute_command",
        "execute_program",
        "apply_patch",
    ]
}

/// Registers the built-in workspace tools under one shared policy.
pub fn register_builtin_tools(registry: &mut ToolRegistry, policy: ToolPolicy) -> CodaResult<()> {
    let policy = Arc::new(policy);
    registry.register_tool(ReadFileTool::new(policy.clone()))?;
    registry.register_tool(WriteFileTool::new(policy.clone()))?;
    registry.register_tool(ReplaceInFileTool::new(policy.clone()))?;
    registry.register_tool(PreviewReplaceTool::new(policy.clone()))?;
    registry.register_tool(EditLinesTool::new(policy.clone()))?;
    registry.register_tool(SearchReplaceTool::new(policy.clone()))?;
    registry.register_tool(ListDirectoryTool::new(policy.clone()))?;
    registry.register_tool(SearchFilesTool::new(policy.clone()))?;
    registry.register_tool(GrepSearchTool::new(policy.clone()))?;
    registry.register_tool(ExecuteCommandTool::new(policy.clone()))?;
    registry.register_tool(ExecuteProgramTool::new(policy.clone()))?;
    registry.register_tool(ApplyPatchTool::new(policy))?;
    Ok(())
}

fn required_string(arguments: &Value, key: &str) -> CodaResult<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.to_string())
        .ok_or_else(|| {
            CodaError::invalid_input(format!("missing required string argument '{key}'"))
        })
}

fn optional_string(arguments: &Value, key: &str) -> CodaResult<Option<String>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(CodaError::invalid_input(format!(
            "optional argument '{key}' must be a string"
        ))),
    }
}

fn optional_bool(arguments: &Value, key: &str, default: bool) -> CodaResult<bool> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(CodaError::invalid_input(format!(
            "optional argument '{key}' must be a boolean"
        ))),
    }
}

fn optional_usize(arguments: &Value, key: &str) -> CodaResult<Option<usize>> {
    let Some(value) = arguments.get(key).filter(|value| !value.is_null()) else {
        return Ok(None);
    };
    let parsed = value.as_u64().ok_or_else(|| {
        CodaError::invalid_input(format!("optional argument '{key}' must be an integer"))
    })?;
    if parsed == 0 {
        return Err(CodaError::invalid_input(format!(
            "optional argument '{key}' must be greater than 0"
        )));
    }
    Ok(Some(usize::try_from(parsed).unwrap_or(usize::MAX)))
}

fn io_error(path: &Path, operation: &str, error: std::io::Error) -> CodaError {
    match error.kind() {
        std::io::ErrorKind::NotFound => CodaError::file_not_found(path.display()),
        std::io::ErrorKind::PermissionDenied => CodaError::permission_denied(path.display()),
        _ => CodaError::wrap(
            coda_core::ErrorCode::Internal,
            format!("failed to {operation} '{}'", path.display()),
            error,
        )
        .with_context("path", path.display()),
    }
}

fn write_file_atomically(path: &Path, content: &str) -> CodaResult<()> {
    write_text_atomic(path, content).map_err(|error| {
        match error.downcast_ref::<std::io::Error>().map(std::io::Error::kind) {
            Some(std::io::ErrorKind::PermissionDenied) => {
                CodaError::permission_denied(path.display())
            }
            _ => CodaError::internal(format!("{error:#}")).with_context("path", path.display()),
        }
    })
}

fn truncate_bytes(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }

    if limit == 0 {
        return "<output truncated>".to_string();
    }

    let mut end = limit.min(value.len());
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut output = value[..end].to_string();
    output.push_str("\n<output truncated>");
    output
}

/// Compiles a `*` / `?` wildcard into an anchored regex.
fn wildcard_regex(pattern: &str) -> CodaResult<Regex> {
    let mut expression = String::from("^");
    for character in pattern.chars() {
        match character {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    Regex::new(&expression).map_err(|error| {
        CodaError::invalid_input(format!("invalid wildcard pattern '{pattern}': {error}"))
    })
}

#[derive(Debug, Clone)]
struct WalkEntry {
    path: PathBuf,
    name: String,
    is_dir: bool,
    size: u64,
}

/// Breadth-first listing below `root`. Symlinked directories are reported
/// but never descended into; symlinks resolving outside the workspace root
/// are left out of the listing.
async fn walk_directory(
    policy: &ToolPolicy,
    root: &Path,
    recursive: bool,
    skip_hidden_vcs: bool,
    cancellation: &coda_core::CancellationToken,
) -> CodaResult<Vec<WalkEntry>> {
    let canonical_root = canonicalize_best_effort(&policy.workspace_root)
        .map_err(|error| io_error(&policy.workspace_root, "resolve workspace root", error))?;
    let mut pending = VecDeque::from([root.to_path_buf()]);
    let mut entries = Vec::new();

    while let Some(directory) = pending.pop_front() {
        if cancellation.is_cancelled() {
            return Err(CodaError::cancelled("directory walk"));
        }
        let mut reader = tokio::fs::read_dir(&directory)
            .await
            .map_err(|error| io_error(&directory, "read directory", error))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|error| io_error(&directory, "read directory", error))?
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = tokio::fs::symlink_metadata(&path)
                .await
                .map_err(|error| io_error(&path, "inspect", error))?;
            if metadata.file_type().is_symlink() {
                let Some(target_metadata) = confined_symlink_target(&path, &canonical_root).await
                else {
                    tracing::debug!(path = %path.display(), "skipping symlink outside workspace");
                    continue;
                };
                entries.push(WalkEntry {
                    path,
                    name,
                    is_dir: target_metadata.is_dir(),
                    size: if target_metadata.is_dir() {
                        0
                    } else {
                        target_metadata.len()
                    },
                });
                continue;
            }
            let is_dir = metadata.file_type().is_dir();
            if is_dir && skip_hidden_vcs && SKIPPED_DIRECTORY_NAMES.contains(&name.as_str()) {
                continue;
            }
            if is_dir && recursive {
                pending.push_back(path.clone());
            }
            entries.push(WalkEntry {
                path,
                name,
                is_dir,
                size: if is_dir { 0 } else { metadata.len() },
            });
        }
    }

    entries.sort_by(|left, right| left.path.cmp(&right.path));
    Ok(entries)
}

/// Metadata of the symlink target, or `None` when the link dangles or
/// resolves outside `canonical_root`.
async fn confined_symlink_target(
    path: &Path,
    canonical_root: &Path,
) -> Option<std::fs::Metadata> {
    let target = tokio::fs::canonicalize(path).await.ok()?;
    if !target.starts_with(canonical_root) {
        return None;
    }
    tokio::fs::metadata(&target).await.ok()
}
