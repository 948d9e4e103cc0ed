//! Workspace confinement and size limits shared by the built-in tools.

use super::*;

#[derive(Debug, Clone)]
/// Public struct `ToolPolicy` used across coda components.
pub struct ToolPolicy {
    pub workspace_root: PathBuf,
    pub max_file_read_bytes: usize,
    pub max_file_write_bytes: usize,
    pub max_command_output_bytes: usize,
    pub command_timeout_ms: u64,
    pub max_read_lines: usize,
    pub max_list_entries: usize,
    pub max_search_results: usize,
}

impl ToolPolicy {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_file_read_bytes: 1_000_000,
            max_file_write_bytes: 1_000_000,
            max_command_output_bytes: 16_000,
            command_timeout_ms: 30_000,
            max_read_lines: 1_000,
            max_list_entries: 1_000,
            max_search_results: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PathMode {
    Read,
    Write,
    Directory,
    Existing,
}

/// Resolves `user_path` against the context working directory and confines
/// it to the workspace root.
///
/// A path that leaves the root lexically is `PathTraversal`; one that stays
/// inside lexically but resolves outside through a symlink is
/// `SymlinkEscape`.
pub(super) fn resolve_workspace_path(
    user_path: &str,
    policy: &ToolPolicy,
    context: &ToolContext,
    mode: PathMode,
) -> CodaResult<PathBuf> {
    if user_path.trim().is_empty() {
        return Err(CodaError::invalid_input("path must not be empty"));
    }

    let root = normalize_lexically(&absolute_from_cwd(&policy.workspace_root)?);
    let canonical_root = canonicalize_best_effort(&root).map_err(|error| {
        CodaError::wrap(
            coda_core::ErrorCode::Internal,
            format!("invalid workspace root '{}'", root.display()),
            error,
        )
    })?;

    let input = PathBuf::from(user_path);
    let absolute = if input.is_absolute() {
        input
    } else {
        absolute_from_cwd(&context.working_dir)?.join(input)
    };
    let lexical = normalize_lexically(&absolute);
    if !lexical.starts_with(&root) && !lexical.starts_with(&canonical_root) {
        return Err(CodaError::path_traversal(lexical.display(), root.display()));
    }

    let resolved = canonicalize_best_effort(&lexical).map_err(|error| {
        CodaError::wrap(
            coda_core::ErrorCode::Internal,
            format!("failed to resolve path '{}'", lexical.display()),
            error,
        )
        .with_context("path", lexical.display())
    })?;
    if !resolved.starts_with(&canonical_root) {
        return Err(CodaError::symlink_escape(
            lexical.display(),
            resolved.display(),
            canonical_root.display(),
        ));
    }

    match mode {
        PathMode::Read if !resolved.exists() => {
            Err(CodaError::file_not_found(lexical.display()))
        }
        PathMode::Read if resolved.is_dir() => Err(CodaError::invalid_input(format!(
            "path '{}' is a directory",
            lexical.display()
        ))
        .with_context("path", lexical.display())),
        PathMode::Directory | PathMode::Existing if !resolved.exists() => {
            Err(CodaError::file_not_found(lexical.display()))
        }
        PathMode::Directory if !resolved.is_dir() => {
            Err(CodaError::not_a_directory(lexical.display()))
        }
        PathMode::Write if resolved.is_dir() => Err(CodaError::invalid_input(format!(
            "path '{}' is a directory",
            lexical.display()
        ))
        .with_context("path", lexical.display())),
        _ => Ok(resolved),
    }
}

/// Display form of `path` relative to the workspace root, `/`-separated.
pub(super) fn workspace_relative(policy: &ToolPolicy, path: &Path) -> String {
    let root = canonicalize_best_effort(&policy.workspace_root)
        .unwrap_or_else(|_| policy.workspace_root.clone());
    let relative = path.strip_prefix(&root).unwrap_or(path);
    let rendered = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/");
    if rendered.is_empty() {
        ".".to_string()
    } else {
        rendered
    }
}

fn absolute_from_cwd(path: &Path) -> CodaResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|error| {
        CodaError::wrap(
            coda_core::ErrorCode::Internal,
            "failed to resolve current directory",
            error,
        )
    })?;
    Ok(cwd.join(path))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

pub(super) fn canonicalize_best_effort(path: &Path) -> std::io::Result<PathBuf> {
    if path.exists() {
        return std::fs::canonicalize(path);
    }

    let mut missing_suffix: Vec<OsString> = Vec::new();
    let mut cursor = path;

    while !cursor.exists() {
        if let Some(file_name) = cursor.file_name() {
            missing_suffix.push(file_name.to_os_string());
        }

        cursor = match cursor.parent() {
            Some(parent) => parent,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no existing ancestor for path",
                ));
            }
        };
    }

    let mut canonical = std::fs::canonicalize(cursor)?;
    for component in missing_suffix.iter().rev() {
        canonical.push(component);
    }

    Ok(canonical)
}
