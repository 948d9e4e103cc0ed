//! Unified-diff application against a single workspace file.

use super::*;

/// Public struct `ApplyPatchTool` used across coda components.
pub struct ApplyPatchTool {
    policy: Arc<ToolPolicy>,
}

impl ApplyPatchTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for ApplyPatchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "apply_patch".to_string(),
            description: "Apply a unified diff (one or more @@ hunks) to a single file".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "patch": { "type": "string", "minLength": 1 }
                },
                "required": ["path", "patch"],
                "additionalProperties": false
            }),
        }
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = required_string(&arguments, "path")?;
        let patch = required_string(&arguments, "patch")?;
        let hunks = parse_unified_diff(&patch)?;

        let resolved = resolve_workspace_path(&path, &self.policy, &context, PathMode::Write)?;
        let original = if resolved.exists() {
            tokio::fs::read_to_string(&resolved)
                .await
                .map_err(|error| io_error(&resolved, "read", error))?
        } else if hunks.iter().all(|hunk| hunk.old_start == 0) {
            String::new()
        } else {
            return Err(CodaError::file_not_found(resolved.display()));
        };

        let applied = apply_hunks(&original, &hunks).map_err(|error| {
            error.with_context("path", workspace_relative(&self.policy, &resolved))
        })?;
        if let Some(parent) = resolved.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| io_error(parent, "create directory", error))?;
            }
        }
        write_file_atomically(&resolved, &applied.content)?;

        Ok(json!({
            "path": workspace_relative(&self.policy, &resolved),
            "hunks_applied": hunks.len(),
            "lines_added": applied.lines_added,
            "lines_removed": applied.lines_removed,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    old_start: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    fn expected(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Remove(text) => Some(text.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    fn replacement(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Add(text) => Some(text.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

#[derive(Debug)]
struct AppliedPatch {
    content: String,
    lines_added: usize,
    lines_removed: usize,
}

fn parse_unified_diff(patch: &str) -> CodaResult<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for (index, raw) in patch.lines().enumerate() {
        if raw.starts_with("@@") {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            current = Some(Hunk {
                old_start: parse_hunk_header(raw, index + 1)?,
                lines: Vec::new(),
            });
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            // Preamble: `diff`, `index`, `---` and `+++` lines.
            continue;
        };
        if raw.starts_with("\\") {
            continue;
        }
        let line = match raw.chars().next() {
            Some(' ') => HunkLine::Context(raw[1..].to_string()),
            Some('-') => HunkLine::Remove(raw[1..].to_string()),
            Some('+') => HunkLine::Add(raw[1..].to_string()),
            None => HunkLine::Context(String::new()),
            Some(_) => {
                return Err(CodaError::patch_failed(format!(
                    "unexpected line {} in hunk: '{raw}'",
                    index + 1
                )))
            }
        };
        hunk.lines.push(line);
    }
    if let Some(hunk) = current.take() {
        hunks.push(hunk);
    }

    if hunks.is_empty() {
        return Err(CodaError::patch_failed("patch contains no @@ hunks")
            .with_suggestion("provide a unified diff with @@ -start,count +start,count @@ headers"));
    }
    if let Some(position) = hunks.iter().position(|hunk| hunk.lines.is_empty()) {
        return Err(CodaError::patch_failed(format!("hunk {} is empty", position + 1)));
    }
    Ok(hunks)
}

fn parse_hunk_header(header: &str, line_number: usize) -> CodaResult<usize> {
    let malformed = || {
        CodaError::patch_failed(format!(
            "malformed hunk header on line {line_number}: '{header}'"
        ))
    };
    let old_range = header
        .trim_start_matches('@')
        .split_whitespace()
        .find(|part| part.starts_with('-'))
        .ok_or_else(malformed)?;
    old_range[1..]
        .split(',')
        .next()
        .and_then(|start| start.parse::<usize>().ok())
        .ok_or_else(malformed)
}

fn apply_hunks(original: &str, hunks: &[Hunk]) -> CodaResult<AppliedPatch> {
    let had_trailing_newline = original.is_empty() || original.ends_with('\n');
    let source: Vec<&str> = original.lines().collect();
    let mut output: Vec<String> = Vec::with_capacity(source.len());
    let mut cursor = 0usize;
    let mut lines_added = 0usize;
    let mut lines_removed = 0usize;

    for (index, hunk) in hunks.iter().enumerate() {
        let expected = hunk.expected();
        let hinted = hunk.old_start.saturating_sub(1).max(cursor);
        let position = locate_hunk(&source, &expected, hinted, cursor).ok_or_else(|| {
            CodaError::patch_failed(format!(
                "hunk {} does not match the file near line {}",
                index + 1,
                hunk.old_start
            ))
            .with_suggestion("re-read the file and regenerate the patch against its current content")
        })?;

        output.extend(source[cursor..position].iter().map(|line| line.to_string()));
        output.extend(hunk.replacement().into_iter().map(str::to_string));
        cursor = position + expected.len();
        for line in &hunk.lines {
            match line {
                HunkLine::Add(_) => lines_added += 1,
                HunkLine::Remove(_) => lines_removed += 1,
                HunkLine::Context(_) => {}
            }
        }
    }
    output.extend(source[cursor..].iter().map(|line| line.to_string()));

    let mut content = output.join("\n");
    if had_trailing_newline && !content.is_empty() {
        content.push('\n');
    }
    Ok(AppliedPatch {
        content,
        lines_added,
        lines_removed,
    })
}

/// Finds `expected` at or after `floor`, preferring the header position and
/// then the nearest offset from it.
fn locate_hunk(source: &[&str], expected: &[&str], hinted: usize, floor: usize) -> Option<usize> {
    let matches_at = |start: usize| {
        start + expected.len() <= source.len() && source[start..start + expected.len()] == *expected
    };
    if expected.is_empty() {
        return Some(hinted.min(source.len()));
    }
    if matches_at(hinted) {
        return Some(hinted);
    }
    let last_start = source.len().checked_sub(expected.len())?;
    (1..=last_start.max(hinted)).find_map(|distance| {
        let after = hinted + distance;
        if after <= last_start && matches_at(after) {
            return Some(after);
        }
        let before = hinted.checked_sub(distance)?;
        (before >= floor && matches_at(before)).then_some(before)
    })
}
