//! Line-addressed edits, SEARCH/REPLACE blocks and replace previews.

use super::*;

const PREVIEW_CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineEditMode {
    Replace,
    Insert,
    Delete,
}

impl LineEditMode {
    fn parse(value: Option<&str>) -> CodaResult<Self> {
        match value.unwrap_or("replace") {
            "replace" => Ok(Self::Replace),
            "insert" => Ok(Self::Insert),
            "delete" => Ok(Self::Delete),
            other => Err(CodaError::invalid_input(format!(
                "mode must be 'replace', 'insert' or 'delete', got '{other}'"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Insert => "insert",
            Self::Delete => "delete",
        }
    }
}

/// File content split into lines, remembering whether it ended with `\n`.
struct TextLines {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl TextLines {
    fn parse(content: &str) -> Self {
        let trailing_newline = content.ends_with('\n');
        let body = content.strip_suffix('\n').unwrap_or(content);
        let lines = if content.is_empty() {
            Vec::new()
        } else {
            body.split('\n').map(str::to_string).collect()
        };
        Self {
            lines,
            trailing_newline,
        }
    }

    fn render(&self) -> String {
        let mut rendered = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            rendered.push('\n');
        }
        rendered
    }
}

/// Applies one line edit in place and returns the number of lines affected.
///
/// `start_line` and `end_line` are 1-based and inclusive. `end_line` is
/// clamped to the file length; `insert` accepts `start_line == len + 1` to
/// append.
fn apply_line_edit(
    text: &mut TextLines,
    mode: LineEditMode,
    start_line: usize,
    end_line: usize,
    new_lines: &str,
) -> CodaResult<usize> {
    if end_line < start_line {
        return Err(CodaError::invalid_input(format!(
            "end_line ({end_line}) must be >= start_line ({start_line})"
        )));
    }
    let total = text.lines.len();
    let limit = if mode == LineEditMode::Insert {
        total + 1
    } else {
        total
    };
    if start_line > limit {
        return Err(CodaError::invalid_input(format!(
            "start_line ({start_line}) exceeds file length ({total} lines)"
        )));
    }

    let start = start_line - 1;
    let end = end_line.min(total);
    let replacement: Vec<String> = new_lines
        .strip_suffix('\n')
        .unwrap_or(new_lines)
        .split('\n')
        .map(str::to_string)
        .collect();
    let affected = match mode {
        LineEditMode::Replace => {
            text.lines.splice(start..end, replacement);
            end - start
        }
        LineEditMode::Insert => {
            let count = replacement.len();
            text.lines.splice(start..start, replacement);
            count
        }
        LineEditMode::Delete => {
            text.lines.drain(start..end);
            end - start
        }
    };
    Ok(affected)
}

/// Renders the region where `before` and `after` differ, with context lines.
///
/// Unchanged lines are prefixed with a space, removed lines with `-` (old
/// numbering) and added lines with `+` (new numbering).
fn render_change_preview(before: &str, after: &str, context: usize) -> String {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();
    let prefix = old
        .iter()
        .zip(&new)
        .take_while(|(left, right)| left == right)
        .count();
    if prefix == old.len() && prefix == new.len() {
        return "no changes".to_string();
    }
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(left, right)| left == right)
        .count();

    let mut rendered = Vec::new();
    let head_start = prefix.saturating_sub(context);
    for (index, line) in old.iter().enumerate().take(prefix).skip(head_start) {
        rendered.push(format!("  {:>4}: {line}", index + 1));
    }
    for (index, line) in old.iter().enumerate().take(old.len() - suffix).skip(prefix) {
        rendered.push(format!("- {:>4}: {line}", index + 1));
    }
    for (index, line) in new.iter().enumerate().take(new.len() - suffix).skip(prefix) {
        rendered.push(format!("+ {:>4}: {line}", index + 1));
    }
    let tail_start = new.len() - suffix;
    for (index, line) in new.iter().enumerate().skip(tail_start).take(context) {
        rendered.push(format!("  {:>4}: {line}", index + 1));
    }
    rendered.join("\n")
}

async fn read_text_file(policy: &ToolPolicy, resolved: &Path) -> CodaResult<String> {
    let metadata = tokio::fs::metadata(resolved)
        .await
        .map_err(|error| io_error(resolved, "inspect", error))?;
    if metadata.len() > policy.max_file_read_bytes as u64 {
        return Err(CodaError::invalid_input(format!(
            "file is too large ({} bytes), limit is {} bytes",
            metadata.len(),
            policy.max_file_read_bytes
        ))
        .with_context("path", resolved.display()));
    }
    tokio::fs::read_to_string(resolved)
        .await
        .map_err(|error| io_error(resolved, "read", error))
}

/// Public struct `EditLinesTool` used across coda components.
pub struct EditLinesTool {
    policy: Arc<ToolPolicy>,
}

impl EditLinesTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for EditLinesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "edit_lines".to_string(),
            description: "Edit a file by line number: replace or delete lines start_line..=\
                          end_line, or insert new_lines before start_line. Set preview to \
                          inspect the change without writing."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "start_line": { "type": "integer", "minimum": 1 },
                    "end_line": { "type": "integer", "minimum": 1 },
                    "new_lines": { "type": "string" },
                    "mode": { "type": "string", "enum": ["replace", "insert", "delete"] },
                    "preview": { "type": "boolean", "default": false }
                },
                "required": ["path", "start_line", "end_line"],
                "additionalProperties": false
            }),
        }
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = required_string(&arguments, "path")?;
        let start_line = optional_usize(&arguments, "start_line")?
            .ok_or_else(|| CodaError::invalid_input("missing required argument 'start_line'"))?;
        let end_line = optional_usize(&arguments, "end_line")?
            .ok_or_else(|| CodaError::invalid_input("missing required argument 'end_line'"))?;
        let mode = LineEditMode::parse(optional_string(&arguments, "mode")?.as_deref())?;
        let new_lines = optional_string(&arguments, "new_lines")?.unwrap_or_default();
        let preview_only = optional_bool(&arguments, "preview", false)?;
        if mode != LineEditMode::Delete && new_lines.is_empty() {
            return Err(CodaError::invalid_input(format!(
                "new_lines is required for mode '{}'",
                mode.as_str()
            )));
        }

        let resolved = resolve_workspace_path(&path, &self.policy, &context, PathMode::Read)?;
        let original = read_text_file(&self.policy, &resolved).await?;
        let mut text = TextLines::parse(&original);
        let relative = workspace_relative(&self.policy, &resolved);
        let lines_modified = apply_line_edit(&mut text, mode, start_line, end_line, &new_lines)
            .map_err(|error| error.with_context("path", &relative))?;
        let updated = text.render();
        let preview = render_change_preview(&original, &updated, PREVIEW_CONTEXT_LINES);

        if !preview_only {
            write_file_atomically(&resolved, &updated)?;
        }
        Ok(json!({
            "path": relative,
            "mode": mode.as_str(),
            "lines_modified": lines_modified,
            "applied": !preview_only,
            "preview": preview,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchReplaceBlock {
    search: String,
    replace: String,
}

fn is_marker(line: &str, fill: char, label: &str) -> bool {
    let rest = line.trim_start_matches(fill);
    if line.len() - rest.len() < 3 * fill.len_utf8() {
        return false;
    }
    let rest = rest.trim();
    rest.strip_suffix('>').unwrap_or(rest).trim_end() == label
}

fn is_search_start(line: &str) -> bool {
    is_marker(line, '-', "SEARCH") || is_marker(line, '<', "SEARCH")
}

fn is_search_end(line: &str) -> bool {
    is_marker(line, '=', "")
}

fn is_replace_end(line: &str) -> bool {
    is_marker(line, '+', "REPLACE") || is_marker(line, '>', "REPLACE")
}

/// Parses `------- SEARCH` / `=======` / `+++++++ REPLACE` blocks. The
/// `<<<<<<< SEARCH` / `>>>>>>> REPLACE` spelling is accepted too.
fn parse_search_replace_blocks(diff: &str) -> CodaResult<Vec<SearchReplaceBlock>> {
    enum State {
        Idle,
        Search(Vec<String>),
        Replace(Vec<String>, Vec<String>),
    }

    let mut blocks = Vec::new();
    let mut state = State::Idle;
    for (index, line) in diff.lines().enumerate() {
        let marker = line.trim();
        state = match state {
            State::Idle if is_search_start(marker) => State::Search(Vec::new()),
            State::Idle => State::Idle,
            State::Search(search) if is_search_end(marker) => State::Replace(search, Vec::new()),
            State::Search(mut search) => {
                search.push(line.to_string());
                State::Search(search)
            }
            State::Replace(search, replace) if is_replace_end(marker) => {
                if search.is_empty() {
                    return Err(CodaError::patch_failed(format!(
                        "empty SEARCH block ending on line {}",
                        index + 1
                    )));
                }
                blocks.push(SearchReplaceBlock {
                    search: search.join("\n"),
                    replace: replace.join("\n"),
                });
                State::Idle
            }
            State::Replace(search, mut replace) => {
                replace.push(line.to_string());
                State::Replace(search, replace)
            }
        };
    }

    if !matches!(state, State::Idle) {
        return Err(CodaError::patch_failed("incomplete SEARCH/REPLACE block")
            .with_suggestion("close every block with a '+++++++ REPLACE' line"));
    }
    if blocks.is_empty() {
        return Err(CodaError::patch_failed("no SEARCH/REPLACE blocks found").with_suggestion(
            "wrap edits as '------- SEARCH', old text, '=======', new text, '+++++++ REPLACE'",
        ));
    }
    Ok(blocks)
}

/// Byte span of the first run of lines at or after `from` whose trimmed text
/// equals the trimmed SEARCH lines.
fn line_trimmed_span(content: &str, search: &str, from: usize) -> Option<(usize, usize)> {
    let wanted: Vec<&str> = search.lines().map(str::trim).collect();
    if wanted.is_empty() {
        return None;
    }
    let mut offset = from;
    let mut lines = Vec::new();
    for line in content[from..].split('\n') {
        lines.push((offset, line));
        offset += line.len() + 1;
    }
    lines
        .windows(wanted.len())
        .find(|window| {
            window
                .iter()
                .zip(&wanted)
                .all(|((_, line), wanted)| line.trim() == *wanted)
        })
        .and_then(|window| {
            let (start, _) = window.first()?;
            let (last_start, last) = window.last()?;
            Some((*start, last_start + last.len()))
        })
}

/// Applies blocks in order, each searching after the previous replacement.
/// Returns the new content and the byte offset each block matched at.
fn apply_search_replace_blocks(
    content: &str,
    blocks: &[SearchReplaceBlock],
) -> CodaResult<(String, Vec<usize>)> {
    let mut result = content.to_string();
    let mut cursor = 0;
    let mut offsets = Vec::with_capacity(blocks.len());
    for (index, block) in blocks.iter().enumerate() {
        let span = result[cursor..]
            .find(&block.search)
            .map(|position| (cursor + position, cursor + position + block.search.len()))
            .or_else(|| line_trimmed_span(&result, &block.search, cursor));
        let Some((start, end)) = span else {
            return Err(CodaError::patch_failed(format!(
                "block {} SEARCH content was not found",
                index + 1
            ))
            .with_context("block", index + 1)
            .with_context("blocks_applied", index)
            .with_suggestion("read the file again and copy the SEARCH text exactly"));
        };
        result.replace_range(start..end, &block.replace);
        cursor = start + block.replace.len();
        offsets.push(start);
    }
    Ok((result, offsets))
}

/// Public struct `SearchReplaceTool` used across coda components.
pub struct SearchReplaceTool {
    policy: Arc<ToolPolicy>,
}

impl SearchReplaceTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for SearchReplaceTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_replace".to_string(),
            description: "Apply one or more SEARCH/REPLACE blocks to a file. Format each block \
                          as '------- SEARCH', the exact old lines, '=======', the new lines, \
                          '+++++++ REPLACE'. Blocks apply in file order; whitespace-only \
                          differences are tolerated."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "diff": { "type": "string", "minLength": 1 },
                    "preview": { "type": "boolean", "default": false }
                },
                "required": ["path", "diff"],
                "additionalProperties": false
            }),
        }
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = required_string(&arguments, "path")?;
        let diff = required_string(&arguments, "diff")?;
        let preview_only = optional_bool(&arguments, "preview", false)?;
        let blocks = parse_search_replace_blocks(&diff)?;

        let resolved = resolve_workspace_path(&path, &self.policy, &context, PathMode::Read)?;
        let relative = workspace_relative(&self.policy, &resolved);
        let original = read_text_file(&self.policy, &resolved).await?;
        let (updated, offsets) = apply_search_replace_blocks(&original, &blocks)
            .map_err(|error| error.with_context("path", &relative))?;
        let preview = render_change_preview(&original, &updated, PREVIEW_CONTEXT_LINES);

        if !preview_only {
            write_file_atomically(&resolved, &updated)?;
        }
        Ok(json!({
            "path": relative,
            "total_blocks": blocks.len(),
            "blocks_applied": offsets.len(),
            "match_offsets": offsets,
            "applied": !preview_only,
            "preview": preview,
        }))
    }
}

/// Public struct `PreviewReplaceTool` used across coda components.
pub struct PreviewReplaceTool {
    policy: Arc<ToolPolicy>,
}

impl PreviewReplaceTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for PreviewReplaceTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "preview_replace_in_file".to_string(),
            description: "Show what replace_in_file would change without writing: the number \
                          of occurrences and the changed lines with context"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_text": { "type": "string", "minLength": 1 },
                    "new_text": { "type": "string" },
                    "context": { "type": "integer", "minimum": 0 }
                },
                "required": ["path", "old_text", "new_text"],
                "additionalProperties": false
            }),
        }
    }

    fn is_independent(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Value, context: ToolContext) -> CodaResult<Value> {
        let path = required_string(&arguments, "path")?;
        let old_text = required_string(&arguments, "old_text")?;
        let new_text = required_string(&arguments, "new_text")?;
        let context_lines = arguments
            .get("context")
            .and_then(Value::as_u64)
            .map(|lines| usize::try_from(lines).unwrap_or(usize::MAX))
            .unwrap_or(PREVIEW_CONTEXT_LINES);
        if old_text.is_empty() {
            return Err(CodaError::invalid_input("old_text must not be empty"));
        }

        let resolved = resolve_workspace_path(&path, &self.policy, &context, PathMode::Read)?;
        let original = read_text_file(&self.policy, &resolved).await?;
        let occurrences = original.matches(old_text.as_str()).count();
        if occurrences == 0 {
            return Err(CodaError::invalid_input("old_text was not found in the file")
                .with_context("path", resolved.display()));
        }

        let updated = original.replace(old_text.as_str(), &new_text);
        Ok(json!({
            "path": workspace_relative(&self.policy, &resolved),
            "replacement_count": occurrences,
            "preview": render_change_preview(&original, &updated, context_lines),
        }))
    }
}
