//! Tool registry, workspace policy and the built-in coding tools.
mod provider;
mod registry;
mod tools;

pub use provider::{register_provider_tools, StaticToolProvider, ToolProvider};
pub use registry::{ToolContext, ToolEntry, ToolHandler, ToolProgressSink, ToolRegistry};
pub use tools::{
    builtin_tool_names, register_builtin_tools, ApplyPatchTool, EditLinesTool,
    ExecuteCommandTool, ExecuteProgramTool, GrepSearchTool, ListDirectoryTool,
    PreviewReplaceTool, ReadFileTool, ReplaceInFileTool, SearchFilesTool, SearchReplaceTool,
    ToolPolicy, WriteFileTool,
};
