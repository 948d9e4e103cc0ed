//! LLM boundary for coda: message types, the client trait, and an
//! OpenAI-compatible chat-completions client.
mod openai;
mod types;

pub use openai::{OpenAiClient, OpenAiConfig, OPENAI_API_KEY_ENV};
pub use types::{
    ChatRequest, ChatResponse, ChatUsage, CodaAiError, ContentBlock, LlmClient, Message,
    MessageRole, StreamDeltaHandler, ToolCall, ToolDefinition,
};
