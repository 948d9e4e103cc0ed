use async_trait::async_trait;
use coda_core::generate_id;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    ChatRequest, ChatResponse, ChatUsage, CodaAiError, ContentBlock, LlmClient, Message,
    MessageRole, StreamDeltaHandler, ToolDefinition,
};

/// Environment variable consulted for the OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone)]
/// Public struct `OpenAiConfig` used across coda components.
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub organization: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            organization: None,
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone)]
/// Chat-completions client for OpenAI-compatible endpoints.
///
/// The client performs exactly one HTTP attempt per call; retry policy is
/// owned by callers.
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, CodaAiError> {
        if config.api_key.trim().is_empty() {
            return Err(CodaAiError::MissingApiKey {
                env_var: OPENAI_API_KEY_ENV.to_string(),
            });
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|e| {
                CodaAiError::InvalidResponse(format!("invalid API key header: {e}"))
            })?,
        );
        if let Some(org) = &config.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org).map_err(|e| {
                    CodaAiError::InvalidResponse(format!("invalid organization header: {e}"))
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    fn chat_completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }

        format!("{base}/chat/completions")
    }

    async fn complete_via_chat(
        &self,
        request: &ChatRequest,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<ChatResponse, CodaAiError> {
        let mut body = build_chat_request_body(request)?;
        if on_delta.is_some() {
            body["stream"] = json!(true);
        }

        let response = self
            .client
            .post(self.chat_completions_url())
            .header("x-coda-request-id", generate_id("req"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await?;
            return Err(CodaAiError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }

        if let Some(delta_handler) = on_delta {
            let is_event_stream = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
                .unwrap_or(false);
            if is_event_stream {
                return parse_chat_stream_response(response, delta_handler).await;
            }

            let raw = response.text().await?;
            let parsed = parse_chat_response(&raw)?;
            let text = parsed.message.text_content();
            if !text.is_empty() {
                delta_handler(text);
            }
            return Ok(parsed);
        }

        let raw = response.text().await?;
        parse_chat_response(&raw)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, CodaAiError> {
        self.complete_via_chat(&request, None).await
    }

    async fn complete_with_stream(
        &self,
        request: ChatRequest,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<ChatResponse, CodaAiError> {
        self.complete_via_chat(&request, on_delta).await
    }
}

fn build_chat_request_body(request: &ChatRequest) -> Result<Value, CodaAiError> {
    let mut messages = to_openai_messages(&request.messages)?;
    if !request.state.is_empty() {
        let rendered = serde_json::to_string(&request.state)?;
        messages.push(json!({
            "role": "system",
            "content": format!("Current session state: {rendered}"),
        }));
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        body["tools"] = to_openai_tools(&request.tools);
        body["tool_choice"] = json!("auto");
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }

    Ok(body)
}

fn to_openai_tools(tools: &[ToolDefinition]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

fn to_openai_messages(messages: &[Message]) -> Result<Vec<Value>, CodaAiError> {
    let mut serialized = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            MessageRole::System => serialized.push(json!({
                "role": "system",
                "content": message.text_content(),
            })),
            MessageRole::User => serialized.push(json!({
                "role": "user",
                "content": message.text_content(),
            })),
            MessageRole::Assistant => {
                let tool_calls: Vec<Value> = message
                    .tool_calls()
                    .into_iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": stringify_tool_arguments(&call.arguments),
                            }
                        })
                    })
                    .collect();

                let text = message.text_content();
                let content = if text.trim().is_empty() && !tool_calls.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };

                if tool_calls.is_empty() {
                    serialized.push(json!({
                        "role": "assistant",
                        "content": content,
                    }));
                } else {
                    serialized.push(json!({
                        "role": "assistant",
                        "content": content,
                        "tool_calls": tool_calls,
                    }));
                }
            }
            MessageRole::Tool => {
                let Some(tool_call_id) = message.tool_call_id.as_deref() else {
                    return Err(CodaAiError::InvalidResponse(
                        "tool message is missing tool_call_id".to_string(),
                    ));
                };

                let mut tool_message = json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": message.text_content(),
                });
                if let Some(name) = &message.tool_name {
                    tool_message["name"] = Value::String(name.clone());
                }
                serialized.push(tool_message);
            }
        }
    }

    Ok(serialized)
}

fn stringify_tool_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(value) => value.clone(),
        value => value.to_string(),
    }
}

fn parse_tool_call_arguments(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value) => value,
        Err(_) => Value::String(arguments.to_string()),
    }
}

fn parse_chat_response(raw: &str) -> Result<ChatResponse, CodaAiError> {
    let parsed: OpenAiChatResponse = serde_json::from_str(raw)?;
    let choice =
        parsed.choices.into_iter().next().ok_or_else(|| {
            CodaAiError::InvalidResponse("response contained no choices".to_string())
        })?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content.filter(|text| !text.is_empty()) {
        content.push(ContentBlock::Text { text });
    }
    for tool_call in choice.message.tool_calls.unwrap_or_default() {
        if tool_call.call_type != "function" {
            continue;
        }
        content.push(ContentBlock::ToolCall {
            id: tool_call.id,
            name: tool_call.function.name,
            arguments: parse_tool_call_arguments(&tool_call.function.arguments),
        });
    }

    Ok(ChatResponse {
        message: Message::assistant_blocks(content),
        finish_reason: choice.finish_reason,
        usage: parsed.usage.map(ChatUsage::from).unwrap_or_default(),
    })
}

async fn parse_chat_stream_response(
    response: reqwest::Response,
    on_delta: StreamDeltaHandler,
) -> Result<ChatResponse, CodaAiError> {
    let mut stream = response.bytes_stream();
    let mut lines = SseLineBuffer::default();
    let mut state = StreamAccumulator::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in lines.push(chunk.as_ref())? {
            if apply_stream_line(&line, &on_delta, &mut state)? {
                return Ok(state.finish());
            }
        }
    }

    let trailing = lines.finish()?;
    apply_stream_line(&trailing, &on_delta, &mut state)?;
    Ok(state.finish())
}

/// Splits raw SSE bytes into lines. Bytes are only decoded once a full line
/// has arrived, so a multi-byte character split across chunks stays intact.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, CodaAiError> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_stream_line(&line[..pos])?);
        }
        Ok(lines)
    }

    fn finish(self) -> Result<String, CodaAiError> {
        decode_stream_line(&self.pending)
    }
}

fn decode_stream_line(bytes: &[u8]) -> Result<String, CodaAiError> {
    std::str::from_utf8(bytes)
        .map(|line| line.trim().to_string())
        .map_err(|error| {
            CodaAiError::InvalidResponse(format!("invalid UTF-8 in streaming response: {error}"))
        })
}

/// Applies one SSE line; returns `true` once the `[DONE]` marker arrives.
fn apply_stream_line(
    line: &str,
    on_delta: &StreamDeltaHandler,
    state: &mut StreamAccumulator,
) -> Result<bool, CodaAiError> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(false);
    };
    if data == "[DONE]" {
        return Ok(true);
    }
    apply_stream_data(data, on_delta, state)?;
    Ok(false)
}

#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    tool_calls: Vec<ToolCallAccumulator>,
    finish_reason: Option<String>,
    usage: ChatUsage,
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    fn finish(self) -> ChatResponse {
        let mut content = Vec::new();
        if !self.text.trim().is_empty() {
            content.push(ContentBlock::Text { text: self.text });
        }

        for (index, tool_call) in self.tool_calls.into_iter().enumerate() {
            if tool_call.name.trim().is_empty() {
                continue;
            }
            let id = if tool_call.id.trim().is_empty() {
                format!("stream_tool_call_{}", index + 1)
            } else {
                tool_call.id
            };
            content.push(ContentBlock::ToolCall {
                id,
                name: tool_call.name,
                arguments: parse_tool_call_arguments(&tool_call.arguments),
            });
        }

        ChatResponse {
            message: Message::assistant_blocks(content),
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

fn apply_stream_data(
    data: &str,
    on_delta: &StreamDeltaHandler,
    state: &mut StreamAccumulator,
) -> Result<(), CodaAiError> {
    let chunk: OpenAiStreamChunk = serde_json::from_str(data).map_err(|error| {
        CodaAiError::InvalidResponse(format!("failed to parse OpenAI stream chunk: {error}"))
    })?;

    if let Some(usage) = chunk.usage {
        state.usage = usage.into();
    }

    for choice in chunk.choices {
        if let Some(reason) = choice.finish_reason {
            state.finish_reason = Some(reason);
        }
        let Some(delta) = choice.delta else {
            continue;
        };

        if let Some(delta_text) = delta.content.filter(|text| !text.is_empty()) {
            state.text.push_str(&delta_text);
            on_delta(delta_text);
        }

        for delta_call in delta.tool_calls.unwrap_or_default() {
            let index = delta_call.index;
            if state.tool_calls.len() <= index {
                state
                    .tool_calls
                    .resize_with(index + 1, ToolCallAccumulator::default);
            }
            let current = &mut state.tool_calls[index];
            if let Some(id) = delta_call.id.filter(|id| !id.is_empty()) {
                current.id = id;
            }
            if let Some(function) = delta_call.function {
                if let Some(name) = function.name.filter(|name| !name.is_empty()) {
                    current.name = name;
                }
                if let Some(arguments) = function.arguments {
                    current.arguments.push_str(&arguments);
                }
            }
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl From<OpenAiUsage> for ChatUsage {
    fn from(usage: OpenAiUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<OpenAiStreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}
