use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use coda_ai::{
    ChatRequest, CodaAiError, LlmClient, Message, OpenAiClient, OpenAiConfig, ToolDefinition,
};
use httpmock::prelude::*;
use serde_json::json;

fn client_for(server: &MockServer) -> OpenAiClient {
    OpenAiClient::new(OpenAiConfig {
        api_base: format!("{}/v1", server.base_url()),
        api_key: "test-openai-key".to_string(),
        organization: None,
        request_timeout_ms: 5_000,
    })
    .expect("openai client should be created")
}

fn request_with_tool() -> ChatRequest {
    ChatRequest {
        model: "gpt-4o-mini".to_string(),
        messages: vec![Message::system("system"), Message::user("hello")],
        tools: vec![ToolDefinition {
            name: "list_directory".to_string(),
            description: "List a directory".to_string(),
            parameters: json!({"type": "object"}),
        }],
        state: BTreeMap::new(),
        max_tokens: Some(128),
        temperature: Some(0.0),
    }
}

#[tokio::test]
async fn integration_openai_client_sends_expected_http_request() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer test-openai-key")
            .header_exists("x-coda-request-id")
            .json_body_includes(
                json!({
                    "model": "gpt-4o-mini",
                    "messages": [{"role": "system"}, {"role": "user"}],
                    "tools": [{"type": "function"}],
                    "tool_choice": "auto"
                })
                .to_string(),
            );
        then.status(200).json_body(json!({
            "choices": [{
                "message": { "content": "openai ok" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 }
        }));
    });

    let response = client_for(&server)
        .complete(request_with_tool())
        .await
        .expect("openai completion should succeed");

    mock.assert();
    assert_eq!(response.message.text_content(), "openai ok");
    assert_eq!(response.usage.total_tokens, 8);
}

#[tokio::test]
async fn regression_openai_client_surfaces_http_status_without_retrying() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(503).body("upstream unavailable");
    });

    let error = client_for(&server)
        .complete(request_with_tool())
        .await
        .expect_err("503 should fail");

    mock.assert_calls(1);
    match error {
        CodaAiError::HttpStatus { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "upstream unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn functional_openai_client_streams_server_sent_events() {
    let server = MockServer::start();
    let sse = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"found \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"3 files\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n"
    );
    server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .json_body_includes(json!({ "stream": true }).to_string());
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(sse);
    });

    let deltas = Arc::new(Mutex::new(Vec::new()));
    let sink = deltas.clone();
    let response = client_for(&server)
        .complete_with_stream(
            request_with_tool(),
            Some(Arc::new(move |delta: String| {
                sink.lock().expect("delta lock").push(delta);
            })),
        )
        .await
        .expect("stream should succeed");

    assert_eq!(response.message.text_content(), "found 3 files");
    assert_eq!(
        deltas.lock().expect("delta lock").as_slice(),
        ["found ".to_string(), "3 files".to_string()]
    );
}

#[test]
fn unit_openai_client_requires_api_key() {
    let error = OpenAiClient::new(OpenAiConfig::default()).expect_err("missing key");
    assert!(matches!(error, CodaAiError::MissingApiKey { .. }));
}
