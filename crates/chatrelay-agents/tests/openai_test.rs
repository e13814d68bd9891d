use chatrelay_agents::{ChatMessage, LlmProvider, LlmRequest, OpenAiProvider, Transcriber, Usage};
use chatrelay_common::{Error, Role};
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> LlmRequest {
    LlmRequest {
        model: "gpt-3.5-turbo".to_string(),
        user: "chatrelay".to_string(),
        messages: vec![
            ChatMessage::new(Role::System, "You are terse."),
            ChatMessage::new(Role::User, "Hello"),
        ],
    }
}

#[tokio::test]
async fn test_openai_completion() {
    let mock_server = MockServer::start().await;

    let response_body = json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "gpt-3.5-turbo-0613",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello there!"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
    });

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-3.5-turbo",
            "user": "chatrelay",
            "stream": false,
            "messages": [
                {"role": "system", "content": "You are terse."},
                {"role": "user", "content": "Hello"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let response = provider.complete(&request()).await.unwrap();

    assert_eq!(response.content, "Hello there!");
    assert_eq!(response.model, "gpt-3.5-turbo-0613");
    assert_eq!(
        response.usage,
        Some(Usage {
            prompt_tokens: 9,
            completion_tokens: 12,
            total_tokens: 21
        })
    );
}

#[tokio::test]
async fn test_openai_streaming() {
    let mock_server = MockServer::start().await;

    let sse = [
        r#"data: {"id":"1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
        r#"data: {"id":"1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        r#"data: {"id":"1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":" there"},"finish_reason":null}]}"#,
        r#"data: {"id":"1","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        r#"data: {"id":"1","model":"gpt-4o","choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2,"total_tokens":6}}"#,
        "data: [DONE]",
    ]
    .join("\n\n")
        + "\n\n";

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "stream": true,
            "stream_options": {"include_usage": true}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let mut stream = provider.complete_stream(&request()).await.unwrap();

    let mut text = String::new();
    let mut usage = None;
    let mut model = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        text.push_str(&chunk.delta);
        usage = chunk.usage.or(usage);
        model = chunk.model.or(model);
    }

    assert_eq!(text, "Hi there");
    assert_eq!(model.as_deref(), Some("gpt-4o"));
    assert_eq!(usage.map(|u| u.total_tokens), Some(6));
}

#[tokio::test]
async fn test_openai_context_too_long() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "message": "This model's maximum context length is 4097 tokens. However, your messages resulted in 5000 tokens. Please reduce the length of the messages.",
                "type": "invalid_request_error",
                "code": "context_length_exceeded"
            }
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let err = provider.complete_stream(&request()).await.err().unwrap();
    assert!(matches!(err, Error::ContextTooLong));
}

#[tokio::test]
async fn test_openai_server_error_is_agent_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let err = provider.complete(&request()).await.unwrap_err();
    assert!(err.to_string().contains("status=503"));
    assert!(!chatrelay_agents::is_persistent_error(&err));
}

#[tokio::test]
async fn test_openai_health_check() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    assert!(provider.health_check().await.unwrap());

    let unreachable = OpenAiProvider::new("k".into(), Some("http://127.0.0.1:9".into()));
    assert!(!unreachable.health_check().await.unwrap());
}

#[tokio::test]
async fn test_openai_transcription() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "hello from voice"})))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("voice.mp3");
    std::fs::write(&audio, b"ID3fake-mp3-bytes").unwrap();

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()))
        .with_transcription_model("whisper-1");
    let text = provider.transcribe(&audio).await.unwrap();
    assert_eq!(text, "hello from voice");
}
