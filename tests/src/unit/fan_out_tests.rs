use chorus_core::{
    ChatMessage, Conversation, FanOut, FileSettings, ModelConfig, OpenAiCompatibleAdapter,
    Orchestrator, ProviderProfile, ProviderRegistry, ProviderSettings, StaticSettings,
    StreamEvent, StreamEventKind, StreamStatus, ToolDefinition,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(events: &[Value]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn text_event(content: &str) -> Value {
    json!({ "choices": [{ "index": 0, "delta": { "content": content } }] })
}

async fn mount_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(server)
        .await;
}

fn hosted(key: &str, server: &MockServer) -> Arc<OpenAiCompatibleAdapter> {
    Arc::new(OpenAiCompatibleAdapter::new(ProviderProfile::hosted(
        key,
        format!("{}/v1", server.uri()),
        true,
    )))
}

fn conversation() -> Conversation {
    Conversation::from_messages([ChatMessage::user("Compare yourselves")]).expect("conversation")
}

async fn collect(mut fan_out: FanOut) -> HashMap<String, Vec<StreamEventKind>> {
    let mut by_model: HashMap<String, Vec<StreamEventKind>> = HashMap::new();
    while let Some(StreamEvent { model, kind }) = fan_out.events.recv().await {
        by_model.entry(model).or_default().push(kind);
    }
    for (model, status) in fan_out.join_all().await {
        assert!(
            matches!(status, Ok(StreamStatus::Completed | StreamStatus::Failed)),
            "{model} ended with {status:?}"
        );
    }
    by_model
}

#[tokio::test]
async fn two_providers_stream_independently() {
    let hosted_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer hosted-key"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse_body(&[text_event("Hel"), text_event("lo")]),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&hosted_server)
        .await;
    let local_server = MockServer::start().await;
    mount_stream(&local_server, sse_body(&[text_event("local reply")])).await;

    let mut registry = ProviderRegistry::new();
    registry.register(hosted("openai", &hosted_server));
    registry.register(Arc::new(OpenAiCompatibleAdapter::new(ProviderProfile::custom())));
    let settings = ProviderSettings::default()
        .with_api_key("openai", "hosted-key")
        .with_custom_base_url(format!("{}/v1", local_server.uri()));
    let orchestrator = Orchestrator::new(registry, Arc::new(StaticSettings(settings)));

    let models = [
        ModelConfig::new("openai::gpt-4o"),
        ModelConfig::new("custom::llama3"),
    ];
    let events = collect(orchestrator.fan_out(&conversation(), &models, &[])).await;

    let hosted_events = &events["openai::gpt-4o"];
    assert_eq!(hosted_events[0], StreamEventKind::Chunk("Hel".into()));
    assert_eq!(hosted_events[1], StreamEventKind::Chunk("lo".into()));
    assert!(matches!(
        &hosted_events[2],
        StreamEventKind::Completed(completion) if completion.text.as_deref() == Some("Hello")
    ));
    assert_eq!(events["custom::llama3"].len(), 2);
    hosted_server.verify().await;

    let request = &local_server.received_requests().await.expect("requests")[0];
    let body: Value = serde_json::from_slice(&request.body).expect("request json");
    assert_eq!(body["model"], "llama3");
    assert_eq!(body["stream"], true);
}

#[tokio::test]
async fn missing_key_fails_only_that_model() {
    let openai = MockServer::start().await;
    mount_stream(&openai, sse_body(&[text_event("fine")])).await;
    let groq = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&groq)
        .await;

    let mut registry = ProviderRegistry::new();
    registry.register(hosted("openai", &openai));
    registry.register(hosted("groq", &groq));
    let settings = ProviderSettings::default().with_api_key("openai", "k");
    let orchestrator = Orchestrator::new(registry, Arc::new(StaticSettings(settings)));

    let models = [ModelConfig::new("openai::a"), ModelConfig::new("groq::b")];
    let events = collect(orchestrator.fan_out(&conversation(), &models, &[])).await;

    assert!(matches!(events["openai::a"].last(), Some(StreamEventKind::Completed(_))));
    match events["groq::b"].as_slice() {
        [StreamEventKind::Failed(message)] => assert!(message.contains("groq")),
        other => panic!("unexpected events: {other:?}"),
    }
    groq.verify().await;
}

#[tokio::test]
async fn tool_calls_survive_the_fan_out() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse_body(&[
            json!({ "choices": [{ "index": 0, "delta": { "tool_calls": [
                { "index": 0, "id": "call_1", "type": "function",
                  "function": { "name": "get_weather", "arguments": "{\"city\":" } }
            ] } }] }),
            json!({ "choices": [{ "index": 0, "delta": { "tool_calls": [
                { "index": 0, "function": { "arguments": "\"Oslo\"}" } }
            ] }, "finish_reason": "tool_calls" }] }),
        ]),
    )
    .await;

    let mut registry = ProviderRegistry::new();
    registry.register(hosted("openai", &server));
    let settings = ProviderSettings::default().with_api_key("openai", "k");
    let orchestrator = Orchestrator::new(registry, Arc::new(StaticSettings(settings)));
    let tools = [ToolDefinition::new(
        "get_weather",
        "Current weather for a city",
        json!({ "type": "object", "properties": { "city": { "type": "string" } } }),
    )];

    let events = collect(orchestrator.fan_out(
        &conversation(),
        &[ModelConfig::new("openai::gpt-4o")],
        &tools,
    ))
    .await;

    let completion = match events["openai::gpt-4o"].last() {
        Some(StreamEventKind::Completed(completion)) => completion.clone(),
        other => panic!("unexpected terminal event: {other:?}"),
    };
    assert!(completion.text.is_none());
    let calls = completion.tool_calls.expect("tool calls");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].parsed_arguments().expect("json"), json!({ "city": "Oslo" }));
}

#[tokio::test]
async fn file_settings_timeout_applies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&[text_event("too late")]), "text/event-stream")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("temp dir");
    let config = dir.path().join("chorus.yaml");
    std::fs::write(
        &config,
        "app:\n  api_keys:\n    together: file-key\n  request_timeout_secs: 1\n",
    )
    .expect("write config");

    let mut registry = ProviderRegistry::new();
    registry.register(hosted("together", &server));
    let orchestrator = Orchestrator::new(registry, Arc::new(FileSettings::at(&config)));

    let events = collect(orchestrator.fan_out(
        &conversation(),
        &[ModelConfig::new("together::mixtral")],
        &[],
    ))
    .await;

    match events["together::mixtral"].as_slice() {
        [StreamEventKind::Failed(message)] => assert!(message.contains("timed out")),
        other => panic!("unexpected events: {other:?}"),
    }
}
