use chorus_core::{
    ChatMessage, ChatSession, MessageRole, MockAdapter, MockEvent, ModelConfig, Orchestrator,
    ProviderRegistry, ProviderSettings, StaticSettings, StreamEventKind, StreamStatus,
};
use std::sync::Arc;
use std::time::Duration;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn mock_session(adapters: Vec<MockAdapter>) -> ChatSession {
    let mut registry = ProviderRegistry::new();
    for adapter in adapters {
        registry.register(Arc::new(adapter));
    }
    let settings = Arc::new(StaticSettings(ProviderSettings::default()));
    ChatSession::new(Orchestrator::new(registry, settings))
}

#[test]
fn session_records_messages() {
    let runtime = test_runtime();
    let session = mock_session(vec![MockAdapter::echo("mock")]);
    let models = [ModelConfig::new("mock::echo")];

    let status = runtime.block_on(async {
        let fan_out = session
            .send_user_message(ChatMessage::user("hello world"), &models, &[])
            .expect("send message");
        let mut results = fan_out.join_all().await;
        results.remove(0).1
    });

    assert!(matches!(status, Ok(StreamStatus::Completed)));
    let conversation = session.conversation();
    assert_eq!(conversation.title, "hello world");
    assert!(conversation
        .messages()
        .iter()
        .any(|msg| msg.role == MessageRole::User));
    let reply = conversation
        .messages()
        .iter()
        .find(|msg| msg.role == MessageRole::Assistant)
        .expect("assistant reply");
    assert_eq!(reply.content, "[Mock] Model echo: received 'hello world'.");
    assert_eq!(reply.model.as_deref(), Some("mock::echo"));
}

#[test]
fn follow_up_only_sees_own_replies() {
    let runtime = test_runtime();
    let session = mock_session(vec![
        MockAdapter::new("left", vec![MockEvent::text("from left")]),
        MockAdapter::echo("right"),
    ]);
    let models = [ModelConfig::new("left::a"), ModelConfig::new("right::b")];

    runtime.block_on(async {
        session
            .send_user_message(ChatMessage::user("one"), &models, &[])
            .expect("first turn")
            .join_all()
            .await;
        session
            .send_user_message(ChatMessage::user("two"), &models[1..], &[])
            .expect("second turn")
            .join_all()
            .await;
    });

    let conversation = session.conversation();
    let right_replies: Vec<_> = conversation
        .messages()
        .iter()
        .filter(|msg| msg.model.as_deref() == Some("right::b"))
        .map(|msg| msg.content.clone())
        .collect();
    assert_eq!(
        right_replies,
        vec![
            "[Mock] Model b: received 'one'.".to_string(),
            "[Mock] Model b: received 'two'.".to_string(),
        ]
    );
    // user, left, right, user, right
    assert_eq!(conversation.len(), 5);
}

#[test]
fn failed_model_leaves_no_reply() {
    let runtime = test_runtime();
    let session = mock_session(vec![MockAdapter::new(
        "flaky",
        vec![MockEvent::text("half"), MockEvent::Fail("connection reset".into())],
    )]);
    let models = [ModelConfig::new("flaky::m")];

    let events = runtime.block_on(async {
        let mut fan_out = session
            .send_user_message(ChatMessage::user("hi"), &models, &[])
            .expect("send");
        let mut events = Vec::new();
        while let Some(event) = fan_out.events.recv().await {
            events.push(event.kind);
        }
        events
    });

    assert_eq!(
        events,
        vec![
            StreamEventKind::Chunk("half".into()),
            StreamEventKind::Failed("connection reset".into()),
        ]
    );
    assert_eq!(session.conversation().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_one_model_keeps_the_others() {
    let session = mock_session(vec![
        MockAdapter::new(
            "slow",
            vec![MockEvent::Delay(Duration::from_secs(30)), MockEvent::text("late")],
        ),
        MockAdapter::new("fast", vec![MockEvent::text("quick")]),
    ]);
    let models = [ModelConfig::new("slow::m"), ModelConfig::new("fast::m")];

    let fan_out = session
        .send_user_message(ChatMessage::user("race"), &models, &[])
        .expect("send");
    tokio::time::sleep(Duration::from_secs(1)).await;
    fan_out
        .handles
        .iter()
        .find(|handle| handle.model() == "slow::m")
        .expect("slow handle")
        .cancel();

    let results = fan_out.join_all().await;
    assert!(results
        .iter()
        .any(|(model, status)| model == "slow::m"
            && matches!(status, Ok(StreamStatus::Cancelled))));
    assert!(results
        .iter()
        .any(|(model, status)| model == "fast::m"
            && matches!(status, Ok(StreamStatus::Completed))));

    let replies: Vec<_> = session
        .conversation()
        .messages()
        .iter()
        .filter(|msg| msg.role == MessageRole::Assistant)
        .map(|msg| msg.content.clone())
        .collect();
    assert_eq!(replies, vec!["quick".to_string()]);
}
