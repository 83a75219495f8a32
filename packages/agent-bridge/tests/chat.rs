use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_bridge::types::{CodeContextContent, Role};
use agent_bridge::{
    ApiClient, BridgeError, ChatEvent, ChatProcessor, FinishReason, OutgoingTurn, SessionManager,
};
use axum::body::Body;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::broadcast;

type Chunk = Result<String, Infallible>;

fn sse(frames: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str(&format!("data: {frame}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn message_frame(id: &str, text: &str) -> serde_json::Value {
    json!({
        "type": "Message",
        "message": {
            "id": id,
            "role": "assistant",
            "created": 0,
            "content": [{ "type": "text", "text": text }]
        }
    })
}

/// Mock agent server. `/reply` plays the configured body; `/sessions` lists
/// ids the "server" has learned about.
struct MockAgent {
    reply_body: String,
    known_sessions: Vec<String>,
}

async fn spawn_mock(mock: Arc<MockAgent>) -> String {
    let reply = mock.reply_body.clone();
    let sessions = mock.known_sessions.clone();
    let app = Router::new()
        .route(
            "/reply",
            post(move || {
                let body = reply.clone();
                async move { body }
            }),
        )
        .route(
            "/sessions",
            get(move || {
                let entries: Vec<_> = sessions
                    .iter()
                    .map(|id| json!({ "id": id, "path": "", "modified": "" }))
                    .collect();
                async move { Json(json!(entries)) }
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client_for(base_url: &str) -> ApiClient {
    ApiClient::new(base_url, "secret", Vec::new(), false)
}

async fn collect_until_finish(
    events: &mut broadcast::Receiver<ChatEvent>,
) -> (Vec<ChatEvent>, FinishReason) {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event stream stalled")
            .expect("event channel closed");
        if let ChatEvent::Finish { reason, .. } = &event {
            let reason = *reason;
            seen.push(event);
            return (seen, reason);
        }
        seen.push(event);
    }
}

#[tokio::test]
async fn sse_turn_replays_message_state_and_finishes() {
    let base_url = spawn_mock(Arc::new(MockAgent {
        reply_body: sse(&[
            message_frame("a1", "Hel"),
            message_frame("a1", "Hello there"),
            json!({ "type": "Finish", "message": null, "reason": "stop" }),
        ]),
        known_sessions: Vec::new(),
    }))
    .await;
    let client = client_for(&base_url);
    let processor = ChatProcessor::new(SessionManager::new());
    let mut events = processor.subscribe();

    processor
        .send_message(&client, OutgoingTurn::text("hi"))
        .await
        .unwrap();

    let (seen, reason) = collect_until_finish(&mut events).await;
    assert_eq!(reason, FinishReason::Complete);
    let texts: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            ChatEvent::MessageReceived { message } => Some(message.text()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["Hel".to_string(), "Hello there".to_string()]);

    // Full-state frames replace, never append.
    let session = processor.sessions().active_session().await.unwrap();
    let assistant: Vec<_> = session
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].text(), "Hello there");
}

#[tokio::test]
async fn plaintext_bodies_accumulate_into_one_assistant_message() {
    let base_url = spawn_mock(Arc::new(MockAgent {
        reply_body: "plain text answer".to_string(),
        known_sessions: Vec::new(),
    }))
    .await;
    let client = client_for(&base_url);
    let processor = ChatProcessor::new(SessionManager::new());
    let mut events = processor.subscribe();

    processor
        .send_message(&client, OutgoingTurn::text("hi"))
        .await
        .unwrap();

    let (_, reason) = collect_until_finish(&mut events).await;
    assert_eq!(reason, FinishReason::Complete);
    let session = processor.sessions().active_session().await.unwrap();
    let assistant: Vec<_> = session
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].text(), "plain text answer");
}

#[tokio::test]
async fn error_frames_fail_the_turn_without_a_finish_event() {
    let base_url = spawn_mock(Arc::new(MockAgent {
        reply_body: sse(&[
            message_frame("a1", "partial"),
            json!({ "type": "Error", "error": "overloaded" }),
        ]),
        known_sessions: Vec::new(),
    }))
    .await;
    let client = client_for(&base_url);
    let processor = ChatProcessor::new(SessionManager::new());
    let mut events = processor.subscribe();

    let err = processor
        .send_message(&client, OutgoingTurn::text("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Stream { .. }));
    assert!(err.to_string().contains("overloaded"));

    // The failure surfaces as an error event; nothing finishes the turn.
    let mut saw_error = false;
    loop {
        match events.try_recv() {
            Ok(ChatEvent::Error { report }) => {
                assert!(report.message.contains("overloaded"));
                saw_error = true;
            }
            Ok(ChatEvent::Finish { .. }) => panic!("failed turn must not emit a finish event"),
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Empty) => break,
            Err(err) => panic!("event channel failed: {err}"),
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn empty_turns_send_nothing() {
    // Unroutable address: any network attempt would fail the turn.
    let client = client_for("http://127.0.0.1:9");
    let processor = ChatProcessor::new(SessionManager::new());

    processor
        .send_message(&client, OutgoingTurn::text("   \n"))
        .await
        .unwrap();
    assert!(processor.sessions().active_session().await.is_none());
}

#[tokio::test]
async fn user_turn_is_appended_before_the_request_is_sent() {
    let client = client_for("http://127.0.0.1:9");
    let processor = ChatProcessor::new(SessionManager::new());

    let err = processor
        .send_message(&client, OutgoingTurn::text("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Network(_)));

    // The failed turn is still visible in the session.
    let session = processor.sessions().active_session().await.unwrap();
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[0].text(), "hello");
}

#[tokio::test]
async fn completed_turn_clears_the_optimistic_flag() {
    let processor = ChatProcessor::new(SessionManager::new());
    let local = processor.sessions().create_session("/tmp", "").await;
    assert!(local.is_local);

    // The mock "server" now knows the session, as it would after /reply.
    let base_url = spawn_mock(Arc::new(MockAgent {
        reply_body: sse(&[message_frame("a1", "ok")]),
        known_sessions: vec![local.id.clone()],
    }))
    .await;
    let client = client_for(&base_url);

    processor
        .send_message(&client, OutgoingTurn::text("hi"))
        .await
        .unwrap();

    let catalog = processor.sessions().sessions().await;
    let entry = catalog.iter().find(|e| e.id == local.id).unwrap();
    assert!(!entry.is_local);
}

#[tokio::test]
async fn overlapping_turns_are_rejected() {
    // A reply that streams one frame and then stays open.
    let app = Router::new().route(
        "/reply",
        post(|| async {
            let head =
                futures::stream::iter(vec![Chunk::Ok(sse(&[message_frame("a1", "thinking")]))]);
            let body = Body::from_stream(head.chain(futures::stream::pending()));
            Response::new(body)
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = client_for(&format!("http://{addr}"));
    let processor = ChatProcessor::new(SessionManager::new());
    let mut events = processor.subscribe();

    let background = {
        let processor = processor.clone();
        let client = client.clone();
        tokio::spawn(async move {
            processor
                .send_message(&client, OutgoingTurn::text("first"))
                .await
        })
    };

    // Wait until the first turn is streaming.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("stream never started")
        {
            Ok(ChatEvent::MessageReceived { .. }) => break,
            Ok(_) => {}
            Err(err) => panic!("event channel failed: {err}"),
        }
    }

    let err = processor
        .send_message(&client, OutgoingTurn::text("second"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::TurnInProgress));

    // Aborting unblocks the first turn.
    processor.stop_generation();
    let result = tokio::time::timeout(Duration::from_secs(5), background)
        .await
        .expect("first turn never finished")
        .expect("task panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn stop_generation_keeps_the_partial_message_and_reports_abort() {
    let app = Router::new()
        .route(
            "/reply",
            post(|| async {
                let head = futures::stream::iter(vec![Chunk::Ok(sse(&[message_frame(
                    "a1",
                    "partial answer",
                )]))]);
                Response::new(Body::from_stream(head.chain(futures::stream::pending())))
            }),
        )
        .route("/sessions", get(|| async { Json(json!([])) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = client_for(&format!("http://{addr}"));
    let processor = ChatProcessor::new(SessionManager::new());
    let mut events = processor.subscribe();

    let background = {
        let processor = processor.clone();
        let client = client.clone();
        tokio::spawn(async move {
            processor
                .send_message(&client, OutgoingTurn::text("hi"))
                .await
        })
    };

    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("stream never started")
            .expect("event channel closed")
        {
            ChatEvent::MessageReceived { .. } => break,
            _ => {}
        }
    }
    processor.stop_generation();

    let (_, reason) = collect_until_finish(&mut events).await;
    assert_eq!(reason, FinishReason::Aborted);
    background.await.unwrap().unwrap();

    let session = processor.sessions().active_session().await.unwrap();
    let assistant = session
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .expect("partial assistant message kept");
    assert_eq!(assistant.text(), "partial answer");
}

fn math_selection() -> CodeContextContent {
    CodeContextContent {
        id: "sel-1".to_string(),
        file_path: "src/math.rs".to_string(),
        file_name: "math.rs".to_string(),
        language_id: "rust".to_string(),
        start_line: 4,
        end_line: 6,
        selected_text: "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}".to_string(),
    }
}

#[tokio::test]
async fn prepended_code_turns_open_with_a_fenced_block() {
    let base_url = spawn_mock(Arc::new(MockAgent {
        reply_body: sse(&[message_frame("a1", "That function returns a sum.")]),
        known_sessions: Vec::new(),
    }))
    .await;
    let client = client_for(&base_url);
    let processor = ChatProcessor::new(SessionManager::new());

    let turn = OutgoingTurn {
        text: "what does this do?".to_string(),
        code_references: Vec::new(),
        prepended_code: Some(math_selection()),
        message_id: Some("u-42".to_string()),
    };
    processor.send_message(&client, turn).await.unwrap();

    let session = processor.sessions().active_session().await.unwrap();
    let user = &session.messages[0];
    assert_eq!(user.role, Role::User);
    assert_eq!(user.id, "u-42");
    assert_eq!(
        user.text(),
        "```rust\n// src/math.rs:4-6\nfn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n```\n\nwhat does this do?"
    );
}

#[tokio::test]
async fn reference_turns_carry_a_summary_line() {
    let base_url = spawn_mock(Arc::new(MockAgent {
        reply_body: sse(&[message_frame("a1", "It adds two numbers.")]),
        known_sessions: Vec::new(),
    }))
    .await;
    let client = client_for(&base_url);
    let processor = ChatProcessor::new(SessionManager::new());

    let turn = OutgoingTurn {
        text: "what does this do?".to_string(),
        code_references: vec![math_selection()],
        prepended_code: None,
        message_id: None,
    };
    processor.send_message(&client, turn).await.unwrap();

    let session = processor.sessions().active_session().await.unwrap();
    let user = &session.messages[0];
    assert_eq!(
        user.text(),
        "From `src/math.rs`:4-6\nwhat does this do?"
    );
}
