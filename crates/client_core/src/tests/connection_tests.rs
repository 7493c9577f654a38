use super::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::{
    extract::{
        ws::{CloseFrame as WsCloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use shared::domain::UserId;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc::UnboundedReceiver},
};
use uuid::Uuid;

use crate::events::EventKind;

const CLOSED_MARKER: &str = "<closed>";

#[derive(Clone, Debug)]
enum Push {
    Text(String),
    Close(u16),
    Drop,
}

#[derive(Clone)]
struct ChannelServer {
    accept: Arc<AtomicBool>,
    handshakes: Arc<AtomicUsize>,
    push: broadcast::Sender<Push>,
    received: mpsc::UnboundedSender<(Uuid, String)>,
}

impl ChannelServer {
    fn push(&self, push: Push) {
        let _ = self.push.send(push);
    }

    fn push_json(&self, value: Value) {
        self.push(Push::Text(value.to_string()));
    }

    fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

async fn channel_route(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<Uuid>,
    State(server): State<ChannelServer>,
) -> Response {
    server.handshakes.fetch_add(1, Ordering::SeqCst);
    if !server.accept.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let push_rx = server.push.subscribe();
    let received = server.received.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, conversation_id, push_rx, received))
}

async fn serve_socket(
    mut socket: WebSocket,
    conversation_id: Uuid,
    mut push_rx: broadcast::Receiver<Push>,
    received: mpsc::UnboundedSender<(Uuid, String)>,
) {
    loop {
        tokio::select! {
            push = push_rx.recv() => match push {
                Ok(Push::Text(text)) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                Ok(Push::Close(code)) => {
                    let _ = socket
                        .send(WsMessage::Close(Some(WsCloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    return;
                }
                Ok(Push::Drop) | Err(_) => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = received.send((conversation_id, text));
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                    let _ = received.send((conversation_id, CLOSED_MARKER.to_string()));
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn spawn_channel_server() -> (String, ChannelServer, UnboundedReceiver<(Uuid, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (push, _) = broadcast::channel(64);
    let (received, received_rx) = mpsc::unbounded_channel();
    let server = ChannelServer {
        accept: Arc::new(AtomicBool::new(true)),
        handshakes: Arc::new(AtomicUsize::new(0)),
        push,
        received,
    };
    let app = Router::new()
        .route("/ws/chat/:conversation_id/", get(channel_route))
        .with_state(server.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), server, received_rx)
}

fn test_settings(server_url: String) -> Settings {
    Settings {
        server_url,
        access_token: Some("token-123".into()),
        reconnect_base_delay: Duration::from_millis(10),
        connect_timeout: Duration::from_secs(2),
        ..Settings::default()
    }
}

fn manager_with_events(settings: Settings) -> (ConnectionManager, UnboundedReceiver<ChatEvent>) {
    let bus = Arc::new(EventBus::new());
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe_all(Arc::new(move |event: &ChatEvent| -> anyhow::Result<()> {
        let _ = tx.send(event.clone());
        Ok(())
    }));
    (ConnectionManager::new(settings, bus), rx)
}

async fn next_event(
    rx: &mut UnboundedReceiver<ChatEvent>,
    accept: impl Fn(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event bus alive");
            if accept(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn next_received(rx: &mut UnboundedReceiver<(Uuid, String)>) -> (Uuid, String) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for server frame")
        .expect("server alive")
}

fn is_kind(kind: EventKind) -> impl Fn(&ChatEvent) -> bool {
    move |event| event.kind() == kind
}

#[tokio::test]
async fn classifies_inbound_frames_without_dropping_the_channel() {
    let (server_url, server, _received) = spawn_channel_server().await;
    let (manager, mut events) = manager_with_events(test_settings(server_url));
    let conversation_id = ConversationId(Uuid::new_v4());

    manager.connect(conversation_id).expect("connect");
    next_event(&mut events, is_kind(EventKind::Connected)).await;

    server.push_json(json!({"type": "typing", "user_id": 4, "username": "amy", "is_typing": true}));
    server.push_json(json!({"type": "presence_update", "user_id": 4, "username": "amy", "is_online": true}));
    server.push(Push::Text("{not json".into()));
    server.push_json(json!({"type": "reaction", "emoji": "+1"}));
    server.push_json(json!({
        "type": "message",
        "message": {
            "id": Uuid::from_u128(1),
            "sender": {"id": 4, "username": "amy"},
            "content": "still here",
            "created_at": "2024-05-01T10:00:00Z"
        },
        "timestamp": "2024-05-01T10:00:00+00:00"
    }));

    let typing = next_event(&mut events, |_| true).await;
    assert_eq!(
        typing,
        ChatEvent::Typing {
            conversation_id,
            user_id: UserId(4),
            username: "amy".into(),
            is_typing: true,
        }
    );
    let presence = next_event(&mut events, |_| true).await;
    assert_eq!(presence.kind(), EventKind::Presence);
    for _ in 0..2 {
        let error = next_event(&mut events, |_| true).await;
        assert!(matches!(
            error,
            ChatEvent::Error {
                kind: ErrorKind::Protocol,
                ..
            }
        ));
    }
    let message = next_event(&mut events, |_| true).await;
    assert!(matches!(message, ChatEvent::Message { ref message, .. } if message.content == "still here"));
    assert!(manager.is_open());
}

#[tokio::test]
async fn send_is_rejected_until_open_then_frames_reach_server() {
    let (server_url, _server, mut received) = spawn_channel_server().await;
    let (manager, mut events) = manager_with_events(test_settings(server_url));
    let conversation_id = ConversationId(Uuid::new_v4());

    assert!(matches!(
        manager.send(&ClientFrame::Read),
        Err(ChatError::SendRejected)
    ));

    manager.connect(conversation_id).expect("connect");
    next_event(&mut events, is_kind(EventKind::Connected)).await;

    manager
        .send(&ClientFrame::Message {
            content: "hi".into(),
        })
        .expect("send message");
    manager
        .send(&ClientFrame::Typing { is_typing: true })
        .expect("send typing");
    manager.send(&ClientFrame::Read).expect("send read");

    let mut frames = Vec::new();
    for _ in 0..3 {
        let (target, text) = next_received(&mut received).await;
        assert_eq!(target, conversation_id.0);
        frames.push(serde_json::from_str::<Value>(&text).expect("json"));
    }
    assert_eq!(
        frames,
        vec![
            json!({"type": "message", "content": "hi"}),
            json!({"type": "typing", "is_typing": true}),
            json!({"type": "read"}),
        ]
    );
}

#[tokio::test]
async fn failed_handshakes_exhaust_retry_budget_until_explicit_connect() {
    let (server_url, server, _received) = spawn_channel_server().await;
    server.accept.store(false, Ordering::SeqCst);
    let (manager, mut events) = manager_with_events(test_settings(server_url));
    let conversation_id = ConversationId(Uuid::new_v4());
    let mut status = manager.subscribe_status();

    manager.connect(conversation_id).expect("connect");

    let mut retry_attempts = Vec::new();
    loop {
        let event = next_event(&mut events, is_kind(EventKind::Disconnected)).await;
        let ChatEvent::Disconnected { retry_attempt, .. } = event else {
            unreachable!("filtered on kind");
        };
        retry_attempts.push(retry_attempt);
        if retry_attempt.is_none() {
            break;
        }
    }
    assert_eq!(
        retry_attempts,
        vec![Some(1), Some(2), Some(3), Some(4), Some(5), None]
    );

    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|status| status.retries_exhausted),
    )
    .await
    .expect("status timeout")
    .expect("status sender alive");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.handshakes(), 6);
    assert_eq!(
        manager.status().state,
        ConnectionState::ClosedUnintentional
    );

    server.accept.store(true, Ordering::SeqCst);
    manager.connect(conversation_id).expect("reconnect");
    next_event(&mut events, is_kind(EventKind::Connected)).await;
    let status = manager.status();
    assert_eq!(status.attempts, 0);
    assert!(!status.retries_exhausted);
    assert_eq!(server.handshakes(), 7);
}

#[tokio::test]
async fn abnormal_drop_reconnects_and_resets_attempts() {
    let (server_url, server, _received) = spawn_channel_server().await;
    let (manager, mut events) = manager_with_events(test_settings(server_url));
    let conversation_id = ConversationId(Uuid::new_v4());

    manager.connect(conversation_id).expect("connect");
    next_event(&mut events, is_kind(EventKind::Connected)).await;

    server.push(Push::Drop);
    let dropped = next_event(&mut events, is_kind(EventKind::Disconnected)).await;
    assert!(matches!(
        dropped,
        ChatEvent::Disconnected {
            retry_attempt: Some(1),
            ..
        }
    ));

    next_event(&mut events, is_kind(EventKind::Connected)).await;
    assert_eq!(manager.status().attempts, 0);
    assert_eq!(server.handshakes(), 2);
}

#[tokio::test]
async fn non_normal_close_code_takes_reconnect_path() {
    let (server_url, server, _received) = spawn_channel_server().await;
    let (manager, mut events) = manager_with_events(test_settings(server_url));

    manager
        .connect(ConversationId(Uuid::new_v4()))
        .expect("connect");
    next_event(&mut events, is_kind(EventKind::Connected)).await;

    server.push(Push::Close(4001));
    let closed = next_event(&mut events, is_kind(EventKind::Disconnected)).await;
    assert!(matches!(
        closed,
        ChatEvent::Disconnected {
            code: Some(4001),
            retry_attempt: Some(1),
            ..
        }
    ));
    next_event(&mut events, is_kind(EventKind::Connected)).await;
}

#[tokio::test]
async fn normal_close_from_server_is_not_retried() {
    let (server_url, server, _received) = spawn_channel_server().await;
    let (manager, mut events) = manager_with_events(test_settings(server_url));

    manager
        .connect(ConversationId(Uuid::new_v4()))
        .expect("connect");
    next_event(&mut events, is_kind(EventKind::Connected)).await;

    server.push(Push::Close(1000));
    let closed = next_event(&mut events, is_kind(EventKind::Disconnected)).await;
    assert!(matches!(
        closed,
        ChatEvent::Disconnected {
            code: Some(1000),
            retry_attempt: None,
            ..
        }
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.handshakes(), 1);
    assert_eq!(manager.status().state, ConnectionState::ClosedIntentional);
}

#[tokio::test]
async fn disconnect_closes_normally_without_reconnect() {
    let (server_url, server, mut received) = spawn_channel_server().await;
    let (manager, mut events) = manager_with_events(test_settings(server_url));

    manager
        .connect(ConversationId(Uuid::new_v4()))
        .expect("connect");
    next_event(&mut events, is_kind(EventKind::Connected)).await;

    manager.disconnect();
    let (_, marker) = next_received(&mut received).await;
    assert_eq!(marker, CLOSED_MARKER);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(server.handshakes(), 1);
    let status = manager.status();
    assert_eq!(status.state, ConnectionState::ClosedIntentional);
    assert_eq!(status.conversation_id, None);
    assert!(matches!(
        manager.send(&ClientFrame::Read),
        Err(ChatError::SendRejected)
    ));
}

#[tokio::test]
async fn connect_to_same_conversation_is_a_noop() {
    let (server_url, server, _received) = spawn_channel_server().await;
    let (manager, mut events) = manager_with_events(test_settings(server_url));
    let conversation_id = ConversationId(Uuid::new_v4());

    manager.connect(conversation_id).expect("connect");
    manager.connect(conversation_id).expect("connect again");
    next_event(&mut events, is_kind(EventKind::Connected)).await;
    manager.connect(conversation_id).expect("connect while open");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.handshakes(), 1);
}

#[tokio::test]
async fn switching_conversations_silences_the_old_channel() {
    let (server_url, server, mut received) = spawn_channel_server().await;
    let (manager, mut events) = manager_with_events(test_settings(server_url));
    let old_id = ConversationId(Uuid::new_v4());
    let new_id = ConversationId(Uuid::new_v4());

    manager.connect(old_id).expect("connect old");
    next_event(&mut events, is_kind(EventKind::Connected)).await;

    manager.connect(new_id).expect("connect new");
    let connected = next_event(&mut events, is_kind(EventKind::Connected)).await;
    assert_eq!(connected.conversation_id(), Some(new_id));

    let (closed_id, marker) = next_received(&mut received).await;
    assert_eq!((closed_id, marker.as_str()), (old_id.0, CLOSED_MARKER));

    server.push_json(json!({"type": "presence", "user_id": 2, "username": "bob", "is_online": true}));
    let presence = next_event(&mut events, is_kind(EventKind::Presence)).await;
    assert_eq!(presence.conversation_id(), Some(new_id));

    tokio::time::sleep(Duration::from_millis(150)).await;
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.conversation_id(), Some(old_id), "stale event: {event:?}");
    }
    assert_eq!(manager.status().conversation_id, Some(new_id));
    assert!(manager.is_open());
}
