use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::ConversationId,
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Settings,
    error::ChatError,
    event_bus::EventBus,
    events::{ChatEvent, ErrorKind},
};

const NORMAL_CLOSE: u16 = 1000;

type ChannelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    ClosedIntentional,
    /// Dropped without being asked to. Either a reconnect is scheduled or the
    /// retry budget is spent (`retries_exhausted`).
    ClosedUnintentional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub conversation_id: Option<ConversationId>,
    pub state: ConnectionState,
    pub attempts: u32,
    pub retries_exhausted: bool,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

enum Outbound {
    Frame(String),
    Close,
}

enum ChannelEnd {
    Local,
    /// The peer closed or the stream broke; carries the close code if any.
    Remote(Option<u16>),
}

struct ChannelSlot {
    conversation_id: Option<ConversationId>,
    state: ConnectionState,
    attempts: u32,
    intentional_close: bool,
    retries_exhausted: bool,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    driver: Option<JoinHandle<()>>,
}

impl ChannelSlot {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            conversation_id: self.conversation_id,
            state: self.state,
            attempts: self.attempts,
            retries_exhausted: self.retries_exhausted,
        }
    }

    fn shut_down(&mut self) {
        self.intentional_close = true;
        self.generation += 1;
        match self.outbound.take() {
            // The driver writes a normal close and exits on its own.
            Some(tx) if tx.send(Outbound::Close).is_ok() => {
                self.driver = None;
            }
            _ => {
                if let Some(driver) = self.driver.take() {
                    driver.abort();
                }
            }
        }
    }
}

struct Inner {
    settings: Settings,
    bus: Arc<EventBus>,
    slot: Mutex<ChannelSlot>,
    status: watch::Sender<ConnectionStatus>,
}

/// Owns the single live channel: handshake, inbound classification, outbound
/// frames, and reconnect with linear backoff.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(settings: Settings, bus: Arc<EventBus>) -> Self {
        let slot = ChannelSlot {
            conversation_id: None,
            state: ConnectionState::Idle,
            attempts: 0,
            intentional_close: false,
            retries_exhausted: false,
            generation: 0,
            outbound: None,
            driver: None,
        };
        let (status, _) = watch::channel(slot.status());
        Self {
            inner: Arc::new(Inner {
                settings,
                bus,
                slot: Mutex::new(slot),
                status,
            }),
        }
    }

    /// Opens the channel for `conversation_id`, tearing down a channel for any
    /// other conversation first. A no-op while the same conversation is open
    /// or connecting.
    pub fn connect(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        let url = self.inner.settings.channel_url(conversation_id)?;
        let mut slot = self.inner.lock_slot();

        if slot.conversation_id == Some(conversation_id)
            && matches!(
                slot.state,
                ConnectionState::Connecting | ConnectionState::Open
            )
        {
            debug!(%conversation_id, "channel already active");
            return Ok(());
        }
        if let Some(previous) = slot.conversation_id.filter(|id| *id != conversation_id) {
            info!(%previous, %conversation_id, "switching conversation channel");
        }

        slot.shut_down();
        slot.conversation_id = Some(conversation_id);
        slot.state = ConnectionState::Connecting;
        slot.attempts = 0;
        slot.intentional_close = false;
        slot.retries_exhausted = false;
        let generation = slot.generation;
        slot.driver = Some(tokio::spawn(drive_channel(
            Arc::clone(&self.inner),
            conversation_id,
            url,
            generation,
        )));
        self.inner.publish_status(&slot);
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut slot = self.inner.lock_slot();
        if slot.conversation_id.is_none() && slot.driver.is_none() {
            return;
        }
        if let Some(conversation_id) = slot.conversation_id {
            info!(%conversation_id, "closing conversation channel");
        }
        slot.shut_down();
        slot.conversation_id = None;
        slot.state = ConnectionState::ClosedIntentional;
        slot.attempts = 0;
        slot.retries_exhausted = false;
        self.inner.publish_status(&slot);
    }

    pub fn send(&self, frame: &ClientFrame) -> Result<(), ChatError> {
        let slot = self.inner.lock_slot();
        if slot.state != ConnectionState::Open {
            return Err(ChatError::SendRejected);
        }
        let Some(outbound) = slot.outbound.as_ref() else {
            return Err(ChatError::SendRejected);
        };
        let text =
            serde_json::to_string(frame).map_err(|err| ChatError::Transport(err.to_string()))?;
        outbound
            .send(Outbound::Frame(text))
            .map_err(|_| ChatError::SendRejected)?;
        debug!(kind = frame.kind(), "queued outbound frame");
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock_slot().status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.status().is_open()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.lock_slot().shut_down();
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, ChannelSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_status(&self, slot: &ChannelSlot) {
        self.status.send_replace(slot.status());
    }

    fn is_current(&self, generation: u64) -> bool {
        let slot = self.lock_slot();
        slot.generation == generation && !slot.intentional_close
    }

    fn emit(&self, generation: u64, event: ChatEvent) {
        if self.is_current(generation) {
            self.bus.publish(&event);
        }
    }

    fn mark_open(&self, generation: u64, outbound: mpsc::UnboundedSender<Outbound>) -> bool {
        let mut slot = self.lock_slot();
        if slot.generation != generation || slot.intentional_close {
            return false;
        }
        slot.state = ConnectionState::Open;
        slot.attempts = 0;
        slot.retries_exhausted = false;
        slot.outbound = Some(outbound);
        self.publish_status(&slot);
        true
    }

    fn after_close(
        &self,
        generation: u64,
        conversation_id: ConversationId,
        code: Option<u16>,
    ) -> Option<Duration> {
        let (delay, retry_attempt) = {
            let mut slot = self.lock_slot();
            if slot.generation != generation || slot.intentional_close {
                return None;
            }
            slot.outbound = None;

            let (delay, retry_attempt) = if code == Some(NORMAL_CLOSE) {
                slot.state = ConnectionState::ClosedIntentional;
                info!(%conversation_id, "server closed channel normally");
                (None, None)
            } else if slot.attempts >= self.settings.max_reconnect_attempts {
                slot.state = ConnectionState::ClosedUnintentional;
                slot.retries_exhausted = true;
                warn!(
                    %conversation_id,
                    attempts = slot.attempts,
                    "reconnect budget exhausted; waiting for explicit connect"
                );
                (None, None)
            } else {
                slot.state = ConnectionState::ClosedUnintentional;
                slot.attempts += 1;
                let delay = self.settings.reconnect_base_delay * slot.attempts;
                info!(
                    %conversation_id,
                    attempt = slot.attempts,
                    delay_ms = delay.as_millis() as u64,
                    ?code,
                    "channel dropped; scheduling reconnect"
                );
                (Some(delay), Some(slot.attempts))
            };
            self.publish_status(&slot);
            (delay, retry_attempt)
        };

        self.emit(
            generation,
            ChatEvent::Disconnected {
                conversation_id,
                code,
                retry_attempt,
            },
        );
        delay
    }

    fn begin_reconnect(&self, generation: u64) -> bool {
        let mut slot = self.lock_slot();
        if slot.generation != generation || slot.intentional_close {
            return false;
        }
        slot.state = ConnectionState::Connecting;
        self.publish_status(&slot);
        true
    }

    fn dispatch_inbound(&self, generation: u64, conversation_id: ConversationId, text: &str) {
        let event = match ServerFrame::parse(text) {
            Ok(ServerFrame::Message { message, .. })
                if message
                    .conversation_id
                    .is_some_and(|id| id != conversation_id) =>
            {
                warn!(%conversation_id, message_id = %message.id, "dropping message for another conversation");
                ChatEvent::Error {
                    conversation_id: Some(conversation_id),
                    kind: ErrorKind::Protocol,
                    message: format!("message {} belongs to another conversation", message.id),
                }
            }
            Ok(frame) => {
                debug!(%conversation_id, kind = frame.kind(), "inbound frame");
                ChatEvent::from_frame(conversation_id, frame)
            }
            Err(err) => {
                warn!(%conversation_id, kind = ?err.kind(), error = %err, "dropping unclassifiable frame");
                ChatEvent::Error {
                    conversation_id: Some(conversation_id),
                    kind: ErrorKind::Protocol,
                    message: err.to_string(),
                }
            }
        };
        self.emit(generation, event);
    }

    fn transport_error(&self, generation: u64, conversation_id: ConversationId, message: String) {
        self.emit(
            generation,
            ChatEvent::Error {
                conversation_id: Some(conversation_id),
                kind: ErrorKind::Transport,
                message,
            },
        );
    }
}

async fn drive_channel(
    inner: Arc<Inner>,
    conversation_id: ConversationId,
    url: Url,
    generation: u64,
) {
    loop {
        let code = match timeout(inner.settings.connect_timeout, connect_async(url.as_str())).await
        {
            Ok(Ok((stream, _))) => {
                let (tx, rx) = mpsc::unbounded_channel();
                if !inner.mark_open(generation, tx) {
                    return;
                }
                info!(%conversation_id, "conversation channel open");
                inner.emit(generation, ChatEvent::Connected { conversation_id });
                match run_open_channel(&inner, conversation_id, generation, stream, rx).await {
                    ChannelEnd::Local => return,
                    ChannelEnd::Remote(code) => code,
                }
            }
            Ok(Err(err)) => {
                warn!(%conversation_id, error = %err, "channel handshake failed");
                inner.transport_error(
                    generation,
                    conversation_id,
                    format!("handshake failed: {err}"),
                );
                None
            }
            Err(_) => {
                warn!(%conversation_id, "channel handshake timed out");
                inner.transport_error(
                    generation,
                    conversation_id,
                    format!(
                        "handshake timed out after {}ms",
                        inner.settings.connect_timeout.as_millis()
                    ),
                );
                None
            }
        };

        let Some(delay) = inner.after_close(generation, conversation_id, code) else {
            return;
        };
        sleep(delay).await;
        if !inner.begin_reconnect(generation) {
            return;
        }
    }
}

async fn run_open_channel(
    inner: &Inner,
    conversation_id: ConversationId,
    generation: u64,
    stream: ChannelStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> ChannelEnd {
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    inner.dispatch_inbound(generation, conversation_id, &text);
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|frame| u16::from(frame.code));
                    debug!(%conversation_id, ?code, "peer closed channel");
                    return ChannelEnd::Remote(code);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%conversation_id, error = %err, "channel receive failed");
                    inner.transport_error(generation, conversation_id, format!("receive failed: {err}"));
                    return ChannelEnd::Remote(None);
                }
                None => return ChannelEnd::Remote(None),
            },
            command = outbound.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(err) = writer.send(Message::Text(text)).await {
                        warn!(%conversation_id, error = %err, "channel send failed");
                        inner.transport_error(generation, conversation_id, format!("send failed: {err}"));
                    }
                }
                Some(Outbound::Close) | None => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(err) = writer.send(Message::Close(Some(close))).await {
                        debug!(%conversation_id, error = %err, "close frame not delivered");
                    }
                    return ChannelEnd::Local;
                }
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
