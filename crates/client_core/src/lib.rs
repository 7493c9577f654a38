pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod presence;
pub mod reconciler;
pub mod typing;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use chrono::Utc;
use shared::{
    domain::{ConversationId, TempId, UserId},
    protocol::ClientFrame,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep_until, Duration, Instant},
};
use tracing::{debug, info, warn};

pub use api::{ConversationApi, HttpConversationApi, NoHistoryApi};
pub use config::{load_settings, Settings};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use error::ChatError;
pub use event_bus::{EventBus, EventHandler, PublishReport};
pub use events::{ChatEvent, ErrorKind, EventKind};
pub use presence::{PresenceEntry, PresenceTracker};
pub use reconciler::{ChatMessage, DeliveryState, MessageKey, MessageReconciler};
pub use typing::{TypingTracker, TypingUser};

/// Past the window boundary so a local echo reads as unconfirmed when the timer fires.
const WINDOW_SLACK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatView {
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<ChatMessage>,
    pub typing_users: Vec<TypingUser>,
    pub presence: BTreeMap<UserId, PresenceEntry>,
    pub is_connected: bool,
    pub is_closed: bool,
}

#[derive(Default)]
struct ActiveConversation {
    conversation_id: Option<ConversationId>,
    is_closed: bool,
    window_timers: Vec<JoinHandle<()>>,
}

struct Session {
    active: Mutex<ActiveConversation>,
    reconciler: Mutex<MessageReconciler>,
    typing: TypingTracker,
    presence: PresenceTracker,
    status: watch::Receiver<ConnectionStatus>,
    view: watch::Sender<ChatView>,
}

impl Session {
    fn new(settings: &Settings, status: watch::Receiver<ConnectionStatus>) -> Arc<Self> {
        let (view, _) = watch::channel(ChatView::default());
        Arc::new_cyclic(|weak: &Weak<Session>| {
            let weak = weak.clone();
            let typing = TypingTracker::with_notifier(
                settings.typing_timeout,
                Arc::new(move || {
                    if let Some(session) = weak.upgrade() {
                        session.refresh();
                    }
                }),
            );
            Session {
                active: Mutex::new(ActiveConversation::default()),
                reconciler: Mutex::new(
                    MessageReconciler::new(settings.reconcile_window)
                        .with_local_user(settings.local_user_id),
                ),
                typing,
                presence: PresenceTracker::new(),
                status,
                view,
            }
        })
    }

    fn lock_active(&self) -> MutexGuard<'_, ActiveConversation> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reconciler(&self) -> MutexGuard<'_, MessageReconciler> {
        self.reconciler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_id(&self) -> Option<ConversationId> {
        self.lock_active().conversation_id
    }

    fn is_active(&self, event: &ChatEvent) -> bool {
        let active = self.active_id();
        active.is_some() && event.conversation_id() == active
    }

    fn clear(&self) {
        {
            let mut active = self.lock_active();
            for timer in active.window_timers.drain(..) {
                timer.abort();
            }
            active.conversation_id = None;
            active.is_closed = false;
        }
        self.lock_reconciler().reset();
        self.typing.clear();
        self.presence.clear();
    }

    fn derive_view(&self) -> ChatView {
        let messages = self.lock_reconciler().messages(Instant::now());
        let (conversation_id, is_closed) = {
            let active = self.lock_active();
            (active.conversation_id, active.is_closed)
        };
        let is_connected = {
            let status = self.status.borrow();
            status.is_open() && conversation_id.is_some() && status.conversation_id == conversation_id
        };
        ChatView {
            conversation_id,
            messages,
            typing_users: self.typing.typing_users(),
            presence: self.presence.snapshot(),
            is_connected,
            is_closed,
        }
    }

    /// Derives under the watch lock so concurrent refreshes publish in order.
    fn refresh(&self) {
        self.view.send_modify(|view| *view = self.derive_view());
    }

    fn schedule_window_refresh(self: &Arc<Self>, sent_at: Instant, window: Duration) {
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            sleep_until(sent_at + window + WINDOW_SLACK).await;
            if let Some(session) = weak.upgrade() {
                session.refresh();
            }
        });
        let mut active = self.lock_active();
        active.window_timers.retain(|timer| !timer.is_finished());
        active.window_timers.push(timer);
    }
}

/// Single entry point for a chat view: one conversation at a time, history
/// plus live stream plus local echoes merged into [`ChatView`].
pub struct ChatClient {
    settings: Settings,
    bus: Arc<EventBus>,
    connection: ConnectionManager,
    api: Arc<dyn ConversationApi>,
    session: Arc<Session>,
    external: Mutex<Vec<ExternalHandler>>,
}

struct ExternalHandler {
    kind: EventKind,
    handler: EventHandler,
    gated: EventHandler,
}

impl ChatClient {
    pub fn new(settings: Settings) -> Arc<Self> {
        let api = Arc::new(HttpConversationApi::new(&settings));
        Self::new_with_api(settings, api)
    }

    pub fn new_with_api(settings: Settings, api: Arc<dyn ConversationApi>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let connection = ConnectionManager::new(settings.clone(), Arc::clone(&bus));
        let session = Session::new(&settings, connection.subscribe_status());
        register_handlers(&bus, &session);
        Arc::new(Self {
            settings,
            bus,
            connection,
            api,
            session,
            external: Mutex::new(Vec::new()),
        })
    }

    /// Opens `conversation_id`: tears down any other conversation, connects the
    /// channel and seeds the view with history page 1. Re-opening the active
    /// conversation reloads page 1 and reconnects if the retry budget was spent.
    pub async fn open(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        if self.session.active_id() != Some(conversation_id) {
            self.teardown();
            self.session.lock_active().conversation_id = Some(conversation_id);
            info!(%conversation_id, "opening conversation");
        }
        if let Err(err) = self.connection.connect(conversation_id) {
            self.teardown();
            self.session.refresh();
            return Err(err);
        }
        self.session.refresh();
        self.load_page(conversation_id, 1).await.map(|_| ())
    }

    pub fn close(&self) {
        if let Some(conversation_id) = self.session.active_id() {
            info!(%conversation_id, "closing conversation view");
        }
        self.teardown();
        self.session.refresh();
    }

    /// Sends `content` and shows it immediately as a local echo. The echo is
    /// rolled back if the channel is not open.
    pub fn send(&self, content: &str) -> Result<TempId, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.active_conversation()?;

        let sent_at = Instant::now();
        let temp_id = self
            .session
            .lock_reconciler()
            .add_optimistic(content, Utc::now(), sent_at);
        let frame = ClientFrame::Message {
            content: content.to_string(),
        };
        if let Err(err) = self.connection.send(&frame) {
            self.session.lock_reconciler().rollback(temp_id);
            warn!(%temp_id, error = %err, "send rejected; local echo rolled back");
            return Err(err);
        }

        debug!(%temp_id, "local echo added");
        self.session
            .schedule_window_refresh(sent_at, self.settings.reconcile_window);
        self.session.refresh();
        Ok(temp_id)
    }

    pub fn set_typing(&self, is_typing: bool) -> Result<(), ChatError> {
        self.active_conversation()?;
        self.connection.send(&ClientFrame::Typing { is_typing })
    }

    pub fn mark_read(&self) -> Result<(), ChatError> {
        self.active_conversation()?;
        self.connection.send(&ClientFrame::Read)
    }

    /// Fetches an older history page and prepends it; page 1 reloads the
    /// baseline instead. Returns how many messages the page carried.
    pub async fn load_older(&self, page: u32) -> Result<usize, ChatError> {
        let conversation_id = self.active_conversation()?;
        self.load_page(conversation_id, page).await
    }

    /// Asks the server to close the active conversation. The view flips to
    /// closed when the server confirms over the channel.
    pub async fn close_conversation(&self) -> Result<(), ChatError> {
        let conversation_id = self.active_conversation()?;
        self.api
            .close_conversation(conversation_id)
            .await
            .map_err(ChatError::history)?;
        info!(%conversation_id, "close requested");
        Ok(())
    }

    pub fn set_local_user(&self, user_id: Option<UserId>) {
        self.session.lock_reconciler().set_local_user(user_id);
    }

    pub fn view(&self) -> ChatView {
        self.session.derive_view()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ChatView> {
        self.session.view.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Raw events of the active conversation. Late events from a channel
    /// that was already switched away from or closed are not delivered.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> bool {
        let mut external = self.lock_external();
        if external
            .iter()
            .any(|entry| entry.kind == kind && Arc::ptr_eq(&entry.handler, &handler))
        {
            return false;
        }
        let session = Arc::clone(&self.session);
        let inner = Arc::clone(&handler);
        let gated: EventHandler = Arc::new(move |event: &ChatEvent| -> anyhow::Result<()> {
            if session.is_active(event) {
                inner(event)?;
            }
            Ok(())
        });
        self.bus.subscribe(kind, Arc::clone(&gated));
        external.push(ExternalHandler {
            kind,
            handler,
            gated,
        });
        true
    }

    pub fn unsubscribe(&self, kind: EventKind, handler: &EventHandler) -> bool {
        let mut external = self.lock_external();
        let Some(index) = external
            .iter()
            .position(|entry| entry.kind == kind && Arc::ptr_eq(&entry.handler, handler))
        else {
            return false;
        };
        let entry = external.remove(index);
        self.bus.unsubscribe(kind, &entry.gated)
    }

    fn lock_external(&self) -> MutexGuard<'_, Vec<ExternalHandler>> {
        self.external.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_conversation(&self) -> Result<ConversationId, ChatError> {
        self.session.active_id().ok_or(ChatError::NoConversation)
    }

    fn teardown(&self) {
        self.connection.disconnect();
        self.session.clear();
    }

    async fn load_page(&self, conversation_id: ConversationId, page: u32) -> Result<usize, ChatError> {
        let history = self
            .api
            .fetch_history(conversation_id, page)
            .await
            .map_err(ChatError::history)?;
        let loaded = history.results.len();
        {
            let active = self.session.lock_active();
            if active.conversation_id != Some(conversation_id) {
                debug!(%conversation_id, page, "dropping history page for superseded conversation");
                return Ok(0);
            }
            self.session
                .lock_reconciler()
                .load_page(page, history.results);
        }
        debug!(%conversation_id, page, loaded, "history page merged");
        self.session.refresh();
        Ok(loaded)
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.session.clear();
    }
}

/// Component handlers first, then the view refresh so it sees their updates.
fn register_handlers(bus: &EventBus, session: &Arc<Session>) {
    let typing = Arc::clone(session);
    bus.subscribe(
        EventKind::Typing,
        Arc::new(move |event: &ChatEvent| -> anyhow::Result<()> {
            if typing.is_active(event) {
                typing.typing.handle_event(event)?;
            }
            Ok(())
        }),
    );

    let presence = Arc::clone(session);
    bus.subscribe(
        EventKind::Presence,
        Arc::new(move |event: &ChatEvent| -> anyhow::Result<()> {
            if presence.is_active(event) {
                presence.presence.handle_event(event)?;
            }
            Ok(())
        }),
    );

    let messages = Arc::clone(session);
    bus.subscribe(
        EventKind::Message,
        Arc::new(move |event: &ChatEvent| -> anyhow::Result<()> {
            if messages.is_active(event) {
                messages.lock_reconciler().handle_event(event)?;
            }
            Ok(())
        }),
    );

    let closed = Arc::clone(session);
    bus.subscribe(
        EventKind::ConversationClosed,
        Arc::new(move |event: &ChatEvent| -> anyhow::Result<()> {
            if closed.is_active(event) {
                closed.lock_active().is_closed = true;
                info!(conversation_id = ?event.conversation_id(), "conversation closed by server");
            }
            Ok(())
        }),
    );

    let view = Arc::clone(session);
    bus.subscribe_all(Arc::new(move |event: &ChatEvent| -> anyhow::Result<()> {
        if view.is_active(event) {
            view.refresh();
        }
        Ok(())
    }));
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
