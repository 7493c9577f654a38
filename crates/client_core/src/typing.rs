use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use shared::domain::UserId;
use tokio::{
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::debug;

use crate::events::ChatEvent;

/// Callback run after state changes that no event triggered (timer expiry).
pub type ChangeNotifier = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: UserId,
    pub username: String,
}

struct TypingEntry {
    username: String,
    deadline: Instant,
    token: u64,
    since: u64,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    entries: HashMap<UserId, TypingEntry>,
    next_token: u64,
}

/// Remote users currently typing. Entries expire on their own after `timeout`
/// unless refreshed, since a "stopped typing" frame may never arrive.
#[derive(Clone)]
pub struct TypingTracker {
    state: Arc<Mutex<TypingState>>,
    timeout: Duration,
    on_expire: Option<ChangeNotifier>,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(TypingState::default())),
            timeout,
            on_expire: None,
        }
    }

    pub fn with_notifier(timeout: Duration, on_expire: ChangeNotifier) -> Self {
        Self {
            on_expire: Some(on_expire),
            ..Self::new(timeout)
        }
    }

    pub fn handle_event(&self, event: &ChatEvent) -> anyhow::Result<()> {
        if let ChatEvent::Typing {
            user_id,
            username,
            is_typing,
            ..
        } = event
        {
            if *is_typing {
                self.start(*user_id, username);
            } else {
                self.stop(*user_id);
            }
        }
        Ok(())
    }

    /// Inserts or refreshes `user_id`, replacing any pending expiry.
    pub fn start(&self, user_id: UserId, username: &str) {
        let deadline = Instant::now() + self.timeout;
        let mut guard = self.lock();
        let token = guard.next_token;
        guard.next_token += 1;
        let expiry = self.spawn_expiry(user_id, token, deadline);

        match guard.entries.get_mut(&user_id) {
            Some(entry) => {
                entry.expiry.abort();
                entry.username = username.to_string();
                entry.deadline = deadline;
                entry.token = token;
                entry.expiry = expiry;
            }
            None => {
                guard.entries.insert(
                    user_id,
                    TypingEntry {
                        username: username.to_string(),
                        deadline,
                        token,
                        since: token,
                        expiry,
                    },
                );
            }
        }
    }

    pub fn stop(&self, user_id: UserId) {
        if let Some(entry) = self.lock().entries.remove(&user_id) {
            entry.expiry.abort();
        }
    }

    /// Display list, oldest typist first.
    pub fn typing_users(&self) -> Vec<TypingUser> {
        let guard = self.lock();
        let mut entries: Vec<_> = guard.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.since);
        entries
            .into_iter()
            .map(|(user_id, entry)| TypingUser {
                user_id: *user_id,
                username: entry.username.clone(),
            })
            .collect()
    }

    pub fn deadline(&self, user_id: UserId) -> Option<Instant> {
        self.lock().entries.get(&user_id).map(|entry| entry.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Cancels every pending expiry and forgets all entries.
    pub fn clear(&self) {
        let mut guard = self.lock();
        for (_, entry) in guard.entries.drain() {
            entry.expiry.abort();
        }
    }

    fn spawn_expiry(&self, user_id: UserId, token: u64, deadline: Instant) -> JoinHandle<()> {
        let state = Arc::downgrade(&self.state);
        let on_expire = self.on_expire.clone();
        tokio::spawn(async move {
            sleep_until(deadline).await;
            if expire(&state, user_id, token) {
                debug!(user_id = user_id.0, "typing indicator expired");
                if let Some(notify) = on_expire {
                    notify();
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the entry only if it still carries `token`; a refresh wins over a late expiry.
fn expire(state: &Weak<Mutex<TypingState>>, user_id: UserId, token: u64) -> bool {
    let Some(state) = state.upgrade() else {
        return false;
    };
    let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.entries.get(&user_id) {
        Some(entry) if entry.token == token => {
            guard.entries.remove(&user_id);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
