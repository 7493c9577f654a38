use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use shared::domain::UserId;

use crate::events::ChatEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub username: String,
    pub is_online: bool,
}

/// Last-write-wins online/offline state per remote user. Entries never go
/// stale on their own; a lost "offline" frame leaves the user shown online.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    entries: Arc<Mutex<BTreeMap<UserId, PresenceEntry>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_event(&self, event: &ChatEvent) -> anyhow::Result<()> {
        if let ChatEvent::Presence {
            user_id,
            username,
            is_online,
            ..
        } = event
        {
            self.update(*user_id, username, *is_online);
        }
        Ok(())
    }

    pub fn update(&self, user_id: UserId, username: &str, is_online: bool) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                user_id,
                PresenceEntry {
                    username: username.to_string(),
                    is_online,
                },
            );
    }

    pub fn get(&self, user_id: UserId) -> Option<PresenceEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<UserId, PresenceEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::ConversationId;
    use uuid::Uuid;

    use super::*;

    fn presence(user: i64, name: &str, is_online: bool) -> ChatEvent {
        ChatEvent::Presence {
            conversation_id: ConversationId(Uuid::nil()),
            user_id: UserId(user),
            username: name.to_string(),
            is_online,
        }
    }

    #[test]
    fn last_write_wins_per_user() {
        let tracker = PresenceTracker::new();
        tracker.handle_event(&presence(1, "amy", true)).expect("event");
        tracker.handle_event(&presence(2, "bob", true)).expect("event");
        tracker.handle_event(&presence(1, "amy", false)).expect("event");

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot[&UserId(1)].is_online);
        assert!(snapshot[&UserId(2)].is_online);
    }

    #[test]
    fn ignores_other_events_and_clears_on_teardown() {
        let tracker = PresenceTracker::new();
        tracker
            .handle_event(&ChatEvent::ConversationClosed {
                conversation_id: ConversationId(Uuid::nil()),
                username: None,
            })
            .expect("event");
        assert!(tracker.snapshot().is_empty());

        tracker.update(UserId(3), "cat", true);
        assert_eq!(
            tracker.get(UserId(3)),
            Some(PresenceEntry {
                username: "cat".into(),
                is_online: true
            })
        );
        tracker.clear();
        assert_eq!(tracker.get(UserId(3)), None);
    }
}
