use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, TempId, UserId},
    protocol::{MessagePayload, SenderSummary},
};
use tokio::time::Instant;
use tracing::debug;

use crate::events::ChatEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Temp(TempId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Confirmed,
    /// Local echo still inside the reconciliation window.
    Pending,
    /// Local echo whose window elapsed without a matching server copy.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub content: String,
    pub sender: Option<SenderSummary>,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl ChatMessage {
    pub fn is_optimistic(&self) -> bool {
        matches!(self.key, MessageKey::Temp(_))
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Server(id) => Some(id),
            MessageKey::Temp(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    History,
    Live,
}

struct ConfirmedEntry {
    payload: MessagePayload,
    origin: Origin,
    seq: i64,
}

struct OptimisticEntry {
    content: String,
    created_at: DateTime<Utc>,
    sent_at: Instant,
    seq: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveOutcome {
    /// `true` when the server id was already present and got overwritten.
    pub replaced: bool,
    pub retired: Option<TempId>,
}

/// Merges history pages, live messages and optimistic sends into one ordered,
/// duplicate-free sequence. Order is `created_at` ascending, then insertion order.
pub struct MessageReconciler {
    window: Duration,
    local_user: Option<UserId>,
    confirmed: HashMap<MessageId, ConfirmedEntry>,
    optimistic: BTreeMap<TempId, OptimisticEntry>,
    next_seq: i64,
    min_seq: i64,
    next_temp: u64,
}

impl MessageReconciler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            local_user: None,
            confirmed: HashMap::new(),
            optimistic: BTreeMap::new(),
            next_seq: 0,
            min_seq: 0,
            next_temp: 1,
        }
    }

    pub fn with_local_user(mut self, local_user: Option<UserId>) -> Self {
        self.local_user = local_user;
        self
    }

    pub fn set_local_user(&mut self, local_user: Option<UserId>) {
        self.local_user = local_user;
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn handle_event(&mut self, event: &ChatEvent) -> anyhow::Result<()> {
        if let ChatEvent::Message { message, .. } = event {
            self.apply_live(message.clone(), Instant::now());
        }
        Ok(())
    }

    /// Page 1 replaces the historical baseline; later pages are older and get prepended.
    /// Ids already held from the live stream keep their live copy.
    pub fn load_page(&mut self, page: u32, messages: Vec<MessagePayload>) {
        if page <= 1 {
            self.confirmed
                .retain(|_, entry| entry.origin == Origin::Live);
            for payload in messages {
                if self.confirmed.contains_key(&payload.id) {
                    continue;
                }
                let seq = self.bump_seq();
                self.confirmed.insert(
                    payload.id,
                    ConfirmedEntry {
                        payload,
                        origin: Origin::History,
                        seq,
                    },
                );
            }
            return;
        }

        let fresh: Vec<MessagePayload> = messages
            .into_iter()
            .filter(|payload| !self.confirmed.contains_key(&payload.id))
            .collect();
        let base = self.min_seq - fresh.len() as i64;
        for (offset, payload) in fresh.into_iter().enumerate() {
            let seq = base + offset as i64;
            // A page may repeat an id; the first copy keeps its slot.
            self.confirmed.entry(payload.id).or_insert(ConfirmedEntry {
                payload,
                origin: Origin::History,
                seq,
            });
        }
        self.min_seq = base;
    }

    pub fn apply_live(&mut self, payload: MessagePayload, arrived: Instant) -> LiveOutcome {
        let retired = self.take_matching_optimistic(&payload, arrived);
        let id = payload.id;

        if let Some(entry) = self.confirmed.get_mut(&id) {
            entry.payload = payload;
            entry.origin = Origin::Live;
            return LiveOutcome {
                replaced: true,
                retired: retired.map(|(temp_id, _)| temp_id),
            };
        }

        let seq = match retired {
            Some((_, seq)) => seq,
            None => self.bump_seq(),
        };
        self.confirmed.insert(
            id,
            ConfirmedEntry {
                payload,
                origin: Origin::Live,
                seq,
            },
        );
        LiveOutcome {
            replaced: false,
            retired: retired.map(|(temp_id, _)| temp_id),
        }
    }

    pub fn add_optimistic(
        &mut self,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
        sent_at: Instant,
    ) -> TempId {
        let temp_id = TempId(self.next_temp);
        self.next_temp += 1;
        let seq = self.bump_seq();
        self.optimistic.insert(
            temp_id,
            OptimisticEntry {
                content: content.into(),
                created_at,
                sent_at,
                seq,
            },
        );
        temp_id
    }

    pub fn rollback(&mut self, temp_id: TempId) -> bool {
        self.optimistic.remove(&temp_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.optimistic.len()
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.optimistic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        self.confirmed.clear();
        self.optimistic.clear();
        self.next_seq = 0;
        self.min_seq = 0;
    }

    /// Ordered view; `now` decides whether local echoes are still pending.
    pub fn messages(&self, now: Instant) -> Vec<ChatMessage> {
        let mut ordered: Vec<(i64, ChatMessage)> =
            Vec::with_capacity(self.confirmed.len() + self.optimistic.len());

        ordered.extend(self.confirmed.values().map(|entry| {
            (
                entry.seq,
                ChatMessage {
                    key: MessageKey::Server(entry.payload.id),
                    content: entry.payload.content.clone(),
                    sender: entry.payload.sender.clone(),
                    created_at: entry.payload.created_at,
                    delivery: DeliveryState::Confirmed,
                },
            )
        }));

        ordered.extend(self.optimistic.iter().map(|(temp_id, entry)| {
            let delivery = if now.saturating_duration_since(entry.sent_at) <= self.window {
                DeliveryState::Pending
            } else {
                DeliveryState::Unconfirmed
            };
            (
                entry.seq,
                ChatMessage {
                    key: MessageKey::Temp(*temp_id),
                    content: entry.content.clone(),
                    sender: None,
                    created_at: entry.created_at,
                    delivery,
                },
            )
        }));

        ordered.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        ordered.into_iter().map(|(_, message)| message).collect()
    }

    fn take_matching_optimistic(
        &mut self,
        payload: &MessagePayload,
        arrived: Instant,
    ) -> Option<(TempId, i64)> {
        if let (Some(local), Some(sender)) = (self.local_user, payload.sender.as_ref()) {
            if sender.id != local {
                return None;
            }
        }
        let temp_id = self
            .optimistic
            .iter()
            .find(|(_, entry)| {
                entry.content == payload.content
                    && arrived.saturating_duration_since(entry.sent_at) <= self.window
            })
            .map(|(temp_id, _)| *temp_id)?;
        let entry = self.optimistic.remove(&temp_id)?;
        debug!(%temp_id, message_id = %payload.id, "optimistic message confirmed");
        Some((temp_id, entry.seq))
    }

    fn bump_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
