use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::MessageRecord,
};

/// A message as the conversation view renders it: the wire fields plus the
/// provisional flag maintained by the send path.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to_id: Option<MessageId>,
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_provisional: bool,
}

impl Message {
    pub fn from_record(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content,
            reply_to_id: record.reply_to_id,
            attachments: record.attachments,
            created_at: record.created_at,
            edited_at: record.edited_at,
            is_provisional: false,
        }
    }

    /// Locally-composed message shown before the persist round-trip
    /// completes. `created_at` is a client-clock estimate until confirmed.
    pub fn provisional(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
        attachments: Vec<String>,
        reply_to_id: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::provisional(),
            conversation_id,
            sender_id,
            content: content.into(),
            reply_to_id,
            attachments,
            created_at: Utc::now(),
            edited_at: None,
            is_provisional: true,
        }
    }
}

/// Key under which a provisional entry waits for its durable confirmation.
/// The change-feed self-echo carries the same three fields, which is how the
/// reconciler recognizes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProvisionalKey {
    pub sender_id: UserId,
    pub content: String,
    pub attachments: Vec<String>,
}

impl ProvisionalKey {
    pub fn of(message: &Message) -> Self {
        Self {
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            attachments: message.attachments.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    /// Insertion order, the stable tie-break for equal `created_at`.
    seq: u64,
}

/// Ordered, deduplicated message list for one open conversation.
///
/// Entries are kept sorted by `created_at` ascending with ties broken by
/// insertion order. No operation silently drops an entry: an insert either
/// adds a message or is rejected as a duplicate by id.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<Entry>,
    provisional: HashMap<ProvisionalKey, MessageId>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|e| e.message.id == *id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries
            .iter()
            .find(|e| e.message.id == *id)
            .map(|e| &e.message)
    }

    /// Messages sorted by `created_at` ascending, insertion order on ties.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Ids of all durable entries, used when reconciling against a full
    /// re-fetch.
    pub fn durable_ids(&self) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter(|e| !e.message.is_provisional)
            .map(|e| e.message.id.clone())
            .collect()
    }

    /// Adds a message, or rejects it as a duplicate by id. A provisional
    /// insert also claims its `(sender, content, attachments)` slot; a second
    /// provisional insert for an already-claimed slot is rejected.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        if message.is_provisional {
            let key = ProvisionalKey::of(&message);
            if self.provisional.contains_key(&key) {
                return false;
            }
            self.provisional.insert(key, message.id.clone());
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { message, seq });
        self.resort();
        true
    }

    /// Swaps the entry with `old_id` for `new_message`, recomputing its
    /// position from the new `created_at`. Used to confirm a provisional
    /// entry with its durable record.
    pub fn replace(&mut self, old_id: &MessageId, new_message: Message) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.message.id == *old_id) else {
            return false;
        };
        if self.entries[index].message.is_provisional {
            let key = ProvisionalKey::of(&self.entries[index].message);
            self.provisional.remove(&key);
        }
        self.entries[index].message = new_message;
        self.resort();
        true
    }

    /// Removes by id, tolerating absence.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.message.id == *id) else {
            return false;
        };
        let entry = self.entries.remove(index);
        if entry.message.is_provisional {
            self.provisional.remove(&ProvisionalKey::of(&entry.message));
        }
        true
    }

    /// Insert that no-ops when an entry with the same id already exists.
    pub fn upsert_by_id(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.insert(message)
    }

    /// Merges the mutable fields of a change-feed update into the entry with
    /// `id`. Re-sorts only when the authoritative `created_at` differs from
    /// what was inserted. Returns whether anything changed.
    pub fn update_fields(
        &mut self,
        id: &MessageId,
        content: &str,
        edited_at: Option<DateTime<Utc>>,
        created_at: Option<DateTime<Utc>>,
    ) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == *id) else {
            return false;
        };
        let mut changed = false;
        if entry.message.content != content {
            entry.message.content = content.to_string();
            changed = true;
        }
        if entry.message.edited_at != edited_at {
            entry.message.edited_at = edited_at;
            changed = true;
        }
        let mut moved = false;
        if let Some(created_at) = created_at {
            if entry.message.created_at != created_at {
                entry.message.created_at = created_at;
                changed = true;
                moved = true;
            }
        }
        if moved {
            self.resort();
        }
        changed
    }

    /// Provisional entry still awaiting confirmation for this key, if any.
    pub fn provisional_matching(&self, key: &ProvisionalKey) -> Option<&MessageId> {
        self.provisional.get(key)
    }

    pub fn has_provisional(&self) -> bool {
        !self.provisional.is_empty()
    }

    fn resort(&mut self) {
        self.entries
            .sort_by(|a, b| (a.message.created_at, a.seq).cmp(&(b.message.created_at, b.seq)));
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
