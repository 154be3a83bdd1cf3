use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, ConversationKind, MessageId, UserId};

/// Message record as the persistence layer serves it. `id` and `created_at`
/// are authoritative: both come from the server once the row is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Per-conversation read state of one participant. `last_read_at` is
/// monotonically non-decreasing and only ever written by the read-marker
/// endpoint; clients observe it to derive read receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Derived server-side from the participant rows; denominator for
    /// "read by everyone" is `participant_count - 1`.
    pub participant_count: usize,
}

/// Body of `POST /messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Body of `PATCH /messages/:id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessageRequest {
    pub content: String,
}

/// Body of `POST /conversations/:id/read_marker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadMarkerRequest {
    pub user_id: UserId,
    pub last_read_at: DateTime<Utc>,
}

/// Everything the real-time channel can deliver to a subscribed client.
///
/// `Broadcast` is the ephemeral fan-out published by the sending client; it
/// is best-effort and never reaches the sender itself. The `change:*` kinds
/// replay committed persistence mutations and are delivered
/// guaranteed-eventually, in no particular order relative to broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ChannelEvent {
    #[serde(rename = "broadcast:new_message")]
    Broadcast { message: MessageRecord },
    #[serde(rename = "change:insert")]
    Insert { message: MessageRecord },
    #[serde(rename = "change:update")]
    Update { message: MessageRecord },
    #[serde(rename = "change:delete")]
    Delete { id: MessageId },
    #[serde(rename = "change:participants")]
    ParticipantsChanged {
        participants: Vec<ParticipantRecord>,
    },
}

/// Subscription health as reported by the channel transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Error { reason: String },
}
