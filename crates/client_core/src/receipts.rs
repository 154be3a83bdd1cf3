use shared::{domain::MessageId, protocol::ParticipantRecord};

use crate::store::Message;

/// Derived read state of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    /// Participants other than the sender whose `last_read_at` is at or
    /// after the message's `created_at`.
    pub read_by_others: usize,
    pub fully_read: bool,
}

/// Pure function of the participant set and the message snapshot. Triggered
/// only when the participant set changes or a message is appended; callers
/// must not invoke it on unrelated state changes.
pub fn read_receipts(
    participants: &[ParticipantRecord],
    participant_count: usize,
    messages: &[Message],
) -> Vec<ReadReceipt> {
    let all_others = participant_count.saturating_sub(1);
    messages
        .iter()
        .map(|message| {
            let read_by_others = participants
                .iter()
                .filter(|p| {
                    p.user_id != message.sender_id
                        && p.last_read_at.is_some_and(|at| at >= message.created_at)
                })
                .count();
            ReadReceipt {
                message_id: message.id.clone(),
                read_by_others,
                fully_read: read_by_others == all_others,
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
