use std::collections::HashSet;

use shared::{
    domain::UserId,
    protocol::{ChannelEvent, MessageRecord},
};
use tracing::warn;

use crate::store::{Message, MessageStore, ProvisionalKey};

/// What an applied event did to the store. `appended` gates read-receipt
/// recomputation: receipts only change when a message is added (or the
/// participant set moves), not on edits or deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub changed: bool,
    pub appended: bool,
}

impl ReconcileOutcome {
    const UNCHANGED: Self = Self {
        changed: false,
        appended: false,
    };
}

/// Merges one inbound channel event into the store.
///
/// Pure with respect to arrival order: for a broadcast and a change-feed
/// insert describing the same durable message, `A,B` and `B,A` produce the
/// same final store. Events that match no rule are discarded, never applied
/// partially.
pub fn apply(store: &mut MessageStore, local_user: &UserId, event: ChannelEvent) -> ReconcileOutcome {
    match event {
        ChannelEvent::Broadcast { message } | ChannelEvent::Insert { message } => {
            apply_insert(store, local_user, message)
        }
        ChannelEvent::Update { message } => {
            let changed = store.update_fields(
                &message.id,
                &message.content,
                message.edited_at,
                Some(message.created_at),
            );
            ReconcileOutcome {
                changed,
                appended: false,
            }
        }
        ChannelEvent::Delete { id } => {
            let changed = store.remove(&id);
            ReconcileOutcome {
                changed,
                appended: false,
            }
        }
        ChannelEvent::ParticipantsChanged { .. } => {
            // Participant replication is handled by the session, not the
            // message reconciler.
            warn!("participant event reached the message reconciler; discarding");
            ReconcileOutcome::UNCHANGED
        }
    }
}

/// Deduplication for broadcast / change-feed inserts:
/// 1. durable id already present -> drop;
/// 2. self-echo of a send still awaiting confirmation -> drop, the send
///    path's own confirmation is authoritative;
/// 3. otherwise insert, positioned by `created_at`.
fn apply_insert(
    store: &mut MessageStore,
    local_user: &UserId,
    record: MessageRecord,
) -> ReconcileOutcome {
    if store.contains(&record.id) {
        return ReconcileOutcome::UNCHANGED;
    }
    if record.sender_id == *local_user {
        let key = ProvisionalKey {
            sender_id: record.sender_id.clone(),
            content: record.content.clone(),
            attachments: record.attachments.clone(),
        };
        if store.provisional_matching(&key).is_some() {
            return ReconcileOutcome::UNCHANGED;
        }
    }
    let inserted = store.insert(Message::from_record(record));
    ReconcileOutcome {
        changed: inserted,
        appended: inserted,
    }
}

/// Reconciles the store against a full authoritative fetch, as happens on
/// (re)subscribe. Covers inserts, updates and deletes missed while the
/// channel was down, without disturbing provisional entries.
pub fn sync_snapshot(
    store: &mut MessageStore,
    local_user: &UserId,
    records: Vec<MessageRecord>,
) -> ReconcileOutcome {
    let fetched: HashSet<_> = records.iter().map(|r| r.id.clone()).collect();

    let mut outcome = ReconcileOutcome::UNCHANGED;
    for id in store.durable_ids() {
        if !fetched.contains(&id) {
            store.remove(&id);
            outcome.changed = true;
        }
    }

    for record in records {
        if store.contains(&record.id) {
            outcome.changed |= store.update_fields(
                &record.id,
                &record.content,
                record.edited_at,
                Some(record.created_at),
            );
        } else {
            let applied = apply_insert(store, local_user, record);
            outcome.changed |= applied.changed;
            outcome.appended |= applied.appended;
        }
    }
    outcome
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
