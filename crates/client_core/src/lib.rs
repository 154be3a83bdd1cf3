//! Client-side synchronization engine for one open conversation view.
//!
//! The session owns the message store and the participant read-state for a
//! single conversation and keeps them correct while messages arrive through
//! two unordered, at-least-once feeds (ephemeral broadcast and durable
//! change-feed), while the user's own sends are shown optimistically, and
//! while the channel connection drops and recovers underneath it.

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{MessageId, UserId},
    protocol::{ChannelEvent, ConversationRecord, ParticipantRecord},
};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

pub mod connection;
pub mod error;
pub mod persistence;
pub mod receipts;
pub mod reconcile;
pub mod send;
pub mod store;
pub mod transport;

pub use connection::ConnectionState;
pub use error::{SendError, SessionError};
pub use persistence::{HttpPersistence, PersistenceApi};
pub use receipts::ReadReceipt;
pub use send::Draft;
pub use store::{Message, MessageStore};
pub use transport::{RealtimeChannel, WsChannel};

/// Everything the UI layer needs to observe. Each variant carries a full
/// snapshot so subscribers stay stateless.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    MessagesChanged { messages: Vec<Message> },
    ReadReceiptsChanged { receipts: Vec<ReadReceipt> },
    ConnectionChanged(ConnectionState),
    SendFailed { draft: Draft, reason: String },
}

pub(crate) struct SessionInner {
    conversation: Option<ConversationRecord>,
    store: MessageStore,
    participants: Vec<ParticipantRecord>,
    connection: ConnectionState,
    send_in_flight: bool,
    draft: Option<Draft>,
    retry_scheduled: bool,
    /// Bumped on every open/close. Asynchronous completions stamped with an
    /// older generation are discarded instead of touching a torn-down store.
    generation: u64,
}

/// One user's live view of one conversation.
///
/// All state lives behind a single mutex: handlers run to completion and are
/// only interleaved at await points, never preempted.
pub struct ChatSession {
    user_id: UserId,
    persistence: Arc<dyn PersistenceApi>,
    channel: Arc<dyn RealtimeChannel>,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatSession {
    pub fn new(
        user_id: UserId,
        persistence: Arc<dyn PersistenceApi>,
        channel: Arc<dyn RealtimeChannel>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            user_id,
            persistence,
            channel,
            inner: Mutex::new(SessionInner {
                conversation: None,
                store: MessageStore::new(),
                participants: Vec::new(),
                connection: ConnectionState::Disconnected,
                send_in_flight: false,
                draft: None,
                retry_scheduled: false,
                generation: 0,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Enters the conversation view: discards any previous store, rebuilds
    /// it from a full fetch and subscribes the channel.
    pub async fn open(
        self: &Arc<Self>,
        conversation: ConversationRecord,
    ) -> Result<(), SessionError> {
        info!(conversation_id = %conversation.id, "opening conversation");
        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.conversation = Some(conversation);
            inner.store = MessageStore::new();
            inner.participants.clear();
            inner.send_in_flight = false;
            inner.draft = None;
            inner.retry_scheduled = false;
            self.set_connection(&mut inner, ConnectionState::Disconnected);
            inner.generation
        };
        self.refresh(generation).await?;
        self.connect_channel(generation).await;
        Ok(())
    }

    /// Tears the view down. In-flight completions stamped with the old
    /// generation are dropped when they land.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.conversation = None;
            inner.store = MessageStore::new();
            inner.participants.clear();
            inner.send_in_flight = false;
            inner.draft = None;
            inner.retry_scheduled = false;
            self.set_connection(&mut inner, ConnectionState::Disconnected);
        }
        self.channel.unsubscribe().await;
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.store.snapshot()
    }

    pub async fn read_receipts(&self) -> Vec<ReadReceipt> {
        let inner = self.inner.lock().await;
        receipts::read_receipts(
            &inner.participants,
            Self::participant_count(&inner),
            &inner.store.snapshot(),
        )
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    /// Draft restored by the last failed send, if any. Taking it clears the
    /// slot.
    pub async fn take_draft(&self) -> Option<Draft> {
        self.inner.lock().await.draft.take()
    }

    /// Persists an edit, then applies it locally. A race with a concurrent
    /// delete is a no-op, not an error; the change-feed delete will clean up
    /// the local entry.
    pub async fn edit_message(&self, id: &MessageId, content: &str) -> Result<(), SessionError> {
        let generation = self.require_open().await?;
        match self.persistence.update_message(id, content).await {
            Ok(record) => {
                let mut inner = self.inner.lock().await;
                if inner.generation == generation {
                    let changed = inner.store.update_fields(
                        &record.id,
                        &record.content,
                        record.edited_at,
                        Some(record.created_at),
                    );
                    if changed {
                        self.emit_messages_changed(&inner);
                    }
                }
                Ok(())
            }
            Err(err) if persistence_not_found(&err) => Ok(()),
            Err(err) => Err(SessionError::Api(err)),
        }
    }

    /// Deletes durably, then removes the local entry. Idempotent and
    /// tolerant of the message already being gone.
    pub async fn delete_message(&self, id: &MessageId) -> Result<(), SessionError> {
        let generation = self.require_open().await?;
        match self.persistence.delete_message(id).await {
            Ok(()) => {}
            Err(err) if persistence_not_found(&err) => {}
            Err(err) => return Err(SessionError::Api(err)),
        }
        let mut inner = self.inner.lock().await;
        if inner.generation == generation && inner.store.remove(id) {
            self.emit_messages_changed(&inner);
        }
        Ok(())
    }

    /// Moves this user's read marker to now. Fire-and-forget side effect:
    /// the aggregator only ever observes the replicated participant state,
    /// never this local write.
    pub async fn mark_read(&self) -> Result<(), SessionError> {
        let conversation_id = {
            let inner = self.inner.lock().await;
            match &inner.conversation {
                Some(conversation) => conversation.id.clone(),
                None => return Err(SessionError::NotOpen),
            }
        };
        self.persistence
            .touch_last_read(&conversation_id, &self.user_id, Utc::now())
            .await?;
        Ok(())
    }

    /// Full re-fetch of committed state, merged through the reconciler so
    /// provisional entries survive and nothing duplicates.
    pub(crate) async fn refresh(&self, generation: u64) -> Result<(), SessionError> {
        let conversation_id = {
            let inner = self.inner.lock().await;
            if inner.generation != generation {
                return Ok(());
            }
            match &inner.conversation {
                Some(conversation) => conversation.id.clone(),
                None => return Err(SessionError::NotOpen),
            }
        };

        let messages = self.persistence.list_messages(&conversation_id).await?;
        let participants = self.persistence.list_participants(&conversation_id).await?;

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Ok(());
        }
        let outcome = reconcile::sync_snapshot(&mut inner.store, &self.user_id, messages);
        let participants_changed = inner.participants != participants;
        inner.participants = participants;
        if outcome.changed {
            self.emit_messages_changed(&inner);
        }
        if participants_changed || outcome.appended {
            self.emit_receipts(&inner);
        }
        Ok(())
    }

    /// Entry point for everything the channel delivers. Completions from a
    /// previous generation are dropped here.
    pub(crate) async fn apply_channel_event(&self, generation: u64, event: ChannelEvent) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.conversation.is_none() {
            return;
        }
        match event {
            ChannelEvent::ParticipantsChanged { participants } => {
                if inner.participants != participants {
                    inner.participants = participants;
                    self.emit_receipts(&inner);
                }
            }
            other => {
                let outcome = reconcile::apply(&mut inner.store, &self.user_id, other);
                if outcome.changed {
                    self.emit_messages_changed(&inner);
                }
                if outcome.appended {
                    self.emit_receipts(&inner);
                }
            }
        }
    }

    async fn require_open(&self) -> Result<u64, SessionError> {
        let inner = self.inner.lock().await;
        if inner.conversation.is_none() {
            return Err(SessionError::NotOpen);
        }
        Ok(inner.generation)
    }

    /// Denominator for "read by everyone": the participant set once fetched,
    /// the conversation record's derived count until then.
    fn participant_count(inner: &SessionInner) -> usize {
        if !inner.participants.is_empty() {
            inner.participants.len()
        } else {
            inner
                .conversation
                .as_ref()
                .map(|c| c.participant_count)
                .unwrap_or(0)
        }
    }

    pub(crate) fn emit_messages_changed(&self, inner: &SessionInner) {
        let _ = self.events.send(SessionEvent::MessagesChanged {
            messages: inner.store.snapshot(),
        });
    }

    pub(crate) fn emit_receipts(&self, inner: &SessionInner) {
        let receipts = receipts::read_receipts(
            &inner.participants,
            Self::participant_count(inner),
            &inner.store.snapshot(),
        );
        let _ = self
            .events
            .send(SessionEvent::ReadReceiptsChanged { receipts });
    }
}

/// A `not_found` rejection from the persistence API; races with concurrent
/// deletion collapse to no-ops through this check.
fn persistence_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<shared::error::ApiError>()
            .is_some_and(shared::error::ApiError::is_not_found)
    })
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
