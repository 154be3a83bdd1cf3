use std::sync::Arc;

use shared::{
    domain::MessageId,
    protocol::{ChannelEvent, NewMessageRequest},
};
use tracing::warn;

use crate::{error::SendError, store::Message, ChatSession, SessionEvent};

/// Composed-but-unsent input. Restored to the session's draft slot when a
/// send fails, so nothing the user typed is lost.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub text: String,
    pub attachments: Vec<String>,
    pub reply_to: Option<MessageId>,
}

impl ChatSession {
    /// Optimistic send: the provisional entry is visible in the store before
    /// the persist request is issued, and exactly one representation of the
    /// message survives confirmation regardless of how the change-feed echo
    /// interleaves.
    ///
    /// Single-flight per session: a second call while one is awaiting its
    /// persist response is rejected outright.
    pub async fn send_message(
        self: &Arc<Self>,
        text: &str,
        attachments: Vec<String>,
        reply_to: Option<MessageId>,
    ) -> Result<(), SendError> {
        let (provisional_id, request, generation) = {
            let mut inner = self.inner.lock().await;
            let conversation_id = match &inner.conversation {
                Some(conversation) => conversation.id.clone(),
                None => return Err(SendError::NoConversation),
            };
            if text.trim().is_empty() && attachments.is_empty() {
                return Err(SendError::EmptyMessage);
            }
            if inner.send_in_flight {
                return Err(SendError::AlreadyInFlight);
            }

            let message = Message::provisional(
                conversation_id.clone(),
                self.user_id.clone(),
                text,
                attachments.clone(),
                reply_to.clone(),
            );
            let request = NewMessageRequest {
                conversation_id,
                sender_id: self.user_id.clone(),
                content: message.content.clone(),
                reply_to_id: reply_to.clone(),
                attachments: attachments.clone(),
            };
            let provisional_id = message.id.clone();

            inner.send_in_flight = true;
            inner.store.insert(message);
            self.emit_messages_changed(&inner);
            self.emit_receipts(&inner);
            (provisional_id, request, inner.generation)
        };

        match self.persistence.insert_message(request).await {
            Ok(record) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.send_in_flight = false;
                    if inner.generation == generation {
                        // Any change-feed echo that raced us was discarded
                        // against the provisional entry; this swap is the one
                        // authoritative reconciliation.
                        inner
                            .store
                            .replace(&provisional_id, Message::from_record(record.clone()));
                        self.emit_messages_changed(&inner);
                        self.emit_receipts(&inner);
                    }
                }
                // Fast path for the other participants. Best-effort: their
                // change-feed delivers the message either way.
                if let Err(err) = self
                    .channel
                    .publish(ChannelEvent::Broadcast { message: record })
                    .await
                {
                    warn!(error = %err, "broadcast publish failed, change-feed will cover it");
                }
                Ok(())
            }
            Err(err) => {
                let draft = Draft {
                    text: text.to_string(),
                    attachments,
                    reply_to,
                };
                {
                    let mut inner = self.inner.lock().await;
                    inner.send_in_flight = false;
                    if inner.generation == generation {
                        inner.store.remove(&provisional_id);
                        inner.draft = Some(draft.clone());
                        self.emit_messages_changed(&inner);
                        let _ = self.events.send(SessionEvent::SendFailed {
                            draft,
                            reason: err.to_string(),
                        });
                    }
                }
                Err(SendError::Persist(err))
            }
        }
    }
}
