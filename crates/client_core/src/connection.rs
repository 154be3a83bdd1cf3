use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use shared::protocol::SubscriptionStatus;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{ChatSession, SessionEvent, SessionInner};

/// Fixed retry delay. Repeated failures keep retrying on the same cadence;
/// there is never more than one retry scheduled at a time.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Lifecycle of the conversation's real-time channel. `Disconnected` is both
/// the initial state and the terminal state after teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Error,
    Reconnecting,
}

impl ChatSession {
    pub(crate) fn set_connection(&self, inner: &mut SessionInner, state: ConnectionState) {
        if inner.connection != state {
            inner.connection = state;
            let _ = self.events.send(SessionEvent::ConnectionChanged(state));
        }
    }

    // Returns a boxed future (rather than being an `async fn`) to break the
    // `connect_channel` -> `handle_channel_error` -> `connect_channel`
    // auto-trait inference cycle that otherwise prevents `tokio::spawn`.
    pub(crate) fn connect_channel(self: &Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let conversation_id = {
                let mut inner = this.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                let Some(id) = inner.conversation.as_ref().map(|c| c.id.clone()) else {
                    return;
                };
                this.set_connection(&mut inner, ConnectionState::Connecting);
                id
            };

            let (events_tx, mut events_rx) = mpsc::channel(256);
            let (status_tx, mut status_rx) = mpsc::channel(16);

            if let Err(err) = this
                .channel
                .subscribe(conversation_id, events_tx, status_tx)
                .await
            {
                warn!(error = %err, "channel subscribe failed");
                this.handle_channel_error(generation).await;
                return;
            }

            let session = Arc::clone(&this);
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    session.apply_channel_event(generation, event).await;
                }
            });

            let session = Arc::clone(&this);
            tokio::spawn(async move {
                while let Some(status) = status_rx.recv().await {
                    match status {
                        SubscriptionStatus::Subscribed => {
                            session.handle_subscribed(generation).await;
                        }
                        SubscriptionStatus::Error { reason } => {
                            warn!(reason, "channel subscription error");
                            session.handle_channel_error(generation).await;
                        }
                    }
                }
            });
        })
    }

    async fn handle_subscribed(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            self.set_connection(&mut inner, ConnectionState::Subscribed);
        }
        info!("channel subscribed, replaying committed state");
        // The broadcast path has no replay; re-fetching committed state on
        // every (re)subscribe is what makes the durable path lossless.
        if let Err(err) = self.refresh(generation).await {
            warn!(error = %err, "post-subscribe refresh failed");
        }
    }

    /// Soft-fails the channel and schedules a single reconnect attempt after
    /// `RECONNECT_DELAY`. Never surfaces an error to the caller; correctness
    /// is covered by the refresh on resubscribe.
    pub(crate) async fn handle_channel_error(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            self.set_connection(&mut inner, ConnectionState::Error);
            if inner.retry_scheduled {
                return;
            }
            inner.retry_scheduled = true;
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut inner = session.inner.lock().await;
                if inner.generation != generation {
                    inner.retry_scheduled = false;
                    return;
                }
                session.set_connection(&mut inner, ConnectionState::Reconnecting);
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
            {
                let mut inner = session.inner.lock().await;
                inner.retry_scheduled = false;
                if inner.generation != generation {
                    return;
                }
            }
            session.connect_channel(generation).await;
        });
    }
}
