use thiserror::Error;

/// Rejections and failures of the optimistic send path. Everything here is
/// recoverable: the store is rolled back and the draft restored before a
/// `Persist` error is returned.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message has no text or attachments")]
    EmptyMessage,
    #[error("no conversation is open")]
    NoConversation,
    #[error("another send is already in flight")]
    AlreadyInFlight,
    #[error("failed to persist message: {0}")]
    Persist(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no conversation is open")]
    NotOpen,
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}
