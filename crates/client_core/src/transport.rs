use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::ConversationId,
    protocol::{ChannelEvent, SubscriptionStatus},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::warn;
use url::Url;

/// Bidirectional real-time channel for one conversation: the two inbound
/// feeds (ephemeral broadcast, durable change-feed) arrive through
/// `subscribe`, and the sender-side broadcast leaves through `publish`.
///
/// Implementations report health through the status sender; they do not
/// retry on their own, that is the session's connection manager's job.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn subscribe(
        &self,
        conversation_id: ConversationId,
        events: mpsc::Sender<ChannelEvent>,
        status: mpsc::Sender<SubscriptionStatus>,
    ) -> Result<()>;

    /// Best-effort fan-out to the other subscribed clients. Failures are a
    /// latency concern only; correctness rides on the change-feed.
    async fn publish(&self, event: ChannelEvent) -> Result<()>;

    async fn unsubscribe(&self);
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// `RealtimeChannel` over a websocket speaking JSON-encoded `ChannelEvent`
/// frames.
pub struct WsChannel {
    server_url: String,
    writer: Mutex<Option<WsSink>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    fn endpoint(&self, conversation_id: &ConversationId) -> Result<Url> {
        let ws_url = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let mut url = Url::parse(&ws_url).context("invalid server url")?;
        url.set_path("/ws");
        url.query_pairs_mut()
            .append_pair("conversation_id", conversation_id.as_str());
        Ok(url)
    }
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    async fn subscribe(
        &self,
        conversation_id: ConversationId,
        events: mpsc::Sender<ChannelEvent>,
        status: mpsc::Sender<SubscriptionStatus>,
    ) -> Result<()> {
        // A resubscribe replaces any previous stream.
        self.unsubscribe().await;

        let url = self.endpoint(&conversation_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (ws_writer, mut ws_reader) = ws_stream.split();

        *self.writer.lock().await = Some(ws_writer);
        let _ = status.send(SubscriptionStatus::Subscribed).await;

        let task = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ChannelEvent>(&text) {
                            Ok(event) => {
                                if events.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "discarding malformed channel frame");
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        let _ = status
                            .send(SubscriptionStatus::Error {
                                reason: "channel closed by server".to_string(),
                            })
                            .await;
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = status
                            .send(SubscriptionStatus::Error {
                                reason: format!("websocket receive failed: {err}"),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = status
                .send(SubscriptionStatus::Error {
                    reason: "channel stream ended".to_string(),
                })
                .await;
        });
        *self.reader_task.lock().await = Some(task);

        Ok(())
    }

    async fn publish(&self, event: ChannelEvent) -> Result<()> {
        let frame = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| anyhow!("cannot publish: channel is not subscribed"))?;
        sink.send(WsMessage::Text(frame))
            .await
            .context("failed to publish on channel")
    }

    async fn unsubscribe(&self) {
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
