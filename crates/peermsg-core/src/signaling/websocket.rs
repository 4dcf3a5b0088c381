//! WebSocket relay client

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{PeerError, PeerResult};
use crate::relay::{RelayConnector, RelayLink};

/// Connects to a `peermsg-relay` (or compatible) server at `<url>?room=<id>`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Relay base URL, e.g. `ws://127.0.0.1:8787`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The URL used to join `room`
    pub fn room_url(&self, room: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}room={}", self.url.trim_end_matches('/'), separator, room)
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self, room: &str) -> PeerResult<RelayLink> {
        let url = self.room_url(room);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| PeerError::Relay(format!("{}: {}", url, e)))?;
        let (mut sink, mut stream) = ws.split();

        let (outgoing, mut from_client) = mpsc::unbounded_channel::<String>();
        let (to_client, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = from_client.recv() => {
                        let Some(frame) = frame else { break };
                        if sink.send(Message::text(frame)).await.is_err() {
                            break;
                        }
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if to_client.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "Relay socket error");
                            break;
                        }
                    },
                }
            }
            let _ = sink.close().await;
        });

        Ok(RelayLink { outgoing, incoming })
    }
}
