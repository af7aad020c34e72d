//! Socket transport for the signaling connection.
//!
//! The transport's only job is to move typed frames: it opens the socket,
//! pumps [`ClientEvent`]s out and [`ServerEvent`]s in, and synthesizes a
//! `Disconnected` event when the socket dies. Everything stateful lives in
//! the connection manager.

use crate::error::Result;
use crate::wire::{ClientEvent, ServerEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// A live socket, seen as a pair of typed channels. Dropping the outbound
/// sender closes the socket.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransportLink>;
}

/// Production transport over tokio-tungstenite.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

        // Writer pump: drains the outbound channel, closes the socket when
        // the channel closes.
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Dropping unserializable frame: {}", e);
                        continue;
                    }
                };
                if write.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
        });

        // Reader pump: decodes frames, synthesizes Disconnected exactly once
        // when the socket goes away.
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if in_tx.send(event).is_err() {
                                    return;
                                }
                            }
                            Err(e) => log::debug!("Ignoring unknown frame: {}", e),
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            let _ = in_tx.send(ServerEvent::Disconnected);
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
