//! Socket transport seam.
//!
//! A [`RelayConnection`](crate::RelayConnection) only speaks text frames
//! through these traits. [`WebSocketTransport`] is the tokio-tungstenite
//! implementation used in production; tests plug in an in-memory one.

use crate::error::{ClientError, Result};
use crate::relay_url::RelayUrl;
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::debug;

/// Something read from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame
    Text(String),
    /// Orderly close, with the peer's reason if it gave one
    Closed(Option<String>),
    /// The transport failed; no further events follow
    Error(String),
}

/// Write half of an open transport.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self);
}

/// An established transport session.
pub struct TransportConnection {
    pub sink: Box<dyn TransportSink>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transport sessions to relays.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &RelayUrl) -> Result<TransportConnection>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &RelayUrl) -> Result<TransportConnection> {
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (write, mut read) = ws.split();
        let (tx, inbound) = mpsc::unbounded_channel();
        let relay = url.clone();

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Text(text.as_str().to_owned()),
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_owned())
                            .filter(|r| !r.is_empty());
                        let _ = tx.send(TransportEvent::Closed(reason));
                        return;
                    }
                    // Pongs are queued by tungstenite and flushed on read.
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                if tx.send(event).is_err() {
                    debug!("Reader for {} dropped", relay);
                    return;
                }
            }
            let _ = tx.send(TransportEvent::Closed(None));
        });

        Ok(TransportConnection {
            sink: Box::new(WebSocketSink { write, reader }),
            inbound,
        })
    }
}

struct WebSocketSink {
    write: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.write.close().await;
        self.reader.abort();
    }
}

impl Drop for WebSocketSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
