//! Transport abstraction.
//!
//! A [`Connector`] opens one transport and hands back a channel pair. The
//! connection actor never touches sockets directly, so tests can script
//! transports without a server.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::errors::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 256;

/// One inbound item from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportFrame {
    /// A text message.
    Text(String),
    /// The transport closed. Always the last frame.
    Closed {
        /// Close reason or error text, if any.
        reason: Option<String>,
    },
}

/// An open transport.
///
/// Dropping `outbound` closes the transport.
#[derive(Debug)]
pub struct TransportChannels {
    /// Text frames to write.
    pub outbound: mpsc::Sender<String>,
    /// Frames read, ending with [`TransportFrame::Closed`].
    pub inbound: mpsc::Receiver<TransportFrame>,
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport.
    async fn open(&self) -> Result<TransportChannels, TransportError>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Connector for `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<TransportChannels, TransportError> {
        let (ws, _response) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(self.url.as_str()))
                .await
                .map_err(|_| TransportError::Connect(format!("timed out after {CONNECT_TIMEOUT:?}")))?
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, "websocket open");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let _pump = tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                warn!(error = %e, "websocket write failed");
                                break Some(e.to_string());
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break None;
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(TransportFrame::Text(text.as_str().to_owned())).await.is_err() {
                                break None;
                            }
                        }
                        Some(Ok(Message::Close(close))) => {
                            break close.map(|c| c.reason.as_str().to_owned()).filter(|r| !r.is_empty());
                        }
                        Some(Ok(other)) => trace!(kind = ?message_kind(&other), "ignoring non-text frame"),
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    },
                }
            };
            debug!(reason = ?reason, "websocket closed");
            let _ = in_tx.send(TransportFrame::Closed { reason }).await;
        });

        Ok(TransportChannels {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn message_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
