//! Transport adapters.
//!
//! A `Transport` serializes a [`Message`] envelope and writes it as a
//! single framed message. Every implementation serializes writes under
//! a `tokio::sync::Mutex` so concurrent callers never interleave bytes
//! on the underlying sink (invariant H1).

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::MaybeTlsStream;

use crate::error::{Error, Result};
use crate::hub::message::Message;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Broker-side transport: an `axum` websocket connection accepted via
/// `WebSocketUpgrade`.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<WebSocket, AxumMessage>>,
}

impl WebSocketTransport {
    pub fn new(sink: SplitSink<WebSocket, AxumMessage>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut sink = self.sink.lock().await;
        sink.send(AxumMessage::Text(text))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

type TungsteniteStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Service-side transport: a `tokio-tungstenite` connection dialed via
/// `connect_async`.
pub struct ClientWebSocketTransport {
    sink: Mutex<SplitSink<TungsteniteStream, TungsteniteMessage>>,
}

impl ClientWebSocketTransport {
    pub fn new(sink: SplitSink<TungsteniteStream, TungsteniteMessage>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl ClientWebSocketTransport {
    /// Sends a raw websocket close frame, bypassing the hub envelope —
    /// used by the service process's interrupt handler (`SPEC_FULL.md`
    /// §5), which must close the transport itself, not send a message
    /// through it.
    pub async fn send_close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(TungsteniteMessage::Close(None))
            .await
            .map_err(Error::from)
    }
}

#[async_trait]
impl Transport for ClientWebSocketTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut sink = self.sink.lock().await;
        sink.send(TungsteniteMessage::Text(text))
            .await
            .map_err(Error::from)
    }
}

/// Peer-side transport: a WebRTC data channel, queued until it opens.
///
/// Breaks the peer-wrapper/hub ownership cycle per the design notes: this
/// struct holds only the data channel handle and the pending-write queue,
/// never a reference back to the peer wrapper itself.
pub struct DataChannelTransport {
    inner: Mutex<DataChannelTransportState>,
}

struct DataChannelTransportState {
    channel: Option<Arc<webrtc::data_channel::RTCDataChannel>>,
    queue: Vec<String>,
}

impl DataChannelTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DataChannelTransportState {
                channel: None,
                queue: Vec::new(),
            }),
        }
    }

    /// Called from the data channel's `on_open` handler: binds the channel
    /// and flushes anything queued before it opened, in FIFO order.
    pub async fn open(&self, channel: Arc<webrtc::data_channel::RTCDataChannel>) {
        let mut state = self.inner.lock().await;
        let queued = std::mem::take(&mut state.queue);
        for text in queued {
            let _ = channel.send_text(text).await;
        }
        state.channel = Some(channel);
    }
}

impl Default for DataChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for DataChannelTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut state = self.inner.lock().await;
        match &state.channel {
            Some(channel) => channel
                .send_text(text)
                .await
                .map(|_| ())
                .map_err(Error::from),
            None => {
                state.queue.push(text);
                Ok(())
            }
        }
    }
}
