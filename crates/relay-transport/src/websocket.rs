//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`FrameSource`] /
//! [`FrameSink`] pair. Text and binary messages are both decoded as JSON.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, ClientFrame, Envelope};
use tracing::{debug, trace};

use crate::traits::{FrameSink, FrameSource, TransportError};

/// Default maximum inbound message size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Split an upgraded socket into its outbound and inbound halves.
#[must_use]
pub fn split(
    socket: WebSocket,
    max_message_size: usize,
    remote_addr: Option<String>,
) -> (WebSocketSink, WebSocketSource) {
    let (sink, stream) = socket.split();
    (
        WebSocketSink { sink, open: true },
        WebSocketSource {
            stream,
            max_message_size,
            remote_addr,
        },
    )
}

/// Inbound half of a WebSocket.
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
    remote_addr: Option<String>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame = codec::decode_limited(text.as_bytes(), self.max_message_size)?;
                    return Ok(Some(frame));
                }
                Some(Ok(Message::Binary(data))) => {
                    let frame = codec::decode_limited(&data, self.max_message_size)?;
                    return Ok(Some(frame));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pings are answered by the socket itself.
                    trace!("Control frame");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

/// Outbound half of a WebSocket.
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    open: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        let text = codec::encode(envelope)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}
