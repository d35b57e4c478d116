//! In-memory transport.
//!
//! [`connection`] returns a source/sink pair wired to a [`MemoryClient`] that
//! plays the remote peer: it feeds raw text frames in, reads envelopes out,
//! and can inject read or write failures.

use async_trait::async_trait;
use relay_protocol::{codec, ClientFrame, Envelope};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, TransportError};

enum Inbound {
    Text(String),
    Error(String),
}

#[derive(Debug, Default)]
struct SinkState {
    closes: AtomicUsize,
    fail_writes: AtomicBool,
}

/// Create an in-memory connection.
#[must_use]
pub fn connection() -> (MemoryClient, MemorySource, MemorySink) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let state = Arc::new(SinkState::default());

    let client = MemoryClient {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
        state: Arc::clone(&state),
    };
    let source = MemorySource { inbound: inbound_rx };
    let sink = MemorySink {
        outbound: outbound_tx,
        state,
        open: true,
    };
    (client, source, sink)
}

/// The remote end of an in-memory connection.
pub struct MemoryClient {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    state: Arc<SinkState>,
}

impl MemoryClient {
    /// Send a raw text frame. Returns `false` once hung up or the source is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(Inbound::Text(text.into()))
    }

    /// Make the next read fail with a transport error.
    pub fn send_error(&self, reason: impl Into<String>) -> bool {
        self.push(Inbound::Error(reason.into()))
    }

    fn push(&self, item: Inbound) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }

    /// Close the inbound direction cleanly.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Make every further write fail.
    pub fn fail_writes(&self) {
        self.state.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Wait for the next envelope written by the server.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.outbound.recv().await
    }

    /// Take an envelope if one has been written.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.outbound.try_recv().ok()
    }

    /// How many times the server closed the transport.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

/// Inbound half of an in-memory connection.
pub struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError> {
        match self.inbound.recv().await {
            Some(Inbound::Text(text)) => Ok(Some(codec::decode(text.as_bytes())?)),
            Some(Inbound::Error(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// Outbound half of an in-memory connection.
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<Envelope>,
    state: Arc<SinkState>,
    open: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("write failure injected".into()));
        }
        self.outbound
            .send(envelope.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.open = false;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
