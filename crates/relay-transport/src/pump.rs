//! Per-connection read and write pumps.
//!
//! The read pump turns inbound frames into stamped envelopes for the hub and
//! unregisters the connection when it stops. The write pump is the only
//! writer of the transport: it drains the outbound queue in order and closes
//! the transport once the hub closes the queue or a write fails. A write that
//! does not finish within the write timeout counts as failed.

use futures_util::future::{select, Either};
use relay_core::{ConnectionKey, HubError, HubHandle, OutboundQueue, UserId};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::traits::{FrameSink, FrameSource, TransportError};

/// Default upper bound on a single write to the peer.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a read pump stopped.
#[derive(Debug)]
pub enum ReadEnd {
    /// The peer closed the connection.
    RemoteClosed,
    /// A read or decode failed.
    Failed(TransportError),
    /// The hub is no longer running.
    HubClosed,
    /// The write side ended first and reading was abandoned.
    WriterClosed,
}

/// Why a write pump stopped.
#[derive(Debug)]
pub enum WriteEnd {
    /// The hub closed the queue and everything queued was written.
    QueueClosed,
    /// A write failed.
    Failed(TransportError),
}

/// How a served connection ended.
#[derive(Debug)]
pub struct ConnectionSummary {
    /// The connection that was served.
    pub key: ConnectionKey,
    /// Read side outcome.
    pub read: ReadEnd,
    /// Write side outcome, `None` if the write task panicked.
    pub write: Option<WriteEnd>,
}

/// Forward inbound frames to the hub until the source ends, then request
/// unregistration of `key`.
///
/// Every frame's sender is replaced with `key.user_id`.
pub async fn read_pump<S>(mut source: S, hub: &HubHandle, key: &ConnectionKey) -> ReadEnd
where
    S: FrameSource,
{
    let end = loop {
        match source.recv().await {
            Ok(Some(frame)) => {
                let envelope = frame.stamp(key.user_id.as_str());
                if hub.route(envelope).await.is_err() {
                    break ReadEnd::HubClosed;
                }
            }
            Ok(None) => break ReadEnd::RemoteClosed,
            Err(e) => {
                debug!(connection = %key, error = %e, "Read pump error");
                break ReadEnd::Failed(e);
            }
        }
    };

    if hub.unregister(key.clone()).await.is_err() {
        debug!(connection = %key, "Hub gone before unregister");
    }
    end
}

/// Write queued envelopes in order until the queue closes or a write fails,
/// then close the sink.
///
/// Each write, and the final close, may take at most `write_timeout`.
pub async fn write_pump<K>(mut queue: OutboundQueue, mut sink: K, write_timeout: Duration) -> WriteEnd
where
    K: FrameSink,
{
    let end = loop {
        let Some(envelope) = queue.recv().await else {
            break WriteEnd::QueueClosed;
        };
        match timeout(write_timeout, sink.send(&envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Write pump error");
                break WriteEnd::Failed(e);
            }
            Err(_) => {
                warn!(timeout = ?write_timeout, "Peer stopped reading, dropping connection");
                break WriteEnd::Failed(TransportError::WriteTimeout(write_timeout));
            }
        }
    };

    // Dropping the queue here marks the connection dead for the hub.
    drop(queue);
    match timeout(write_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Failed to close transport"),
        Err(_) => debug!("Timed out closing transport"),
    }
    end
}

/// Register a connection for `user_id`, run both pumps, and return once the
/// connection is fully torn down.
///
/// If the write pump stops first, the read pump is dropped along with the
/// source and the connection is unregistered.
///
/// # Errors
///
/// Returns [`HubError::Closed`] if the hub is not running; the sink is
/// closed in that case.
pub async fn serve_connection<S, K>(
    hub: HubHandle,
    user_id: impl Into<UserId>,
    source: S,
    mut sink: K,
    write_timeout: Duration,
) -> Result<ConnectionSummary, HubError>
where
    S: FrameSource,
    K: FrameSink + 'static,
{
    let peer = source.remote_addr().unwrap_or_else(|| "unknown".to_string());

    let (key, queue) = match hub.connect(user_id).await {
        Ok(registered) => registered,
        Err(e) => {
            let _ = sink.close().await;
            return Err(e);
        }
    };
    info!(connection = %key, peer = %peer, "Connection opened");

    let writer = tokio::spawn(write_pump(queue, sink, write_timeout));
    let reader = Box::pin(read_pump(source, &hub, &key));

    let (read, joined) = match select(reader, writer).await {
        Either::Left((read, writer)) => (read, writer.await),
        Either::Right((joined, reader)) => {
            drop(reader);
            if hub.unregister(key.clone()).await.is_err() {
                debug!(connection = %key, "Hub gone before unregister");
            }
            (ReadEnd::WriterClosed, joined)
        }
    };

    let write = match joined {
        Ok(end) => Some(end),
        Err(e) => {
            warn!(connection = %key, error = %e, "Write pump task failed");
            None
        }
    };

    info!(connection = %key, read = ?read, write = ?write, "Connection closed");
    Ok(ConnectionSummary { key, read, write })
}
