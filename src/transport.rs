//! Transport seam between the hub and the network layer.
//!
//! The hub only needs three capabilities from a live session: send an
//! envelope, send a liveness probe and close with a status. Every call may
//! fail; the hub answers a failure by evicting the connection.
//!
//! [`ChannelTransport`] is an in-process implementation backed by a bounded
//! `tokio::sync::mpsc` channel. The network task owns the receiving half and
//! writes the [`Frame`]s it yields to the socket. A full channel is reported
//! as a failed send, so a consumer that stops draining is evicted instead of
//! buffering without bound.

use crate::error::{Error, Result};
use crate::Envelope;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Reason a connection is closed by the hub
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum CloseStatus {
    /// The hub is shutting down
    ServerShutdown,
    /// The peer did not answer a liveness probe
    Unresponsive,
    /// The peer produced no traffic within the stale threshold
    Stale,
    /// The same user was admitted on a newer connection
    Superseded,
    /// A send to the peer failed
    SendFailed,
}

impl CloseStatus {
    /// WebSocket-style close code
    pub fn code(&self) -> u16 {
        match self {
            CloseStatus::ServerShutdown => 1001,
            CloseStatus::Unresponsive => 4000,
            CloseStatus::Stale => 4001,
            CloseStatus::Superseded => 4002,
            CloseStatus::SendFailed => 4003,
        }
    }

    /// Human readable close reason
    pub fn reason(&self) -> &'static str {
        match self {
            CloseStatus::ServerShutdown => "server shutting down",
            CloseStatus::Unresponsive => "heartbeat timeout",
            CloseStatus::Stale => "connection idle",
            CloseStatus::Superseded => "replaced by newer connection",
            CloseStatus::SendFailed => "delivery failed",
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}

/// Send/probe/close capability of one live session.
///
/// Implementations must be cheap to call concurrently; the hub never holds a
/// lock while awaiting them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope to the peer
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Send a liveness probe. The peer's answer is reported separately
    /// through [`crate::InboundEvent::Pong`].
    async fn probe(&self) -> Result<()>;

    /// Close the session with the given status
    async fn close(&self, status: CloseStatus) -> Result<()>;
}

/// A frame yielded to the network task of a [`ChannelTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Envelope),
    Ping,
    Close(CloseStatus),
}

/// A transport that forwards frames to a bounded channel
pub struct ChannelTransport {
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl ChannelTransport {
    /// Create a transport and the receiver the network task drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn push(&self, frame: Frame) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(Error::TransportClosed)?;
        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Transport(
                "consumer is not keeping up, channel full".into(),
            )),
            Err(TrySendError::Closed(_)) => Err(Error::TransportClosed),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.push(Frame::Message(envelope.clone()))
    }

    async fn probe(&self) -> Result<()> {
        self.push(Frame::Ping)
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        let sender = self.sender.lock().take().ok_or(Error::TransportClosed)?;
        debug!(code = status.code(), reason = status.reason(), "Closing channel transport");
        // The close frame may be dropped when the consumer is gone; dropping
        // the sender still ends the receiver's stream.
        let _ = sender.try_send(Frame::Close(status));
        Ok(())
    }
}
