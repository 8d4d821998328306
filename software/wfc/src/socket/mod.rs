//! Request/reply transports that carry turbine messages to the server.
//!
//! A transport delivers one request at a time along with an opaque token for
//! the peer that sent it. Every request must be answered with exactly one
//! reply to the same token before that peer's next request is delivered.

pub mod channel;
pub mod worker;
pub mod zmtp;

use std::time::{Duration, Instant};

use crate::error::TransportError;

/// Opaque token for a transport-specific peer seen by recv().
pub type PeerToken = u64;

pub use channel::{ChannelClient, ChannelTransport};
pub use zmtp::ZmtpRepSocket;

/// A single request awaiting a reply
#[derive(Clone, Debug)]
pub struct Request {
    /// Peer to reply to
    pub peer: PeerToken,

    /// When the request was received by the transport
    pub time: Instant,

    /// Message body with any routing envelope removed
    pub payload: Vec<u8>,
}

impl Request {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Request/reply message transport
pub trait Transport: Send {
    /// Check whether the transport is already open
    fn is_open(&self) -> bool;

    /// Do any required stateful one-time setup, like binding the listening address
    fn open(&mut self) -> Result<(), TransportError>;

    /// Clear state and release the listening address. Closing twice is a no-op.
    fn close(&mut self);

    /// Wait up to `timeout` for the next request.
    /// Returns `Ok(None)` if nothing arrived in time.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Request>, TransportError>;

    /// Answer the outstanding request from `peer`
    fn reply(&mut self, peer: PeerToken, msg: &[u8]) -> Result<(), TransportError>;

    /// Human-readable address for diagnostics
    fn address(&self) -> String;
}
