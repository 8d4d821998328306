//! In-process transport backed by crossbeam channels.
//!
//! Clients live on other threads of the same process and are mostly useful
//! for driving the server from tests without a network.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{info, warn};

use crate::error::TransportError;

use super::{PeerToken, Request, Transport};

/// A request in flight along with the route back to its client
struct Envelope {
    peer: PeerToken,
    payload: Vec<u8>,
    reply_tx: Sender<Vec<u8>>,
}

/// Transport that receives requests from `ChannelClient`s in the same process.
pub struct ChannelTransport {
    name: String,
    open: bool,
    next_peer: AtomicU64,
    req_tx: Sender<Envelope>,
    req_rx: Receiver<Envelope>,
    pending: BTreeMap<PeerToken, Sender<Vec<u8>>>,
}

impl ChannelTransport {
    pub fn new(name: &str) -> Self {
        let (req_tx, req_rx) = unbounded();
        Self {
            name: name.to_owned(),
            open: false,
            next_peer: AtomicU64::new(1),
            req_tx,
            req_rx,
            pending: BTreeMap::new(),
        }
    }

    /// Channel name used in diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make a new client with its own peer token.
    /// Clients may be made and may send before the transport is opened;
    /// their requests are queued.
    pub fn client(&self) -> ChannelClient {
        let (reply_tx, reply_rx) = unbounded();
        ChannelClient {
            peer: self.next_peer.fetch_add(1, Ordering::Relaxed),
            req_tx: self.req_tx.clone(),
            reply_tx,
            reply_rx,
        }
    }
}

impl Transport for ChannelTransport {
    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.open {
            return Err(TransportError::AlreadyOpen);
        }
        self.open = true;
        info!("Opened channel transport {}", &self.name);
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.pending.clear();
        // Drop anything queued so late requests are not served on reopen
        while self.req_rx.try_recv().is_ok() {}
        info!("Closed channel transport {}", &self.name);
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Request>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let envelope = match self.req_rx.recv_timeout(remaining) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Worker(format!(
                        "Request channel {} disconnected",
                        &self.name
                    )));
                }
            };

            let Envelope {
                peer,
                payload,
                reply_tx,
            } = envelope;
            if self.pending.contains_key(&peer) {
                // Same policy as the TCP socket: the earlier request keeps its reply
                warn!("Ignoring request from peer {peer} before its last reply");
                continue;
            }
            self.pending.insert(peer, reply_tx);

            return Ok(Some(Request {
                peer,
                time: Instant::now(),
                payload,
            }));
        }
    }

    fn reply(&mut self, peer: PeerToken, msg: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let reply_tx = self
            .pending
            .remove(&peer)
            .ok_or(TransportError::NoPendingRequest(peer))?;
        if reply_tx.send(msg.to_vec()).is_err() {
            warn!("Dropping reply to peer {peer}, which has gone away");
        }
        Ok(())
    }

    fn address(&self) -> String {
        format!("channel://{}", &self.name)
    }
}

/// Client half of a `ChannelTransport`
pub struct ChannelClient {
    peer: PeerToken,
    req_tx: Sender<Envelope>,
    reply_tx: Sender<Vec<u8>>,
    reply_rx: Receiver<Vec<u8>>,
}

impl ChannelClient {
    /// Token the transport reports for this client's requests
    pub fn peer(&self) -> PeerToken {
        self.peer
    }

    /// Queue a request
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.req_tx
            .send(Envelope {
                peer: self.peer,
                payload: payload.to_vec(),
                reply_tx: self.reply_tx.clone(),
            })
            .map_err(|_| TransportError::Worker("Transport has been dropped".to_owned()))
    }

    /// Wait up to `timeout` for the reply to the last request
    pub fn recv_reply(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.reply_rx.recv_timeout(timeout).ok()
    }

    /// Send a request and wait for its reply
    pub fn request(&self, payload: &[u8], timeout: Duration) -> Option<Vec<u8>> {
        self.send(payload).ok()?;
        self.recv_reply(timeout)
    }
}
