//! ZeroMQ-compatible REP socket over TCP.
//!
//! Accepts any number of REQ peers (turbine controllers) and presents their
//! requests to the server one at a time, in arrival order.

use std::collections::BTreeMap;
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, unbounded};
use tracing::{debug, info, warn};

use wfc_shared::zmtp::{parse_tcp_endpoint, write_multipart};

use crate::error::TransportError;

use super::worker::{AcceptorHandle, PeerEvent, PeerTable, lock};
use super::{PeerToken, Request, Transport};

/// REP socket bound to a `tcp://host:port` endpoint.
/// A `*` host binds every interface.
pub struct ZmtpRepSocket {
    endpoint: String,
    local_addr: Option<SocketAddr>,
    peers: PeerTable,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<AcceptorHandle>,
    event_rx: Option<Receiver<PeerEvent>>,

    /// Routing envelope of each peer's outstanding request
    pending: BTreeMap<PeerToken, Vec<Vec<u8>>>,
}

impl ZmtpRepSocket {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            local_addr: None,
            peers: Arc::new(Mutex::new(BTreeMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            acceptor: None,
            event_rx: None,
            pending: BTreeMap::new(),
        }
    }

    /// Address the listener is bound to, once open.
    /// Useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of peers that have completed their handshake
    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }
}

impl Transport for ZmtpRepSocket {
    fn is_open(&self) -> bool {
        self.acceptor.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.acceptor.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let addr = parse_tcp_endpoint(&self.endpoint, "0.0.0.0")?;
        let listener = TcpListener::bind(&addr)?;
        let local_addr = listener.local_addr()?;

        let (event_tx, event_rx) = unbounded();
        self.shutdown = Arc::new(AtomicBool::new(false));
        let acceptor = AcceptorHandle::spawn(
            listener,
            self.peers.clone(),
            event_tx,
            self.shutdown.clone(),
        )?;

        self.local_addr = Some(local_addr);
        self.event_rx = Some(event_rx);
        self.acceptor = Some(acceptor);
        info!("Listening for turbines on {} ({local_addr})", &self.endpoint);
        Ok(())
    }

    fn close(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };

        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = acceptor.join() {
            warn!("{e}");
        }

        self.event_rx = None;
        self.pending.clear();
        self.local_addr = None;
        info!("Closed socket on {}", &self.endpoint);
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Request>, TransportError> {
        let event_rx = self.event_rx.as_ref().ok_or(TransportError::NotOpen)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = match event_rx.recv_timeout(remaining) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Worker(
                        "Acceptor exited while the socket was open".to_owned(),
                    ));
                }
            };

            match event {
                PeerEvent::Request {
                    peer,
                    time,
                    envelope,
                    body,
                } => {
                    if self.pending.contains_key(&peer) {
                        // REQ peers can't do this; skip rather than fail every turbine
                        warn!("Ignoring request from peer {peer} before its last reply");
                        continue;
                    }
                    self.pending.insert(peer, envelope);
                    return Ok(Some(Request {
                        peer,
                        time,
                        payload: body,
                    }));
                }
                PeerEvent::Error { peer, error } => debug!("Peer {peer} failed: {error}"),
                PeerEvent::Closed { peer } => debug!("Peer {peer} closed"),
            }
        }
    }

    fn reply(&mut self, peer: PeerToken, msg: &[u8]) -> Result<(), TransportError> {
        if self.acceptor.is_none() {
            return Err(TransportError::NotOpen);
        }
        let envelope = self
            .pending
            .remove(&peer)
            .ok_or(TransportError::NoPendingRequest(peer))?;

        let Some(writer) = lock(&self.peers).get(&peer).cloned() else {
            warn!("Dropping reply to peer {peer}, which has disconnected");
            return Ok(());
        };

        let mut parts: Vec<&[u8]> = envelope.iter().map(Vec::as_slice).collect();
        parts.push(msg);

        let mut stream = lock(&writer);
        if let Err(e) = write_multipart(&mut *stream, &parts) {
            warn!("Dropping peer {peer} after failed reply: {e}");
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn address(&self) -> String {
        self.endpoint.clone()
    }
}

impl Drop for ZmtpRepSocket {
    fn drop(&mut self) {
        self.close();
    }
}
