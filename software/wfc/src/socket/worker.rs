//! Connection workers for the ZMTP REP socket.
//!
//! An acceptor thread owns the listener and hands each new connection to a
//! reader thread of its own. Reader threads complete the handshake, register
//! a writer in the shared peer table, and forward complete requests to the
//! socket as events. Replies are written from the server thread through the
//! peer table, so readers never block writers.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

use wfc_shared::zmtp::{
    Incoming, SocketType, ZmtpError, handshake, read_incoming, split_envelope, write_pong,
};

use super::PeerToken;

/// Interval at which the acceptor polls the listener and the shutdown flag
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest time a new connection may take to complete its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Writer half of every connected peer
pub type PeerTable = Arc<Mutex<BTreeMap<PeerToken, Arc<Mutex<TcpStream>>>>>;

/// Lock a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Events emitted by peer readers to the socket.
pub enum PeerEvent {
    /// A complete request, split into its routing envelope and body
    Request {
        peer: PeerToken,
        time: Instant,
        envelope: Vec<Vec<u8>>,
        body: Vec<u8>,
    },
    /// Error from a peer's I/O path. The peer is dropped.
    Error { peer: PeerToken, error: String },
    /// Peer has disconnected and its reader is exiting.
    Closed { peer: PeerToken },
}

/// Join handle for a running acceptor
pub struct AcceptorHandle {
    thread: JoinHandle<()>,
}

impl AcceptorHandle {
    /// Spin up an acceptor on its own thread.
    /// The acceptor and every reader it spawned exit once `shutdown` is set.
    pub fn spawn(
        listener: TcpListener,
        peers: PeerTable,
        event_tx: Sender<PeerEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, std::io::Error> {
        listener.set_nonblocking(true)?;
        let name = match listener.local_addr() {
            Ok(addr) => format!("zmtp-acceptor-{}", addr.port()),
            Err(_) => "zmtp-acceptor".to_owned(),
        };
        let thread = Builder::new()
            .name(name)
            .spawn(move || accept_loop(listener, peers, event_tx, shutdown))?;
        Ok(Self { thread })
    }

    /// Wait for the acceptor and its readers to complete.
    pub fn join(self) -> Result<(), String> {
        self.thread
            .join()
            .map_err(|_| "Acceptor thread panicked".to_string())
    }
}

fn accept_loop(
    listener: TcpListener,
    peers: PeerTable,
    event_tx: Sender<PeerEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let mut next_peer: PeerToken = 1;
    let mut readers: Vec<JoinHandle<()>> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let peer = next_peer;
                next_peer += 1;
                debug!("Accepted connection from {addr} as peer {peer}");

                let reader = PeerReader {
                    peer,
                    addr,
                    peers: peers.clone(),
                    event_tx: event_tx.clone(),
                    shutdown: shutdown.clone(),
                };
                match Builder::new()
                    .name(format!("zmtp-peer-{peer}"))
                    .spawn(move || reader.run(stream))
                {
                    Ok(handle) => readers.push(handle),
                    Err(e) => warn!("Unable to spawn reader for {addr}: {e}"),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }

        readers.retain(|r| !r.is_finished());
    }

    // Unblock readers waiting on their peers
    for writer in lock(&peers).values() {
        let _ = lock(writer).shutdown(Shutdown::Both);
    }
    for reader in readers {
        if reader.join().is_err() {
            warn!("Peer reader thread panicked");
        }
    }
    lock(&peers).clear();
}

/// Reads requests from one connected peer
struct PeerReader {
    peer: PeerToken,
    addr: SocketAddr,
    peers: PeerTable,
    event_tx: Sender<PeerEvent>,
    shutdown: Arc<AtomicBool>,
}

impl PeerReader {
    fn run(self, stream: TcpStream) {
        let peer = self.peer;
        let result = self.serve(stream);
        lock(&self.peers).remove(&peer);

        match result {
            Ok(()) => debug!("Peer {peer} at {} disconnected", self.addr),
            Err(error) => {
                warn!("Dropping peer {peer} at {}: {error}", self.addr);
                let _ = self.event_tx.send(PeerEvent::Error { peer, error });
            }
        }
        let _ = self.event_tx.send(PeerEvent::Closed { peer });
    }

    /// Complete the handshake, then forward requests until the peer hangs up.
    fn serve(&self, mut stream: TcpStream) -> Result<(), String> {
        let setup = |stream: &mut TcpStream| -> Result<TcpStream, ZmtpError> {
            stream.set_nonblocking(false)?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
            stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;
            handshake(&mut *stream, SocketType::Rep)?;
            // Timeouts apply to the handshake only; replies block like libzmq sends
            stream.set_read_timeout(None)?;
            stream.set_write_timeout(None)?;
            Ok(stream.try_clone()?)
        };
        let writer = setup(&mut stream).map_err(|e| format!("Handshake failed: {e}"))?;
        let writer = Arc::new(Mutex::new(writer));

        lock(&self.peers).insert(self.peer, writer.clone());
        // Shutdown may have swept the peer table before this peer was added
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("Peer {} at {} completed handshake", self.peer, self.addr);

        loop {
            match read_incoming(&mut stream) {
                Ok(Incoming::Message(parts)) => {
                    let time = Instant::now();
                    let (envelope, body) = split_envelope(parts);
                    let event = PeerEvent::Request {
                        peer: self.peer,
                        time,
                        envelope,
                        body,
                    };
                    if self.event_tx.send(event).is_err() {
                        // The socket is gone, so nobody is left to serve
                        return Ok(());
                    }
                }
                Ok(Incoming::Ping { context }) => {
                    write_pong(&mut *lock(&writer), &context)
                        .map_err(|e| format!("Failed to answer heartbeat: {e}"))?;
                }
                Err(ZmtpError::Io(e))
                    if self.shutdown.load(Ordering::SeqCst)
                        || matches!(
                            e.kind(),
                            ErrorKind::UnexpectedEof
                                | ErrorKind::ConnectionReset
                                | ErrorKind::ConnectionAborted
                        ) =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}
