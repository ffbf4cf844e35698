//! The network server: maintains one outbound TCP connection per peer,
//! accepts inbound peer connections, and drives the consensus node from a
//! single event-loop thread.
//!
//! All consensus state lives in the event loop; the only concurrency is at
//! the I/O boundary. Inbound reader threads decode frames and forward them to
//! the loop, and per-peer sender threads own their sockets, so a slow or dead
//! peer can never block the loop: its bounded send queue fills up and further
//! messages are dropped (heartbeats are idempotent, and log replication
//! retries on the reply cadence).

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::raft;
use crate::raft::Envelope;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// The capacity of each peer's outbound send queue. When full, messages to
/// that peer are dropped.
const SEND_QUEUE_CAPACITY: usize = 128;

/// The capacity of the inbound event queue feeding the event loop. Readers
/// block when it's full, applying backpressure per connection.
const STEP_QUEUE_CAPACITY: usize = 1024;

/// The initial reconnection backoff for peer connections.
const RECONNECT_MIN: Duration = Duration::from_millis(100);

/// The maximum reconnection backoff for peer connections.
const RECONNECT_MAX: Duration = Duration::from_secs(5);

/// A sraft server: one consensus node plus its peer transport.
pub struct Server {
    node: raft::Node,
    node_rx: Receiver<Envelope>,
    peers: HashMap<raft::NodeID, String>,
}

impl Server {
    /// Creates a new server for the given node.
    pub fn new(
        id: raft::NodeID,
        peers: HashMap<raft::NodeID, String>,
        log: raft::Log,
        state: Box<dyn raft::State>,
        opts: raft::Options,
        metrics: Metrics,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = raft::Node::new(
            id,
            peers.keys().copied().collect(),
            log,
            state,
            node_tx,
            opts,
            metrics,
        )?;
        Ok(Self { node, node_rx, peers })
    }

    /// Serves the node until a shutdown signal arrives on shutdown_rx or a
    /// fatal error occurs (e.g. a log store failure). The listener must
    /// already be bound, so that bind errors surface before we start.
    pub fn serve(self, listener: TcpListener, shutdown_rx: Receiver<()>) -> Result<()> {
        info!(
            "Node {} serving on {} with {} peers",
            self.node.id(),
            listener.local_addr()?,
            self.peers.len()
        );

        // Inbound connections feed decoded envelopes into step_tx.
        let (step_tx, step_rx) = crossbeam::channel::bounded(STEP_QUEUE_CAPACITY);
        std::thread::spawn(move || Self::accept(listener, step_tx));

        // Each peer gets a sender thread owning the outbound connection.
        let mut peer_txs = HashMap::new();
        for (&id, addr) in &self.peers {
            let (tx, rx) = crossbeam::channel::bounded::<Envelope>(SEND_QUEUE_CAPACITY);
            peer_txs.insert(id, tx);
            let addr = addr.clone();
            std::thread::spawn(move || Self::send_peer(addr, rx));
        }

        Self::eventloop(self.node, self.node_rx, step_rx, peer_txs, shutdown_rx)
    }

    /// Runs the event loop: the single thread that owns all consensus state.
    /// It processes one event at a time, in arrival order: a driver tick, an
    /// inbound message, an outbound message to route, or shutdown.
    fn eventloop(
        mut node: raft::Node,
        node_rx: Receiver<Envelope>,
        step_rx: Receiver<Envelope>,
        peer_txs: HashMap<raft::NodeID, Sender<Envelope>>,
        shutdown_rx: Receiver<()>,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(raft::TICK_INTERVAL);
        loop {
            crossbeam::channel::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(step_rx) -> msg => node = node.step(msg?)?,

                recv(node_rx) -> msg => {
                    let msg = msg?;
                    match peer_txs.get(&msg.to) {
                        Some(tx) => match tx.try_send(msg) {
                            Ok(()) => {}
                            Err(TrySendError::Full(msg)) => {
                                debug!("Full send queue for peer {}, dropping message", msg.to);
                            }
                            Err(TrySendError::Disconnected(msg)) => {
                                return Err(Error::IO(format!(
                                    "Sender for peer {} is gone",
                                    msg.to
                                )));
                            }
                        },
                        None => error!("Outbound message for unknown peer {}", msg.to),
                    }
                }

                recv(shutdown_rx) -> _ => {
                    info!("Shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Accepts inbound peer connections, spawning a reader thread for each.
    fn accept(listener: TcpListener, step_tx: Sender<Envelope>) {
        loop {
            let (socket, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("Listener failed: {err}");
                    return;
                }
            };
            let step_tx = step_tx.clone();
            std::thread::spawn(move || {
                debug!("Peer {peer} connected");
                match Self::receive_peer(socket, step_tx) {
                    Ok(()) => debug!("Peer {peer} disconnected"),
                    // Protocol violations drop the frame and reset the
                    // connection; they never reach consensus state.
                    Err(err) => warn!("Peer {peer} connection failed: {err}"),
                }
            });
        }
    }

    /// Receives inbound messages from a peer connection until it closes or a
    /// malformed frame arrives.
    fn receive_peer(socket: TcpStream, step_tx: Sender<Envelope>) -> Result<()> {
        let mut reader = BufReader::new(socket);
        while let Some(envelope) = Envelope::read_from(&mut reader)? {
            if step_tx.send(envelope).is_err() {
                break; // the event loop is gone, we're shutting down
            }
        }
        Ok(())
    }

    /// Sends outbound messages to a peer, reconnecting with exponential
    /// backoff when the connection fails. Returns when the server shuts down
    /// (the queue sender is dropped).
    fn send_peer(addr: String, rx: Receiver<Envelope>) {
        let mut backoff = RECONNECT_MIN;
        loop {
            match TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("Connected to peer {addr}");
                    backoff = RECONNECT_MIN;
                    match Self::send_peer_session(socket, &rx) {
                        Ok(()) => break,
                        Err(err) => warn!("Failed sending to peer {addr}: {err}"),
                    }
                }
                Err(err) => debug!("Failed connecting to peer {addr}: {err}"),
            }
            std::thread::sleep(backoff);
            backoff = std::cmp::min(backoff * 2, RECONNECT_MAX);
            // Check for shutdown while disconnected, so the thread doesn't
            // retry forever against a dead address. Consuming a queued
            // message here is fine: the peer is unreachable, and the
            // transport is best-effort.
            match rx.try_recv() {
                Err(crossbeam::channel::TryRecvError::Disconnected) => break,
                Err(crossbeam::channel::TryRecvError::Empty) | Ok(_) => {}
            }
        }
        debug!("Disconnected from peer {addr}");
    }

    /// Sends queued messages over a connected session. Returns Ok when the
    /// queue is closed (shutdown), or an error when the connection fails.
    fn send_peer_session(socket: TcpStream, rx: &Receiver<Envelope>) -> Result<()> {
        socket.set_nodelay(true)?;
        let mut writer = BufWriter::new(socket);
        for envelope in rx {
            envelope.write_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{Message, NoopState};
    use crate::storage::Memory;

    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// A shared in-memory metrics sink.
    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contains(&self, needle: &str) -> bool {
            String::from_utf8_lossy(&self.0.lock().unwrap()).contains(needle)
        }
    }

    /// Two servers connected over real TCP elect a leader: with a two-node
    /// cluster leadership needs both votes, so it proves the transport works
    /// in both directions.
    #[test]
    fn two_nodes_elect_leader_over_tcp() -> Result<()> {
        // Bind first with ephemeral ports, so the peers can address each
        // other.
        let listener1 = TcpListener::bind("127.0.0.1:0")?;
        let listener2 = TcpListener::bind("127.0.0.1:0")?;
        let addr1 = listener1.local_addr()?.to_string();
        let addr2 = listener2.local_addr()?.to_string();

        let (shutdown_tx, shutdown_rx) = crossbeam::channel::unbounded();
        let metrics = Buffer::default();

        let mut handles = Vec::new();
        for (id, listener, peer_id, peer_addr) in
            [(1, listener1, 2, &addr2), (2, listener2, 1, &addr1)]
        {
            let server = Server::new(
                id,
                HashMap::from([(peer_id, peer_addr.clone())]),
                raft::Log::new(Box::new(Memory::new()))?,
                Box::new(NoopState::new()),
                raft::Options::default(),
                Metrics::writer(Box::new(metrics.clone())),
            )?;
            let shutdown_rx = shutdown_rx.clone();
            handles.push(std::thread::spawn(move || server.serve(listener, shutdown_rx)));
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while !metrics.contains("election_won") {
            assert!(Instant::now() < deadline, "no leader within deadline");
            std::thread::sleep(Duration::from_millis(50));
        }

        shutdown_tx.send(()).ok();
        shutdown_tx.send(()).ok();
        for handle in handles {
            handle.join().expect("server panicked")?;
        }
        Ok(())
    }

    /// A malformed frame resets the connection without crashing the server,
    /// and later well-formed frames on new connections still work.
    #[test]
    fn malformed_frame_resets_connection() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::unbounded();
        let server = Server::new(
            1,
            HashMap::from([(2, "127.0.0.1:1".to_string())]),
            raft::Log::new(Box::new(Memory::new()))?,
            Box::new(NoopState::new()),
            raft::Options::default(),
            Metrics::disabled(),
        )?;
        let handle = std::thread::spawn(move || server.serve(listener, shutdown_rx));

        // Garbage bytes, then a well-formed frame on a fresh connection.
        let mut socket = TcpStream::connect(&addr)?;
        socket.write_all(&[0xff; 16])?;
        drop(socket);

        let mut socket = TcpStream::connect(&addr)?;
        let envelope = Envelope {
            from: 2,
            to: 1,
            term: 0,
            message: Message::RequestVoteReply { granted: false },
        };
        let mut buffer = Vec::new();
        envelope.write_into(&mut buffer)?;
        socket.write_all(&buffer)?;
        drop(socket);

        std::thread::sleep(Duration::from_millis(500));
        shutdown_tx.send(())?;
        handle.join().expect("server panicked")?;
        Ok(())
    }
}
