//! `SimpleCluster`: a flat peer registry kept alive by heartbeats.
//!
//! Each node knows every other node by the address of its control port.
//! At startup a node downloads the peer list of each seed; afterwards it
//! heartbeats every known peer once per period and forgets any peer it has
//! not heard from for three periods. When a request carries a session id
//! this node does not hold, every known peer is asked for it in parallel.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, warn};
use winstone_session::{Cluster, ExecutionContext, SessionData, SessionStore};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::wire::{
    ACK, FOUND, MAX_SESSION_BYTES, NODE_HEARTBEAT_TYPE, NODE_LIST_TYPE, NOT_FOUND,
    SESSION_CHECK_TYPE, read_frame, read_i32, read_utf, write_frame, write_i32, write_utf,
};

/// Resolves the session store of a web application. Implemented by the
/// server's host group.
pub trait SessionDirectory: Send + Sync {
    fn store(&self, host: &str, prefix: &str) -> Option<Arc<SessionStore>>;
}

struct Shared {
    config: ClusterConfig,
    own_address: String,
    nodes: Mutex<HashMap<String, Instant>>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// A cluster member.
pub struct SimpleCluster {
    shared: Arc<Shared>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl SimpleCluster {
    /// Joins the cluster through the configured seeds and starts the
    /// heartbeat thread. Unreachable seeds are skipped.
    pub fn start(config: ClusterConfig) -> Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            own_address: config.own_address(),
            config,
            nodes: Mutex::new(HashMap::new()),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        for seed in &shared.config.nodes {
            if *seed == shared.own_address {
                continue;
            }
            match shared.download_node_list(seed) {
                Ok(peers) => {
                    shared.touch(seed);
                    for peer in peers {
                        if peer != shared.own_address {
                            shared.touch(&peer);
                        }
                    }
                }
                Err(e) => debug!(error = %e, "seed skipped"),
            }
        }

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("winstone-cluster-heartbeat".into())
            .spawn(move || worker.heartbeat_loop())?;

        info!(
            address = %shared.own_address,
            peers = shared.nodes().len(),
            "cluster started"
        );
        Ok(Arc::new(Self {
            shared,
            heartbeat: Mutex::new(Some(handle)),
        }))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.shared.config
    }

    /// The peers currently believed alive, sorted.
    pub fn known_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self.shared.nodes().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Asks every known peer for `session_id`. Returns the session data of
    /// the first peer that hands it over, or `None` once every peer has
    /// answered no or the search timeout passes.
    ///
    /// At most one peer is acknowledged, so exactly one node ends up owning
    /// the session. Peers that find it later keep their copy.
    pub fn ask_cluster_for_session(
        &self,
        session_id: &str,
        context: &ExecutionContext,
    ) -> Option<SessionData> {
        let peers = self.known_nodes();
        if peers.is_empty() {
            return None;
        }

        let claimed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let mut searching = 0;
        for peer in peers {
            let tx = tx.clone();
            let shared = Arc::clone(&self.shared);
            let claimed = Arc::clone(&claimed);
            let session_id = session_id.to_owned();
            let context = context.clone();
            let spawned = thread::Builder::new()
                .name("winstone-cluster-search".into())
                .spawn(move || {
                    let result = shared.session_check(&peer, &session_id, &context, &claimed);
                    let _ = tx.send((peer, result));
                });
            match spawned {
                Ok(_) => searching += 1,
                Err(e) => warn!(error = %e, "failed to spawn session search"),
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.shared.config.search_timeout;
        while searching > 0 {
            let wait = deadline.saturating_duration_since(Instant::now());
            let (peer, result) = match rx.recv_timeout(wait) {
                Ok(received) => received,
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // Closes the claim. A search that claimed first has
                    // already acknowledged, so its result must be taken.
                    if !claimed.swap(true, Ordering::AcqRel) {
                        debug!(session = %session_id, "cluster session search timed out");
                        return None;
                    }
                    return rx.iter().find_map(|(_, result)| result.ok().flatten());
                }
            };
            match result {
                Ok(Some(data)) => {
                    debug!(session = %session_id, peer = %peer, "session found in cluster");
                    return Some(data);
                }
                Ok(None) => {}
                Err(e) => debug!(peer = %peer, error = %e, "session search failed"),
            }
            searching -= 1;
        }
        None
    }

    /// Serves one cluster request whose type byte has already been read
    /// from `stream`.
    pub fn cluster_request(
        &self,
        request_type: u8,
        stream: &mut TcpStream,
        directory: &dyn SessionDirectory,
    ) -> Result<()> {
        stream.set_read_timeout(Some(self.shared.config.connect_timeout))?;
        let peer_ip = stream.peer_addr()?.ip();
        match request_type {
            NODE_LIST_TYPE => {
                let requester = format!("{peer_ip}:{}", read_port(stream)?);
                let peers: Vec<_> = self
                    .known_nodes()
                    .into_iter()
                    .filter(|node| *node != requester)
                    .collect();
                write_i32(stream, len_i32(peers.len())?)?;
                for peer in &peers {
                    write_utf(stream, peer)?;
                }
                debug!(requester = %requester, sent = peers.len(), "node list served");
                self.shared.touch(&requester);
                Ok(())
            }
            NODE_HEARTBEAT_TYPE => {
                let sender = format!("{peer_ip}:{}", read_port(stream)?);
                self.shared.touch(&sender);
                Ok(())
            }
            SESSION_CHECK_TYPE => self.serve_session_check(stream, directory),
            other => Err(ClusterError::UnknownRequestType(other)),
        }
    }

    fn serve_session_check(
        &self,
        stream: &mut TcpStream,
        directory: &dyn SessionDirectory,
    ) -> Result<()> {
        let _port = read_i32(stream)?;
        let session_id = read_utf(stream)?;
        let host = read_utf(stream)?;
        let prefix = read_utf(stream)?;

        let found = directory
            .store(&host, &prefix)
            .and_then(|store| store.session(&session_id))
            .and_then(|session| session.to_data().ok().map(|data| (session, data)));
        let Some((session, data)) = found else {
            write_utf(stream, NOT_FOUND)?;
            return Ok(());
        };

        write_utf(stream, FOUND)?;
        write_frame(stream, &data.encode()?)?;
        match read_utf(stream) {
            Ok(ack) if ack == ACK => {
                session.passivate()?;
                info!(session = %session_id, host = %host, prefix = %prefix, "session handed to peer");
                Ok(())
            }
            Ok(other) => Err(ClusterError::Protocol(format!(
                "expected acknowledgement, got {other:?}"
            ))),
            // Another peer won the session; ours stays live.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stops the heartbeat thread. Safe to call more than once.
    pub fn destroy(&self) {
        *self
            .shared
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.shared.wake.notify_all();

        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("cluster heartbeat thread panicked");
            }
            info!(address = %self.shared.own_address, "cluster stopped");
        }
    }

    #[cfg(test)]
    pub(crate) fn add_node(&self, node: &str) {
        self.shared.touch(node);
    }
}

impl Cluster for SimpleCluster {
    fn find_session(&self, session_id: &str, context: &ExecutionContext) -> Option<SessionData> {
        self.ask_cluster_for_session(session_id, context)
    }
}

impl Drop for SimpleCluster {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for SimpleCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleCluster")
            .field("address", &self.shared.own_address)
            .field("nodes", &self.known_nodes())
            .finish_non_exhaustive()
    }
}

impl Shared {
    // Registry updates are single inserts and removals, so the map stays
    // consistent under poisoning.
    fn nodes(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self, node: &str) {
        if node != self.own_address {
            self.nodes().insert(node.to_owned(), Instant::now());
        }
    }

    fn heartbeat_loop(&self) {
        let period = self.config.heartbeat_period;
        loop {
            let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
            let (stopped, _) = self
                .wake
                .wait_timeout_while(stopped, period, |stopped| !*stopped)
                .unwrap_or_else(PoisonError::into_inner);
            if *stopped {
                break;
            }
            drop(stopped);
            self.heartbeat_round();
        }
    }

    fn heartbeat_round(&self) {
        let max_age = self.config.eviction_age();
        let alive: Vec<String> = {
            let mut nodes = self.nodes();
            nodes.retain(|node, last_seen| {
                let keep = last_seen.elapsed() <= max_age;
                if !keep {
                    info!(peer = %node, "peer evicted after missed heartbeats");
                }
                keep
            });
            nodes.keys().cloned().collect()
        };

        for peer in alive {
            if let Err(e) = self.send_heartbeat(&peer) {
                debug!(error = %e, "heartbeat not delivered");
            }
        }
    }

    fn connect(&self, peer: &str) -> Result<TcpStream> {
        let unreachable = |source: io::Error| ClusterError::PeerUnreachable {
            peer: peer.to_owned(),
            source,
        };
        let addr = resolve(peer).map_err(unreachable)?;
        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            .map_err(unreachable)?;
        stream.set_read_timeout(Some(self.config.connect_timeout))?;
        stream.set_write_timeout(Some(self.config.connect_timeout))?;
        Ok(stream)
    }

    fn send_heartbeat(&self, peer: &str) -> Result<()> {
        let mut stream = self.connect(peer)?;
        stream_write(&mut stream, peer, |s| {
            write_type(s, NODE_HEARTBEAT_TYPE)?;
            write_i32(s, i32::from(self.config.control_port))
        })
    }

    fn download_node_list(&self, peer: &str) -> Result<Vec<String>> {
        let mut stream = self.connect(peer)?;
        stream_write(&mut stream, peer, |s| {
            write_type(s, NODE_LIST_TYPE)?;
            write_i32(s, i32::from(self.config.control_port))
        })?;

        let count = read_i32(&mut stream)?;
        let count = usize::try_from(count)
            .map_err(|_| ClusterError::Protocol(format!("negative node count {count}")))?;
        let mut peers = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            peers.push(read_utf(&mut stream)?);
        }
        debug!(peer = %peer, received = peers.len(), "node list downloaded");
        Ok(peers)
    }

    /// Asks one peer for a session. Returns the data only if this search
    /// claimed the session and acknowledged it.
    fn session_check(
        &self,
        peer: &str,
        session_id: &str,
        context: &ExecutionContext,
        claimed: &AtomicBool,
    ) -> Result<Option<SessionData>> {
        let mut stream = self.connect(peer)?;
        stream.set_read_timeout(Some(self.config.search_timeout))?;
        stream_write(&mut stream, peer, |s| {
            write_type(s, SESSION_CHECK_TYPE)?;
            write_i32(s, i32::from(self.config.control_port))?;
            write_utf(s, session_id)?;
            write_utf(s, &context.host)?;
            write_utf(s, &context.context_path)
        })?;

        let status = read_utf(&mut stream)?;
        match status.as_str() {
            NOT_FOUND => Ok(None),
            FOUND => {
                let data = SessionData::decode(&read_frame(&mut stream, MAX_SESSION_BYTES)?)?;
                if data.id != session_id {
                    return Err(ClusterError::Protocol(format!(
                        "asked for session {session_id}, got {}",
                        data.id
                    )));
                }
                if claimed
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Ok(None);
                }
                write_utf(&mut stream, ACK)?;
                Ok(Some(data))
            }
            other => Err(ClusterError::Protocol(format!(
                "unexpected session-check status {other:?}"
            ))),
        }
    }
}

fn resolve(peer: &str) -> io::Result<SocketAddr> {
    peer.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address for {peer}"))
    })
}

fn write_type(stream: &mut TcpStream, request_type: u8) -> io::Result<()> {
    io::Write::write_all(stream, &[request_type])
}

/// Runs the request writer, reporting a failed first write as the peer
/// being unreachable.
fn stream_write(
    stream: &mut TcpStream,
    peer: &str,
    write: impl FnOnce(&mut TcpStream) -> io::Result<()>,
) -> Result<()> {
    write(stream).map_err(|source| ClusterError::PeerUnreachable {
        peer: peer.to_owned(),
        source,
    })
}

fn read_port(stream: &mut TcpStream) -> Result<u16> {
    let port = read_i32(stream)?;
    u16::try_from(port).map_err(|_| ClusterError::Protocol(format!("invalid control port {port}")))
}

fn len_i32(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| ClusterError::Protocol(format!("node list of {len} too long")))
}
