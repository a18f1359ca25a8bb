//! Loopback tests for the cluster protocol.

use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use winstone_session::{AttributeValue, ExecutionContext, SessionStore, StoreConfig};

use crate::wire::{self, NODE_HEARTBEAT_TYPE, NODE_LIST_TYPE};
use crate::{ClusterConfig, ClusterError, SessionDirectory, SimpleCluster};

const HOST: &str = "localhost";
const PREFIX: &str = "/shop";

#[derive(Default)]
struct Directory {
    stores: HashMap<(String, String), Arc<SessionStore>>,
}

impl Directory {
    fn with_store(store: Arc<SessionStore>) -> Self {
        let context = store.execution_context();
        let mut stores = HashMap::new();
        stores.insert((context.host, context.context_path), store);
        Self { stores }
    }
}

impl SessionDirectory for Directory {
    fn store(&self, host: &str, prefix: &str) -> Option<Arc<SessionStore>> {
        self.stores.get(&(host.to_owned(), prefix.to_owned())).cloned()
    }
}

/// A cluster node with its control port served on loopback.
struct Node {
    cluster: Arc<SimpleCluster>,
    address: String,
}

fn start_node(seeds: &[&str], period: Duration, directory: Directory) -> Node {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ClusterConfig::new("127.0.0.1", port)
        .with_nodes(&seeds.join(","))
        .with_heartbeat_period(period)
        .with_search_timeout(Duration::from_secs(2));
    let cluster = SimpleCluster::start(config).unwrap();

    let served = Arc::clone(&cluster);
    let directory = Arc::new(directory);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let cluster = Arc::clone(&served);
            let directory = Arc::clone(&directory);
            thread::spawn(move || {
                let request_type = wire::read_u8(&mut stream).unwrap();
                let _ = cluster.cluster_request(request_type, &mut stream, directory.as_ref());
            });
        }
    });

    Node {
        cluster,
        address: format!("127.0.0.1:{port}"),
    }
}

fn slow() -> Duration {
    Duration::from_secs(60)
}

fn distributable_store(dir: &TempDir) -> Arc<SessionStore> {
    let mut config = StoreConfig::new(HOST, PREFIX, dir.path());
    config.distributable = true;
    SessionStore::new(config)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ============================================================================
// Membership
// ============================================================================

#[test]
fn joining_node_learns_seed_and_its_peers() {
    let a = start_node(&[], slow(), Directory::default());
    let b = start_node(&[&a.address], slow(), Directory::default());

    assert_eq!(b.cluster.known_nodes(), vec![a.address.clone()]);
    assert_eq!(a.cluster.known_nodes(), vec![b.address.clone()]);

    let c = start_node(&[&a.address], slow(), Directory::default());
    let mut expected = vec![a.address.clone(), b.address.clone()];
    expected.sort();
    assert_eq!(c.cluster.known_nodes(), expected);
}

#[test]
fn unreachable_seed_is_skipped() {
    let closed = TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = closed.local_addr().unwrap().to_string();
    drop(closed);

    let node = start_node(&[&dead], slow(), Directory::default());
    assert!(node.cluster.known_nodes().is_empty());
}

#[test]
fn own_address_is_never_registered() {
    let node = start_node(&[], slow(), Directory::default());
    let mut stream = TcpStream::connect(&node.address).unwrap();
    stream.write_all(&[NODE_HEARTBEAT_TYPE]).unwrap();
    let own_port = node.address.rsplit(':').next().unwrap().parse::<i32>().unwrap();
    wire::write_i32(&mut stream, own_port).unwrap();
    drop(stream);

    thread::sleep(Duration::from_millis(100));
    assert!(node.cluster.known_nodes().is_empty());
}

#[test]
fn node_list_excludes_requester() {
    let a = start_node(&[], slow(), Directory::default());
    a.cluster.add_node("10.0.0.7:8081");

    let mut stream = TcpStream::connect(&a.address).unwrap();
    stream.write_all(&[NODE_LIST_TYPE]).unwrap();
    wire::write_i32(&mut stream, 9999).unwrap();
    let count = wire::read_i32(&mut stream).unwrap();
    let listed: Vec<_> = (0..count).map(|_| wire::read_utf(&mut stream).unwrap()).collect();
    assert_eq!(listed, vec!["10.0.0.7:8081"]);

    assert!(wait_until(Duration::from_secs(1), || {
        a.cluster.known_nodes().contains(&"127.0.0.1:9999".to_owned())
    }));
}

// ============================================================================
// Heartbeat
// ============================================================================

#[test]
fn silent_peer_is_evicted_after_three_periods() {
    let node = start_node(&[], Duration::from_millis(40), Directory::default());
    node.cluster.add_node("127.0.0.1:1");
    assert_eq!(node.cluster.known_nodes().len(), 1);

    assert!(wait_until(Duration::from_secs(2), || node.cluster.known_nodes().is_empty()));
}

#[test]
fn heartbeats_keep_live_peers_registered() {
    let period = Duration::from_millis(100);
    let a = start_node(&[], period, Directory::default());
    let b = start_node(&[&a.address], period, Directory::default());

    thread::sleep(period * 8);
    assert_eq!(a.cluster.known_nodes(), vec![b.address.clone()]);
    assert_eq!(b.cluster.known_nodes(), vec![a.address.clone()]);
}

#[test]
fn destroy_stops_heartbeat_and_is_idempotent() {
    let node = start_node(&[], Duration::from_millis(20), Directory::default());
    node.cluster.destroy();
    node.cluster.destroy();

    // Without heartbeat rounds nothing is evicted any more.
    node.cluster.add_node("127.0.0.1:1");
    thread::sleep(Duration::from_millis(200));
    assert_eq!(node.cluster.known_nodes(), vec!["127.0.0.1:1"]);
}

// ============================================================================
// Session search
// ============================================================================

#[test]
fn session_moves_to_requesting_node() {
    let dir_a = tempfile::tempdir().unwrap();
    let store_a = distributable_store(&dir_a);
    let session = store_a.create_session();
    session.set_attribute("user", AttributeValue::from("ada")).unwrap();
    let id = session.id().to_owned();

    let a = start_node(&[], slow(), Directory::with_store(Arc::clone(&store_a)));
    let b = start_node(&[&a.address], slow(), Directory::default());

    let dir_b = tempfile::tempdir().unwrap();
    let store_b = distributable_store(&dir_b);
    store_b.set_cluster(b.cluster.clone());

    let migrated = store_b.find_session(&id).expect("session should migrate");
    assert_eq!(
        migrated.get_attribute("user").unwrap(),
        Some(AttributeValue::from("ada"))
    );
    assert!(store_b.session(&id).is_some());
    assert!(wait_until(Duration::from_secs(2), || store_a.session(&id).is_none()));
    assert!(!session.is_valid());
}

#[test]
fn missing_session_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = distributable_store(&dir);
    let a = start_node(&[], slow(), Directory::with_store(store));
    let b = start_node(&[&a.address], slow(), Directory::default());

    let context = ExecutionContext::new(HOST, PREFIX);
    assert!(b.cluster.ask_cluster_for_session("NOPE", &context).is_none());
}

#[test]
fn unknown_web_application_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = distributable_store(&dir);
    let id = store.create_session().id().to_owned();
    let a = start_node(&[], slow(), Directory::with_store(Arc::clone(&store)));
    let b = start_node(&[&a.address], slow(), Directory::default());

    let context = ExecutionContext::new(HOST, "/other");
    assert!(b.cluster.ask_cluster_for_session(&id, &context).is_none());
    assert!(store.session(&id).is_some());
}

#[test]
fn search_with_no_peers_returns_immediately() {
    let node = start_node(&[], slow(), Directory::default());
    let started = Instant::now();
    assert!(
        node.cluster
            .ask_cluster_for_session("X", &ExecutionContext::new(HOST, PREFIX))
            .is_none()
    );
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn unreachable_peer_counts_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let store = distributable_store(&dir);
    let id = store.create_session().id().to_owned();
    let a = start_node(&[], slow(), Directory::with_store(Arc::clone(&store)));
    let b = start_node(&[&a.address], slow(), Directory::default());
    b.cluster.add_node("127.0.0.1:1");

    let found = b.cluster.ask_cluster_for_session(&id, &ExecutionContext::new(HOST, PREFIX));
    assert_eq!(found.map(|data| data.id), Some(id));
}

#[test]
fn reply_carrying_another_session_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let decoy = distributable_store(&dir).create_session().to_data().unwrap();
    let decoy_id = decoy.id.clone();
    let frame = decoy.encode().unwrap();

    // A peer that answers every search with the decoy and reports whether
    // it was acknowledged.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer = listener.local_addr().unwrap().to_string();
    let (acked_tx, acked_rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            if wire::read_u8(&mut stream).ok() != Some(wire::SESSION_CHECK_TYPE) {
                continue;
            }
            let _port = wire::read_i32(&mut stream).unwrap();
            for _ in 0..3 {
                wire::read_utf(&mut stream).unwrap();
            }
            wire::write_utf(&mut stream, wire::FOUND).unwrap();
            wire::write_frame(&mut stream, &frame).unwrap();
            stream.flush().unwrap();
            let _ = acked_tx.send(wire::read_utf(&mut stream).is_ok());
        }
    });

    let node = start_node(&[], slow(), Directory::default());
    node.cluster.add_node(&peer);

    let found = node
        .cluster
        .ask_cluster_for_session("REQUESTED", &ExecutionContext::new(HOST, PREFIX));
    assert!(found.is_none());
    assert_ne!(decoy_id, "REQUESTED");
    assert_eq!(acked_rx.recv_timeout(Duration::from_secs(5)), Ok(false));
}

// ============================================================================
// Dispatch
// ============================================================================

#[test]
fn unknown_request_type_is_rejected() {
    let node = start_node(&[], slow(), Directory::default());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (mut stream, _) = listener.accept().unwrap();
    let _client = client.join().unwrap();

    let err = node
        .cluster
        .cluster_request(b'9', &mut stream, &Directory::default())
        .unwrap_err();
    assert!(matches!(err, ClusterError::UnknownRequestType(b'9')));
}
