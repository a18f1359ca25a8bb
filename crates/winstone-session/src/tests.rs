//! Unit tests for winstone-session

use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use test_case::test_case;

use crate::value::StoredValue;
use crate::*;

// ============================================================================
// Helpers
// ============================================================================

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Records every callback it receives, tagged with its label.
struct Recorder {
    label: &'static str,
    log: Log,
}

impl Recorder {
    fn push(&self, event: String) {
        self.log.lock().unwrap().push(format!("{}:{event}", self.label));
    }
}

impl SessionListener for Recorder {
    fn session_created(&self, context: &ExecutionContext, _session: &Session) {
        self.push(format!("created@{context}"));
    }

    fn session_destroyed(&self, _context: &ExecutionContext, session: &Session) {
        // Attributes are still readable while listeners run.
        let user = session.get_attribute("user").ok().flatten();
        self.push(format!("destroyed user={:?}", user.as_ref().and_then(AttributeValue::as_str)));
    }
}

impl SessionAttributeListener for Recorder {
    fn attribute_added(&self, _: &ExecutionContext, _: &Session, name: &str, _: &AttributeValue) {
        self.push(format!("added {name}"));
    }

    fn attribute_replaced(&self, _: &ExecutionContext, _: &Session, name: &str, old: &AttributeValue) {
        self.push(format!("replaced {name} old={old:?}"));
    }

    fn attribute_removed(&self, _: &ExecutionContext, _: &Session, name: &str, _: &AttributeValue) {
        self.push(format!("removed {name}"));
    }
}

impl SessionActivationListener for Recorder {
    fn session_will_passivate(&self, _: &ExecutionContext, session: &Session) {
        self.push(format!("will-passivate {}", session.id()));
    }

    fn session_did_activate(&self, context: &ExecutionContext, session: &Session) {
        self.push(format!("did-activate {}@{context}", session.id()));
    }
}

/// An application object that records its binding callbacks along with
/// the attribute value visible at the time.
#[derive(Debug)]
struct Tracked {
    label: &'static str,
    log: Log,
}

impl SessionObject for Tracked {
    fn value_bound(&self, event: &SessionBindingEvent<'_>) {
        let current = event.session.get_attribute(event.name).unwrap();
        self.log.lock().unwrap().push(format!(
            "bound {} (current={})",
            self.label,
            describe(current.as_ref())
        ));
    }

    fn value_unbound(&self, event: &SessionBindingEvent<'_>) {
        let current = event.session.get_attribute(event.name).ok().flatten();
        self.log.lock().unwrap().push(format!(
            "unbound {} (current={})",
            self.label,
            describe(current.as_ref())
        ));
    }
}

fn describe(value: Option<&AttributeValue>) -> String {
    match value {
        None => "none".into(),
        Some(v) => v
            .downcast_ref::<Tracked>()
            .map_or_else(|| format!("{v:?}"), |t| t.label.to_owned()),
    }
}

fn store_with(log: &Log, distributable: bool, dir: &std::path::Path) -> Arc<SessionStore> {
    let first = Arc::new(Recorder { label: "L1", log: Arc::clone(log) });
    let second = Arc::new(Recorder { label: "L2", log: Arc::clone(log) });
    let mut config = StoreConfig::new("localhost", "/shop", dir);
    config.distributable = distributable;
    config.listeners = SessionListeners::new()
        .with_session_listener(first.clone())
        .with_session_listener(second)
        .with_attribute_listener(first.clone())
        .with_activation_listener(first);
    SessionStore::new(config)
}

fn plain_store() -> Arc<SessionStore> {
    SessionStore::new(StoreConfig::new("localhost", "", std::env::temp_dir()))
}

// ============================================================================
// Creation and access
// ============================================================================

#[test]
fn create_session_notifies_in_registration_order() {
    let log = Log::default();
    let store = store_with(&log, false, &std::env::temp_dir());
    let session = store.create_session();

    assert_eq!(entries(&log), vec!["L1:created@localhost/shop", "L2:created@localhost/shop"]);
    assert_eq!(session.state(), SessionState::New);
    assert!(session.is_new().unwrap());
    assert_eq!(session.max_inactive_interval(), 1800);
    assert!(Arc::ptr_eq(&store.session(session.id()).unwrap(), &session));
}

#[test]
fn session_ids_are_unique() {
    let store = plain_store();
    let a = store.create_session();
    let b = store.create_session();
    assert_ne!(a.id(), b.id());
    assert_eq!(store.len(), 2);
}

#[test]
fn touch_moves_new_session_to_active() {
    let store = plain_store();
    let session = store.create_session();
    let before = session.last_accessed_time();

    thread::sleep(Duration::from_millis(5));
    session.touch().unwrap();

    assert!(!session.is_new().unwrap());
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.last_accessed_time() > before);
    assert!(session.creation_time() <= before);
}

// ============================================================================
// Attributes and notification order
// ============================================================================

#[test]
fn added_then_replaced() {
    let log = Log::default();
    let store = store_with(&log, false, &std::env::temp_dir());
    let session = store.create_session();
    log.lock().unwrap().clear();

    session.set_attribute("user", AttributeValue::from("ada")).unwrap();
    session.set_attribute("user", AttributeValue::from("grace")).unwrap();

    assert_eq!(
        entries(&log),
        vec!["L1:added user", "L1:replaced user old=Str(\"ada\")"]
    );
    assert_eq!(session.get_attribute("user").unwrap(), Some("grace".into()));
}

#[test]
fn bound_fires_before_swap_and_unbound_after() {
    let log = Log::default();
    let store = store_with(&log, false, &std::env::temp_dir());
    let session = store.create_session();

    let first = AttributeValue::object(Tracked { label: "first", log: Arc::clone(&log) });
    let second = AttributeValue::object(Tracked { label: "second", log: Arc::clone(&log) });
    session.set_attribute("cart", first).unwrap();
    log.lock().unwrap().clear();

    session.set_attribute("cart", second).unwrap();

    let log = entries(&log);
    assert_eq!(log.len(), 3);
    assert_eq!(log[0], "bound second (current=first)");
    assert_eq!(log[1], "unbound first (current=second)");
    assert!(log[2].starts_with("L1:replaced cart"));
}

#[test]
fn setting_none_removes() {
    let log = Log::default();
    let store = store_with(&log, false, &std::env::temp_dir());
    let session = store.create_session();
    session.set_attribute("user", AttributeValue::from("ada")).unwrap();
    log.lock().unwrap().clear();

    session.set_attribute("user", None::<AttributeValue>).unwrap();

    assert_eq!(session.get_attribute("user").unwrap(), None);
    assert_eq!(entries(&log), vec!["L1:removed user"]);

    // Removing an absent attribute notifies nobody.
    assert_eq!(session.remove_attribute("user").unwrap(), None);
    assert_eq!(entries(&log).len(), 1);
}

#[test]
fn attribute_names_are_sorted() {
    let session = plain_store().create_session();
    session.set_attribute("b", AttributeValue::Int(2)).unwrap();
    session.set_attribute("a", AttributeValue::Int(1)).unwrap();
    assert_eq!(session.attribute_names().unwrap(), vec!["a", "b"]);
}

// ============================================================================
// Invalidation
// ============================================================================

#[test]
fn invalidate_notifies_in_reverse_order_then_unbinds() {
    let log = Log::default();
    let store = store_with(&log, false, &std::env::temp_dir());
    let session = store.create_session();
    session.set_attribute("user", AttributeValue::from("ada")).unwrap();
    session
        .set_attribute("cart", AttributeValue::object(Tracked { label: "cart", log: Arc::clone(&log) }))
        .unwrap();
    log.lock().unwrap().clear();

    session.invalidate().unwrap();

    let log = entries(&log);
    assert_eq!(&log[..2], ["L2:destroyed user=Some(\"ada\")", "L1:destroyed user=Some(\"ada\")"]);
    assert!(log.contains(&"L1:removed user".to_owned()));
    assert!(log.contains(&"L1:removed cart".to_owned()));
    assert!(log.iter().any(|e| e.starts_with("unbound cart")));
    assert!(store.is_empty());
    assert_eq!(session.state(), SessionState::Invalidated);
}

#[test]
fn invalidated_session_rejects_access() {
    let session = plain_store().create_session();
    session.invalidate().unwrap();

    assert!(matches!(session.get_attribute("x"), Err(SessionError::InvalidState(_))));
    assert!(matches!(
        session.set_attribute("x", AttributeValue::Int(1)),
        Err(SessionError::InvalidState(_))
    ));
    assert!(matches!(session.remove_attribute("x"), Err(SessionError::InvalidState(_))));
    assert!(matches!(session.is_new(), Err(SessionError::InvalidState(_))));
    assert!(matches!(session.touch(), Err(SessionError::InvalidState(_))));
    assert!(matches!(session.invalidate(), Err(SessionError::InvalidState(_))));
}

#[test]
fn listener_may_invalidate_reentrantly_once() {
    struct Reinvalidate(Mutex<Option<SessionError>>);

    impl SessionListener for Reinvalidate {
        fn session_destroyed(&self, _: &ExecutionContext, session: &Session) {
            *self.0.lock().unwrap() = session.invalidate().err();
        }
    }

    let listener = Arc::new(Reinvalidate(Mutex::new(None)));
    let mut config = StoreConfig::new("localhost", "", std::env::temp_dir());
    config.listeners = SessionListeners::new().with_session_listener(listener.clone());
    let store = SessionStore::new(config);

    store.create_session().invalidate().unwrap();
    assert!(matches!(
        *listener.0.lock().unwrap(),
        Some(SessionError::InvalidState(_))
    ));
}

#[test]
fn destroyed_listener_cannot_add_attributes() {
    struct LateWriter(Mutex<Option<SessionError>>);

    impl SessionListener for LateWriter {
        fn session_destroyed(&self, _: &ExecutionContext, session: &Session) {
            *self.0.lock().unwrap() = session.set_attribute("late", AttributeValue::Int(1)).err();
        }
    }

    let listener = Arc::new(LateWriter(Mutex::new(None)));
    let mut config = StoreConfig::new("localhost", "", std::env::temp_dir());
    config.listeners = SessionListeners::new().with_session_listener(listener.clone());
    let store = SessionStore::new(config);

    store.create_session().invalidate().unwrap();
    assert!(matches!(
        *listener.0.lock().unwrap(),
        Some(SessionError::InvalidState(_))
    ));
}

#[test]
fn binding_is_undone_when_session_dies_during_bound_callback() {
    /// Invalidates the session it is being bound to.
    #[derive(Debug)]
    struct Saboteur(Log);

    impl SessionObject for Saboteur {
        fn value_bound(&self, event: &SessionBindingEvent<'_>) {
            self.0.lock().unwrap().push("bound".into());
            event.session.invalidate().unwrap();
        }

        fn value_unbound(&self, _event: &SessionBindingEvent<'_>) {
            self.0.lock().unwrap().push("unbound".into());
        }
    }

    let log = Log::default();
    let session = plain_store().create_session();
    let result = session.set_attribute("x", AttributeValue::object(Saboteur(Arc::clone(&log))));

    assert!(matches!(result, Err(SessionError::InvalidState(_))));
    assert_eq!(entries(&log), vec!["bound", "unbound"]);
    assert_eq!(session.state(), SessionState::Invalidated);
}

// ============================================================================
// Expiry
// ============================================================================

#[test_case(1, 0, false ; "no time elapsed")]
#[test_case(1, 1_000, false ; "exactly the interval")]
#[test_case(1, 1_001, true ; "past the interval")]
#[test_case(0, 10_000_000, false ; "zero disables expiry")]
#[test_case(-1, 10_000_000, false ; "negative disables expiry")]
fn expiry_is_a_function_of_elapsed_time(max_secs: i32, elapsed_ms: i64, expired: bool) {
    let session = plain_store().create_session();
    session.set_max_inactive_interval(max_secs);
    let last = session.last_accessed_time().timestamp_millis();
    assert_eq!(session.is_expired_at(last + elapsed_ms), expired);
}

#[test]
fn expired_session_is_swept() {
    let store = plain_store();
    let session = store.create_session();
    session.set_max_inactive_interval(1);
    let keeper = store.create_session();

    thread::sleep(Duration::from_secs(2));

    assert!(session.is_expired());
    assert_eq!(store.invalidate_expired(), 1);
    assert!(store.session(session.id()).is_none());
    assert!(store.session(keeper.id()).is_some());
}

#[test]
fn sweep_skips_sessions_in_use() {
    let store = plain_store();
    let session = store.create_session();
    session.set_max_inactive_interval(1);
    session.add_using_request(7);

    thread::sleep(Duration::from_millis(1_100));
    assert_eq!(store.invalidate_expired(), 0);
    assert!(session.is_valid());

    session.remove_using_request(7);
    assert_eq!(store.invalidate_expired(), 1);
}

// ============================================================================
// Passivation and activation
// ============================================================================

#[test]
fn passivate_skips_unbound_and_leaves_store() {
    let log = Log::default();
    let store = store_with(&log, true, &std::env::temp_dir());
    let session = store.create_session();
    session
        .set_attribute("cart", AttributeValue::object(Tracked { label: "cart", log: Arc::clone(&log) }))
        .unwrap();
    log.lock().unwrap().clear();

    session.passivate().unwrap();

    assert_eq!(entries(&log), vec![format!("L1:will-passivate {}", session.id())]);
    assert_eq!(session.state(), SessionState::Passivated);
    assert!(store.is_empty());
    assert!(matches!(session.get_attribute("cart"), Err(SessionError::InvalidState(_))));
}

/// Hands out one prepared session, once.
struct OneShotCluster(Mutex<Option<SessionData>>, Mutex<Vec<String>>);

impl Cluster for OneShotCluster {
    fn find_session(&self, session_id: &str, context: &ExecutionContext) -> Option<SessionData> {
        self.1.lock().unwrap().push(format!("{session_id}@{context}"));
        self.0.lock().unwrap().take()
    }
}

#[test]
fn find_session_migrates_from_cluster() {
    let remote = plain_store().create_session();
    remote.set_attribute("user", AttributeValue::from("ada")).unwrap();
    let data = remote.to_data().unwrap();
    let id = remote.id().to_owned();

    let log = Log::default();
    let store = store_with(&log, true, &std::env::temp_dir());
    let cluster = Arc::new(OneShotCluster(Mutex::new(Some(data)), Mutex::new(Vec::new())));
    store.set_cluster(cluster.clone());

    let session = store.find_session(&id).unwrap();
    assert_eq!(session.get_attribute("user").unwrap(), Some("ada".into()));
    assert!(store.session(&id).is_some());
    assert_eq!(entries(&log), vec![format!("L1:did-activate {id}@localhost/shop")]);
    assert_eq!(*cluster.1.lock().unwrap(), vec![format!("{id}@localhost/shop")]);

    // Now local: the cluster is not asked again.
    assert!(store.find_session(&id).is_some());
    assert_eq!(cluster.1.lock().unwrap().len(), 1);
    assert!(store.find_session("missing").is_none());
}

#[test]
fn non_distributable_store_never_asks_cluster() {
    let store = plain_store();
    let cluster = Arc::new(OneShotCluster(Mutex::new(None), Mutex::new(Vec::new())));
    store.set_cluster(cluster.clone());

    assert!(store.find_session("ABC").is_none());
    assert!(cluster.1.lock().unwrap().is_empty());
}

#[test]
fn cluster_reply_for_another_session_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let data = SessionData {
        id: "OTHER".into(),
        created: now_millis(),
        last_accessed: now_millis(),
        max_inactive_secs: 60,
        is_new: false,
        distributable: true,
        attributes: Vec::new(),
    };
    let log = Log::default();
    let store = store_with(&log, true, dir.path());
    store.set_cluster(Arc::new(OneShotCluster(Mutex::new(Some(data)), Mutex::new(Vec::new()))));

    assert!(store.find_session("REQUESTED").is_none());
    assert!(store.is_empty());
}

#[test]
fn cluster_reply_with_path_id_never_reaches_disk() {
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("app");
    let escaped = SessionData {
        id: "../../escaped".into(),
        created: now_millis(),
        last_accessed: now_millis(),
        max_inactive_secs: 60,
        is_new: false,
        distributable: true,
        attributes: Vec::new(),
    };
    let log = Log::default();
    let store = store_with(&log, true, &temp);
    let cluster = Arc::new(OneShotCluster(Mutex::new(Some(escaped.clone())), Mutex::new(Vec::new())));
    store.set_cluster(cluster.clone());

    // Neither asking for the path id nor for a well-formed id lets it in.
    assert!(store.find_session("../../escaped").is_none());
    assert!(cluster.1.lock().unwrap().is_empty());
    assert!(store.find_session("REQUESTED").is_none());
    assert!(store.is_empty());

    // A session built from such data directly is refused by the saver.
    Arc::new(Session::from_data(escaped)).activate(&store).unwrap();
    assert_eq!(store.save_sessions().unwrap(), 0);
    assert!(!temp.join("escaped.ser").exists());
    assert!(!dir.path().join("escaped.ser").exists());
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn save_and_load_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let log = Log::default();
    let store = store_with(&log, false, dir.path());
    let session = store.create_session();
    session.touch().unwrap();
    session.set_attribute("user", AttributeValue::from("ada")).unwrap();
    session.set_attribute("visits", AttributeValue::Int(3)).unwrap();
    session
        .set_attribute("cart", AttributeValue::object(Tracked { label: "cart", log: Arc::clone(&log) }))
        .unwrap();
    let id = session.id().to_owned();

    assert_eq!(store.save_sessions().unwrap(), 1);
    let file = dir.path().join(SESSIONS_DIR).join(format!("{id}.ser"));
    assert!(file.exists());

    let fresh = store_with(&log, false, dir.path());
    assert_eq!(fresh.load_sessions().unwrap(), 1);
    assert!(!file.exists());

    let loaded = fresh.session(&id).unwrap();
    assert_eq!(loaded.get_attribute("user").unwrap(), Some("ada".into()));
    assert_eq!(loaded.get_attribute("visits").unwrap(), Some(AttributeValue::Int(3)));
    assert_eq!(loaded.get_attribute("cart").unwrap(), None);
    assert!(!loaded.is_new().unwrap());
    assert_eq!(loaded.creation_time(), session.creation_time());
}

#[test]
fn expired_saved_session_is_invalidated_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = plain_store_in(dir.path());
    let sessions_dir = store.sessions_dir();
    fs::create_dir_all(&sessions_dir).unwrap();

    let data = SessionData {
        id: "STALE".into(),
        created: 1_000,
        last_accessed: 2_000,
        max_inactive_secs: 60,
        is_new: false,
        distributable: false,
        attributes: vec![("user".into(), StoredValue::Str("ada".into()))],
    };
    fs::write(sessions_dir.join("STALE.ser"), data.encode().unwrap()).unwrap();

    assert_eq!(store.load_sessions().unwrap(), 0);
    assert!(store.is_empty());
}

#[test]
fn corrupt_session_file_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = plain_store_in(dir.path());
    let keep = store.create_session();
    store.save_sessions().unwrap();
    store.remove_session(keep.id());

    let sessions_dir = store.sessions_dir();
    fs::write(sessions_dir.join("BROKEN.ser"), b"\x01\x00").unwrap();
    fs::write(sessions_dir.join("notes.txt"), b"ignored").unwrap();

    assert_eq!(store.load_sessions().unwrap(), 1);
    assert!(store.session(keep.id()).is_some());
    assert!(!sessions_dir.join("BROKEN.ser").exists());
    assert!(sessions_dir.join("notes.txt").exists());
}

#[test]
fn load_without_saved_sessions_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(plain_store_in(dir.path()).load_sessions().unwrap(), 0);
}

#[test]
fn destroy_saves_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig::new("localhost", "", dir.path());
    config.use_saved_sessions = true;
    let store = SessionStore::new(config);
    let session = store.create_session();

    store.destroy().unwrap();
    assert!(store.is_empty());
    assert!(store.sessions_dir().join(format!("{}.ser", session.id())).exists());
}

#[test]
fn destroy_invalidates_otherwise() {
    let log = Log::default();
    let store = store_with(&log, false, &std::env::temp_dir());
    let session = store.create_session();
    log.lock().unwrap().clear();

    store.destroy().unwrap();
    assert!(store.is_empty());
    assert_eq!(session.state(), SessionState::Invalidated);
    assert_eq!(entries(&log), vec!["L2:destroyed user=None", "L1:destroyed user=None"]);
}

fn plain_store_in(dir: &std::path::Path) -> Arc<SessionStore> {
    SessionStore::new(StoreConfig::new("localhost", "", dir))
}

// ============================================================================
// Property-Based Tests
// ============================================================================

use proptest::prelude::*;

proptest! {
    /// Property: once invalidated, every attribute operation fails.
    #[test]
    fn prop_invalidated_session_rejects_every_name(names in prop::collection::vec("[a-z]{1,8}", 1..10)) {
        let session = plain_store().create_session();
        for name in &names {
            session.set_attribute(name, AttributeValue::from(name.as_str())).unwrap();
        }
        session.invalidate().unwrap();

        for name in &names {
            prop_assert!(matches!(session.get_attribute(name), Err(SessionError::InvalidState(_))));
            prop_assert!(matches!(
                session.set_attribute(name, AttributeValue::Int(0)),
                Err(SessionError::InvalidState(_))
            ));
        }
    }

    /// Property: saved attributes survive encoding unchanged.
    #[test]
    fn prop_serializable_attributes_survive_encoding(
        values in prop::collection::hash_map("[a-z]{1,8}", any::<i64>(), 0..8)
    ) {
        let session = plain_store().create_session();
        for (name, value) in &values {
            session.set_attribute(name, AttributeValue::Int(*value)).unwrap();
        }
        let bytes = session.to_data().unwrap().encode().unwrap();
        let restored = Session::from_data(SessionData::decode(&bytes).unwrap());

        for (name, value) in &values {
            prop_assert_eq!(restored.get_attribute(name).unwrap(), Some(AttributeValue::Int(*value)));
        }
    }
}
