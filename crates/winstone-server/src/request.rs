//! Pooled request and response objects.
//!
//! Both are recycled through the [`ObjectPool`](crate::ObjectPool).
//! `cleanup` runs on every release and must leave the object
//! indistinguishable from a freshly built one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use winstone_session::Session;

/// Request attribute carrying a per-request unique id when
/// `simulateModUniqueId` is set.
pub const UNIQUE_ID_ATTRIBUTE: &str = "UNIQUE_ID";

const INITIAL_BODY_CAPACITY: usize = 1024;

/// Bodies that grew past this are dropped on cleanup rather than kept
/// in the pool.
const MAX_RETAINED_BODY_CAPACITY: usize = 64 * 1024;

fn reset_body(body: &mut BytesMut) {
    if body.capacity() > MAX_RETAINED_BODY_CAPACITY {
        *body = BytesMut::with_capacity(INITIAL_BODY_CAPACITY);
    } else {
        body.clear();
    }
}

/// An incoming request, filled in by a [`Listener`](crate::Listener).
#[derive(Debug)]
pub struct Request {
    id: u64,
    remote_addr: Option<SocketAddr>,
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    body: BytesMut,
    attributes: HashMap<String, String>,
    session: Option<Arc<Session>>,
}

impl Request {
    pub(crate) fn new() -> Self {
        Self {
            id: 0,
            remote_addr: None,
            method: String::new(),
            uri: String::new(),
            headers: Vec::new(),
            body: BytesMut::with_capacity(INITIAL_BODY_CAPACITY),
            attributes: HashMap::new(),
            session: None,
        }
    }

    pub(crate) fn begin(&mut self, id: u64) {
        self.id = id;
    }

    /// Unique for the lifetime of the object pool. Zero while pooled.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        self.method = method.into();
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The `Host` header without its port.
    pub fn host_name(&self) -> Option<&str> {
        self.header("Host")
            .map(|host| host.rsplit_once(':').map_or(host, |(name, _)| name))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Joins `session`, marking it in use so the expiry sweep skips it
    /// until this request is released.
    pub fn set_session(&mut self, session: Arc<Session>) {
        session.add_using_request(self.id);
        if let Some(previous) = self.session.replace(session) {
            previous.remove_using_request(self.id);
        }
    }

    /// Resets every field, releasing the session.
    pub fn cleanup(&mut self) {
        if let Some(session) = self.session.take() {
            session.remove_using_request(self.id);
        }
        self.id = 0;
        self.remote_addr = None;
        self.method.clear();
        self.uri.clear();
        self.headers.clear();
        reset_body(&mut self.body);
        self.attributes.clear();
    }
}

/// An outgoing response, written by a [`Listener`](crate::Listener).
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: BytesMut,
    committed: bool,
}

impl Response {
    pub(crate) fn new() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: BytesMut::with_capacity(INITIAL_BODY_CAPACITY),
            committed: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Marks the status and headers as sent.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    pub fn cleanup(&mut self) {
        self.status = 200;
        self.headers.clear();
        reset_body(&mut self.body);
        self.committed = false;
    }
}
