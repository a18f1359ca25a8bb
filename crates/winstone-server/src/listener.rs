//! The contract between connection listeners and the handler pool.
//!
//! A listener owns a server socket and the byte-level protocol spoken on
//! it. It accepts connections and hands each one to
//! [`ObjectPool::handle_request`](crate::ObjectPool::handle_request); a
//! pooled handler thread then calls back into [`Listener::serve`] once per
//! request on that connection.

use std::io;
use std::net::TcpStream;

use tracing::debug;

use crate::error::ServerError;
use crate::request::{Request, Response};

/// What to do with a connection after a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Serve another request on the same connection.
    Continue,
    Close,
}

pub trait Listener: Send + Sync {
    fn name(&self) -> &str;

    /// Reads one request from `socket` into `request` and writes
    /// `response` back.
    fn serve(
        &self,
        socket: &mut TcpStream,
        request: &mut Request,
        response: &mut Response,
    ) -> io::Result<KeepAlive>;

    /// Called instead of `serve` when no request or response object is
    /// free for the next request on `socket`. The listener should read that
    /// one request and answer it with a 5xx-style response; the connection
    /// itself stays usable.
    fn reject(&self, socket: &mut TcpStream, error: &ServerError) -> io::Result<KeepAlive>;

    /// Called when no handler thread is available for `socket`. Dropping
    /// the socket closes the connection.
    fn refuse(&self, socket: TcpStream, error: &ServerError) {
        debug!(listener = self.name(), peer = ?socket.peer_addr().ok(), error = %error, "connection refused");
    }
}
