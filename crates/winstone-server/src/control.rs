//! The control port: shutdown, web application reload and cluster traffic.
//!
//! Every connection starts with one type byte. `'0'` stops the server and
//! `'4'` reloads the web application named by two strings, host then
//! prefix. Any other byte is cluster traffic and goes to the cluster.

use std::io::{self, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use winstone_cluster::wire::{RELOAD_TYPE, SHUTDOWN_TYPE, read_u8, read_utf, write_utf};

use crate::acceptor::AcceptLoop;
use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};

const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The control port's accept loop.
pub struct ControlPort {
    accept: AcceptLoop,
}

impl ControlPort {
    pub fn start(address: &str, port: u16, context: Arc<ServerContext>) -> ServerResult<Self> {
        let bind = format!("{address}:{port}");
        let listener = TcpListener::bind(&bind).map_err(|source| ServerError::BindFailed {
            addr: bind.clone(),
            source,
        })?;
        let accept = AcceptLoop::spawn("control", listener, move |stream| {
            let context = Arc::clone(&context);
            let spawned = thread::Builder::new()
                .name("winstone-control".into())
                .spawn(move || handle_connection(stream, &context));
            if let Err(e) = spawned {
                warn!(error = %e, "failed to spawn control connection handler");
            }
        })?;
        info!(addr = %accept.local_addr(), "control port listening");
        Ok(Self { accept })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.accept.local_addr()
    }

    pub fn stop(&mut self) {
        self.accept.stop();
    }
}

impl std::fmt::Debug for ControlPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPort")
            .field("addr", &self.local_addr())
            .finish()
    }
}

fn handle_connection(mut stream: TcpStream, context: &ServerContext) {
    if let Err(e) = stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT)) {
        debug!(error = %e, "control connection unusable");
        return;
    }
    let request_type = match read_u8(&mut stream) {
        Ok(request_type) => request_type,
        Err(e) => {
            debug!(error = %e, "control connection closed before a request");
            return;
        }
    };

    match request_type {
        SHUTDOWN_TYPE => {
            info!(peer = ?stream.peer_addr().ok(), "shutdown received on control port");
            context.request_shutdown();
        }
        RELOAD_TYPE => {
            match read_reload_target(&mut stream) {
                Ok((host, prefix)) => {
                    if let Err(e) = context.host_group().reload_webapp(&host, &prefix) {
                        warn!(host = %host, prefix = %prefix, error = %e, "reload failed");
                    }
                }
                Err(e) => warn!(error = %e, "malformed reload request"),
            }
        }
        other => match context.cluster() {
            Some(cluster) => {
                if let Err(e) = cluster.cluster_request(other, &mut stream, context.host_group().as_ref()) {
                    debug!(request_type = other, error = %e, "cluster request failed");
                }
            }
            None => warn!(request_type = other, "cluster request received but clustering is off"),
        },
    }
}

/// Host then prefix.
fn read_reload_target(stream: &mut TcpStream) -> io::Result<(String, String)> {
    let host = read_utf(stream)?;
    let prefix = read_utf(stream)?;
    Ok((host, prefix))
}

/// Asks the server behind the control port at `addr` to shut down.
pub fn send_shutdown(addr: impl ToSocketAddrs) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(&[SHUTDOWN_TYPE])?;
    stream.flush()
}

/// Asks the server behind the control port at `addr` to reload a web
/// application.
pub fn send_reload(addr: impl ToSocketAddrs, host: &str, prefix: &str) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(&[RELOAD_TYPE])?;
    write_utf(&mut stream, host)?;
    write_utf(&mut stream, prefix)?;
    stream.flush()
}
