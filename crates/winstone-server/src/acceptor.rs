//! Blocking accept loops that can be stopped from another thread.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

pub(crate) struct AcceptLoop {
    name: String,
    addr: SocketAddr,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AcceptLoop {
    /// Accepts connections on `listener` and passes each to `handle` on
    /// the loop's own thread.
    pub(crate) fn spawn<F>(name: &str, listener: TcpListener, mut handle: F) -> io::Result<Self>
    where
        F: FnMut(TcpStream) + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let thread_name = name.to_owned();
        let thread = thread::Builder::new()
            .name(format!("winstone-accept-{name}"))
            .spawn(move || {
                for stream in listener.incoming() {
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    match stream {
                        Ok(stream) => handle(stream),
                        Err(e) => warn!(listener = %thread_name, error = %e, "accept failed"),
                    }
                }
                debug!(listener = %thread_name, "accept loop exited");
            })?;

        Ok(Self {
            name: name.to_owned(),
            addr,
            stopped,
            thread: Some(thread),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and waits for the loop to exit.
    pub(crate) fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stopped.store(true, Ordering::Release);
        // Wake the blocked accept with a throwaway connection.
        if let Err(e) = TcpStream::connect_timeout(&wake_addr(self.addr), Duration::from_secs(1)) {
            warn!(listener = %self.name, error = %e, "could not wake accept loop");
            return;
        }
        if thread.join().is_err() {
            warn!(listener = %self.name, "accept loop panicked");
        }
    }
}

impl Drop for AcceptLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wildcard binds are woken through loopback.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn accepts_until_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (tx, rx) = mpsc::channel();
        let mut accept = AcceptLoop::spawn("test", listener, move |stream| {
            let _ = tx.send(stream.peer_addr().is_ok());
        })
        .unwrap();

        let _client = TcpStream::connect(accept.local_addr()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        accept.stop();
        accept.stop();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn wildcard_is_woken_on_loopback() {
        let addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(wake_addr(addr), "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }
}
