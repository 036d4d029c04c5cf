use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::handoff::ClientHandoff;

/// How long a single `accept` poll waits before re-checking `running`.
/// Keeps shutdown latency bounded well under the 1-second ceiling spec.md
/// §5 allows for any blocking wait, without busy-spinning.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Owns the listening socket (spec.md §4.4, §5 "Listening socket is owned
/// by the acceptor only"). `accept_with_shutdown` is the blocking
/// equivalent of the original's `select`-with-timeout loop: the listener
/// is nonblocking, so each iteration either returns a connection or backs
/// off for one poll interval and re-checks `running`.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    /// Binds with `SO_REUSEADDR` set before `bind` (via `socket2`, which
    /// exposes it uniformly across platforms; `std::net` has no portable
    /// setter) so a restarted manager can rebind its port immediately
    /// instead of waiting out `TIME_WAIT` on the previous listener.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        Ok(Self { listener: socket.into() })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocks until a connection arrives or `running` is cleared. Applies
    /// `socket_timeout` (if any) to the accepted stream before handing it
    /// back, per spec.md §4.4 "set per-socket receive timeout if
    /// configured". Returns `None` on shutdown.
    pub fn accept_with_shutdown(
        &self,
        running: &AtomicBool,
        socket_timeout: Option<Duration>,
    ) -> Option<ClientHandoff> {
        loop {
            if !running.load(Ordering::Acquire) {
                return None;
            }

            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Some(timeout) = socket_timeout {
                        if let Err(err) = stream.set_read_timeout(Some(timeout)) {
                            tracing::warn!(%err, "failed to set accepted socket read timeout");
                        }
                        if let Err(err) = stream.set_write_timeout(Some(timeout)) {
                            tracing::warn!(%err, "failed to set accepted socket write timeout");
                        }
                    }
                    return Some(ClientHandoff::new(stream, peer_addr));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) if is_interrupted(&err) => continue,
                Err(err) => {
                    if !running.load(Ordering::Acquire) {
                        // Socket closed out from under us during shutdown (EBADF); expected.
                        return None;
                    }
                    tracing::error!(%err, "fatal accept() error, terminating");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn is_interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::sync::Arc;

    #[test]
    fn accepts_a_connection() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let handoff = acceptor
            .accept_with_shutdown(&running, Some(Duration::from_secs(1)))
            .expect("expected a connection");
        client.join().unwrap();
        assert_eq!(handoff.peer_addr.ip(), addr.ip());
    }

    #[test]
    fn returns_none_promptly_after_shutdown() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let running = Arc::new(AtomicBool::new(false));
        let result = acceptor.accept_with_shutdown(&running, None);
        assert!(result.is_none());
    }
}
