use std::net::{SocketAddr, TcpStream};

/// A socket handed from the acceptor to a dispatcher worker (spec.md §3
/// `ClientHandoff`). `SocketAddr` is already the tagged IPv4/IPv6 union
/// spec.md describes; the dispatcher that pops this value from the queue
/// owns the socket and is responsible for closing it on every exit path
/// (dropping `TcpStream` does that automatically).
#[derive(Debug)]
pub struct ClientHandoff {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

impl ClientHandoff {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }
}
