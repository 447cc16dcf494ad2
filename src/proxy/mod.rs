use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

/// Per-communicator endpoint of the proxy service that manages long-lived
/// transport agents. Bootstrap only binds the listener and gathers the
/// address table; the transport layer takes it from here. A communicator
/// created by `split` may share its parent's state, extending the service's
/// lifetime through the returned `Arc`.
pub struct ProxyState {
    listener: TcpListener,
    peer_addrs: Vec<SocketAddr>,
}

impl ProxyState {
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Every rank's proxy endpoint, indexed by rank.
    pub fn peer_addrs(&self) -> &[SocketAddr] {
        &self.peer_addrs
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }
}

pub fn proxy_init(listener: TcpListener, peer_addrs: Vec<SocketAddr>) -> Arc<ProxyState> {
    log::trace!("proxy init: {} peer endpoints", peer_addrs.len());
    Arc::new(ProxyState {
        listener,
        peer_addrs,
    })
}
