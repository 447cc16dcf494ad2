use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::BootstrapConfig;
use crate::proxy::{self, ProxyState};
use crate::utils::tcp;

use super::net;
use super::task::{
    bootstrap_net_recv, bootstrap_net_send, BootstrapExchangeInfo, EXCHANGE_INFO_SEND_SIZE,
    SOCKET_ADDR_SEND_SIZE,
};
use super::{AbortFlag, BootstrapError, BootstrapHandle, BootstrapRing, BootstrapState, UnexpectedConn};

/// Tag reserved for the neighbor-address exchange during `split`.
const SPLIT_TAG: i32 = -2;
/// Above this group size, check-ins are staggered by `rank` milliseconds to
/// flatten the thundering herd against the root's accept queue.
const STAGGER_THRESHOLD: usize = 128;

impl BootstrapState {
    /// Joins the group described by `handle`: checks in with the root,
    /// receives the ring successor, wires the ring, and all-gathers every
    /// rank's comm and proxy addresses.
    pub fn init(
        handle: &BootstrapHandle,
        config: &BootstrapConfig,
        rank: usize,
        num_ranks: usize,
        abort_flag: AbortFlag,
    ) -> Result<BootstrapState, BootstrapError> {
        let interface = net::bootstrap_net_init(config)?;
        let abort = Some(abort_flag.as_ref());

        log::trace!("bootstrap init: rank {} of {}", rank, num_ranks);

        // Long-lived listener for ring and tagged point-to-point traffic,
        // plus a transient one for the root's callback.
        let listener = tcp::listen(&interface.addr)?;
        let listen_addr = listener.local_addr()?;
        let root_listener = tcp::listen(&interface.addr)?;
        let root_listen_addr = root_listener.local_addr()?;

        if num_ranks > STAGGER_THRESHOLD {
            log::trace!("rank {} delaying connection to root by {} ms", rank, rank);
            std::thread::sleep(Duration::from_millis(rank as u64));
        }

        // Send both listen addresses to the root.
        let info = BootstrapExchangeInfo {
            rank,
            num_ranks,
            listen_addr_root: root_listen_addr,
            listen_addr,
        };
        let mut send_buf = [0u8; EXCHANGE_INFO_SEND_SIZE];
        let mut buf = send_buf.as_mut_slice();
        info.encode(&mut buf);
        let mut stream = tcp::connect(&handle.addr, handle.magic, abort)?;
        bootstrap_net_send(&mut stream, &send_buf, abort)?;
        drop(stream);

        // The root calls back with the comm address of our ring successor.
        let mut stream = tcp::accept(&root_listener, handle.magic, abort)?;
        let mut recv_buf = [0u8; SOCKET_ADDR_SEND_SIZE];
        bootstrap_net_recv(&mut stream, &mut recv_buf, abort)?;
        drop(stream);
        drop(root_listener);
        let mut buf = recv_buf.as_slice();
        let next_addr = tcp::decode_socket_addr(&mut buf);

        // Connect to the successor, then accept the predecessor. Both
        // sockets persist for the communicator's lifetime.
        let ring_send = tcp::connect(&next_addr, handle.magic, abort)?;
        let ring_recv = tcp::accept(&listener, handle.magic, abort)?;

        let mut state = BootstrapState {
            rank,
            num_ranks,
            magic: handle.magic,
            listener,
            ring: Mutex::new(BootstrapRing {
                ring_send,
                ring_recv,
            }),
            peer_addrs: Vec::new(),
            peer_proxy_addrs: Vec::new(),
            unexpected_connections: Mutex::new(Vec::new()),
            abort_flag,
            proxy: None,
        };
        state.peer_addrs = state.gather_socket_addrs(listen_addr)?;

        // Endpoint table for the proxy service, gathered the same way.
        let proxy_listener = tcp::listen(&interface.addr)?;
        let proxy_addr = proxy_listener.local_addr()?;
        state.peer_proxy_addrs = state.gather_socket_addrs(proxy_addr)?;
        state.proxy = Some(proxy::proxy_init(
            proxy_listener,
            state.peer_proxy_addrs.clone(),
        ));

        log::trace!("bootstrap init: rank {} of {} - done", rank, num_ranks);
        Ok(state)
    }

    /// Derives a bootstrap state for a sub-communicator without involving a
    /// root: neighbor addresses travel over the parent's tagged channels.
    /// `parent_ranks` lists the parent ranks of the child group in order and
    /// `rank` is this process's index within it.
    pub fn split(
        parent: &BootstrapState,
        config: &BootstrapConfig,
        rank: usize,
        parent_ranks: &[usize],
        abort_flag: AbortFlag,
    ) -> Result<BootstrapState, BootstrapError> {
        let num_ranks = parent_ranks.len();
        let interface = net::bootstrap_net_init(config)?;
        let abort = Some(abort_flag.as_ref());

        let prev = parent_ranks[(rank + num_ranks - 1) % num_ranks];
        let next = parent_ranks[(rank + 1) % num_ranks];

        let listener = tcp::listen(&interface.addr)?;
        let listen_addr = listener.local_addr()?;

        // Every member tells its predecessor where it listens and learns the
        // same from its successor.
        let mut addr_buf = [0u8; SOCKET_ADDR_SEND_SIZE];
        let mut buf = addr_buf.as_mut_slice();
        tcp::encode_socket_addr(&listen_addr, &mut buf);
        parent.send(prev, SPLIT_TAG, &addr_buf)?;
        let mut recv_buf = [0u8; SOCKET_ADDR_SEND_SIZE];
        parent.recv(next, SPLIT_TAG, &mut recv_buf)?;
        let mut buf = recv_buf.as_slice();
        let next_addr = tcp::decode_socket_addr(&mut buf);

        let ring_send = tcp::connect(&next_addr, parent.magic, abort)?;
        let ring_recv = tcp::accept(&listener, parent.magic, abort)?;

        let mut state = BootstrapState {
            rank,
            num_ranks,
            magic: parent.magic,
            listener,
            ring: Mutex::new(BootstrapRing {
                ring_send,
                ring_recv,
            }),
            peer_addrs: Vec::new(),
            peer_proxy_addrs: Vec::new(),
            unexpected_connections: Mutex::new(Vec::new()),
            abort_flag,
            proxy: None,
        };
        state.peer_addrs = state.gather_socket_addrs(listen_addr)?;

        if config.split_share_proxy {
            // shared lifetime with the parent's proxy service
            state.peer_proxy_addrs = parent.peer_proxy_addrs.clone();
            state.proxy = parent.proxy.clone();
        } else {
            let proxy_listener = tcp::listen(&interface.addr)?;
            let proxy_addr = proxy_listener.local_addr()?;
            state.peer_proxy_addrs = state.gather_socket_addrs(proxy_addr)?;
            state.proxy = Some(proxy::proxy_init(
                proxy_listener,
                state.peer_proxy_addrs.clone(),
            ));
        }

        log::trace!(
            "bootstrap split: rank {} of {} prev {} next {} - done",
            rank,
            num_ranks,
            prev,
            next
        );
        Ok(state)
    }

    fn gather_socket_addrs(&self, own: SocketAddr) -> Result<Vec<SocketAddr>, BootstrapError> {
        let mut data = vec![0u8; SOCKET_ADDR_SEND_SIZE * self.num_ranks];
        let mut slot =
            &mut data[self.rank * SOCKET_ADDR_SEND_SIZE..(self.rank + 1) * SOCKET_ADDR_SEND_SIZE];
        tcp::encode_socket_addr(&own, &mut slot);
        self.all_gather(&mut data)?;
        let addrs = data
            .chunks_exact(SOCKET_ADDR_SEND_SIZE)
            .map(|mut chunk| tcp::decode_socket_addr(&mut chunk))
            .collect();
        Ok(addrs)
    }

    /// Ring all-gather. `data` holds `num_ranks` equally sized slices with
    /// this rank's contribution at `data[rank*size..(rank+1)*size]`; on
    /// return slice `i` holds rank `i`'s contribution for every `i`.
    pub fn all_gather(&self, data: &mut [u8]) -> Result<(), BootstrapError> {
        assert_eq!(data.len() % self.num_ranks, 0);
        let size = data.len() / self.num_ranks;
        let rank = self.rank;
        let num_ranks = self.num_ranks;
        let abort = Some(self.abort_flag.as_ref());

        let mut ring = self
            .ring
            .try_lock()
            .map_err(|_| BootstrapError::RingBusy)?;
        // At step i, send slice (rank-i) to the right and receive slice
        // (rank-i-1) from the left. Each step completes before the next.
        for i in 0..num_ranks - 1 {
            let send_slice = (rank + num_ranks - i) % num_ranks;
            let recv_slice = (rank + num_ranks - i - 1) % num_ranks;
            bootstrap_net_send(
                &mut ring.ring_send,
                &data[send_slice * size..(send_slice + 1) * size],
                abort,
            )?;
            bootstrap_net_recv(
                &mut ring.ring_recv,
                &mut data[recv_slice * size..(recv_slice + 1) * size],
                abort,
            )?;
        }
        log::trace!(
            "bootstrap all-gather done: rank {} of {}, slice size {}",
            rank,
            num_ranks,
            size
        );
        Ok(())
    }

    /// Dissemination barrier over the tagged channels, ⌈log₂ n⌉ rounds.
    /// `ranks` maps group indices to peer ranks; `rank` is this process's
    /// index within the group.
    pub fn barrier(&self, ranks: &[usize], rank: usize, tag: i32) -> Result<(), BootstrapError> {
        let num_ranks = ranks.len();
        if num_ranks == 1 {
            return Ok(());
        }
        let mut data = [0u8; 1];
        let mut mask = 1;
        while mask < num_ranks {
            let src = (rank + num_ranks - mask) % num_ranks;
            let dst = (rank + mask) % num_ranks;
            self.send(ranks[dst], tag, &data)?;
            self.recv(ranks[src], tag, &mut data)?;
            mask <<= 1;
        }
        log::trace!("bootstrap barrier done: rank {} of {}", rank, num_ranks);
        Ok(())
    }

    /// All-gather over the tagged channels, used within a node where the
    /// group is a subset of ranks. Same slice layout as `all_gather`.
    pub fn intra_node_all_gather(
        &self,
        ranks: &[usize],
        rank: usize,
        data: &mut [u8],
    ) -> Result<(), BootstrapError> {
        let num_ranks = ranks.len();
        if num_ranks == 1 {
            return Ok(());
        }
        assert_eq!(data.len() % num_ranks, 0);
        let size = data.len() / num_ranks;
        for i in 1..num_ranks {
            let src = (rank + num_ranks - i) % num_ranks;
            let dst = (rank + i) % num_ranks;
            self.send(ranks[dst], i as i32, &data[rank * size..(rank + 1) * size])?;
            self.recv(ranks[src], i as i32, &mut data[src * size..(src + 1) * size])?;
        }
        log::trace!(
            "bootstrap intra-node all-gather done: rank {} of {}, slice size {}",
            rank,
            num_ranks,
            size
        );
        Ok(())
    }

    /// In-place broadcast of `data` from the group member at index `root`.
    pub fn intra_node_broadcast(
        &self,
        ranks: &[usize],
        rank: usize,
        root: usize,
        data: &mut [u8],
    ) -> Result<(), BootstrapError> {
        let num_ranks = ranks.len();
        if num_ranks == 1 {
            return Ok(());
        }
        if rank == root {
            for i in 0..num_ranks {
                if i != root {
                    self.send(ranks[i], ranks[i] as i32, data)?;
                }
            }
        } else {
            self.recv(ranks[root], ranks[rank] as i32, data)?;
        }
        Ok(())
    }

    /// Tagged send: a fresh connection carrying framed rank, tag and payload.
    pub fn send(&self, peer: usize, tag: i32, data: &[u8]) -> Result<(), BootstrapError> {
        let abort = Some(self.abort_flag.as_ref());
        let mut stream = tcp::connect(&self.peer_addrs[peer], self.magic, abort)?;
        bootstrap_net_send(&mut stream, &(self.rank as u32).to_le_bytes(), abort)?;
        bootstrap_net_send(&mut stream, &tag.to_le_bytes(), abort)?;
        bootstrap_net_send(&mut stream, data, abort)?;
        Ok(())
    }

    /// Tagged recv. Connections whose `(peer, tag)` does not match are
    /// parked on the unexpected queue with their payload unread; a prior
    /// matching entry is consumed before any new connection is accepted.
    pub fn recv(&self, peer: usize, tag: i32, data: &mut [u8]) -> Result<usize, BootstrapError> {
        let abort = Some(self.abort_flag.as_ref());
        if let Some(mut stream) = self.unexpected_dequeue(peer, tag) {
            return bootstrap_net_recv(&mut stream, data, abort);
        }
        loop {
            let mut stream = tcp::accept(&self.listener, self.magic, abort)?;
            let mut word = [0u8; 4];
            bootstrap_net_recv(&mut stream, &mut word, abort)?;
            let recv_peer = u32::from_le_bytes(word) as usize;
            bootstrap_net_recv(&mut stream, &mut word, abort)?;
            let recv_tag = i32::from_le_bytes(word);
            if recv_peer == peer && recv_tag == tag {
                return bootstrap_net_recv(&mut stream, data, abort);
            }
            log::trace!(
                "rank {} parking unexpected connection from peer {} tag {}",
                self.rank,
                recv_peer,
                recv_tag
            );
            self.unexpected_enqueue(recv_peer, recv_tag, stream);
        }
    }

    fn unexpected_enqueue(&self, peer: usize, tag: i32, stream: TcpStream) {
        let mut connections = self.unexpected_connections.lock().unwrap();
        connections.push(UnexpectedConn { peer, tag, stream });
    }

    fn unexpected_dequeue(&self, peer: usize, tag: i32) -> Option<TcpStream> {
        let mut connections = self.unexpected_connections.lock().unwrap();
        let idx = connections
            .iter()
            .position(|c| c.peer == peer && c.tag == tag)?;
        // keep arrival order for later matches
        let conn = connections.remove(idx);
        Some(conn.stream)
    }

    pub fn unexpected_count(&self) -> usize {
        self.unexpected_connections.lock().unwrap().len()
    }

    /// Every rank's comm listener address, indexed by rank.
    pub fn peer_addrs(&self) -> &[SocketAddr] {
        &self.peer_addrs
    }

    /// Every rank's proxy service address, indexed by rank.
    pub fn peer_proxy_addrs(&self) -> &[SocketAddr] {
        &self.peer_proxy_addrs
    }

    pub fn proxy(&self) -> Option<&Arc<ProxyState>> {
        self.proxy.as_ref()
    }

    /// Remote endpoints of the ring sockets, `(successor, predecessor)`.
    pub fn ring_peers(&self) -> Result<(SocketAddr, SocketAddr), BootstrapError> {
        let ring = self.ring.try_lock().map_err(|_| BootstrapError::RingBusy)?;
        Ok((ring.ring_send.peer_addr()?, ring.ring_recv.peer_addr()?))
    }

    /// Orderly teardown. A non-empty unexpected queue without a raised abort
    /// flag means a message was sent but never consumed; the state is freed
    /// either way.
    pub fn close(self) -> Result<(), BootstrapError> {
        let count = self.unexpected_connections.lock().unwrap().len();
        if count != 0 && self.abort_flag.load(Ordering::Relaxed) == 0 {
            log::warn!(
                "bootstrap close: {} unexpected connections were never consumed",
                count
            );
            return Err(BootstrapError::UnexpectedNotEmpty(count));
        }
        Ok(())
    }

    /// Flags every blocked operation on this state to unwind with `Aborted`.
    /// Idempotent and safe to call from any thread; sockets and tables are
    /// released when the state drops.
    pub fn abort(&self) {
        self.abort_flag.store(1, Ordering::Relaxed);
    }
}
