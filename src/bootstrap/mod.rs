pub mod net;
pub mod state;
pub mod task;

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::ProxyState;
use crate::utils::interfaces::NetInterfaceError;
use crate::utils::tcp::{self, TcpError};

pub use net::{bootstrap_net_init, get_unique_id, NetInterface};
pub use task::{bootstrap_create_root, bootstrap_root};

/// Shared flag owned by the communicator; a nonzero value makes every
/// blocking bootstrap operation on the state unwind with `Aborted`.
pub type AbortFlag = Arc<AtomicU32>;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid rendezvous endpoint \"{0}\", expected <host>:<port> or [<ipv6>]:<port>")]
    InvalidCommId(String),
    #[error("no usable network interface found")]
    NoInterface,
    #[error("no interface matches the subnet of {0}")]
    NoInterfaceForSubnet(SocketAddr),
    #[error("interface error: {0}")]
    NetInterface(#[from] NetInterfaceError),
    #[error("bootstrap root received inconsistent rank count of {0} vs {1}")]
    NumRanksMismatch(usize, usize),
    #[error("bootstrap root received duplicate check-in from rank {0}")]
    DuplicatedCheckIn(usize),
    #[error("bootstrap root received out-of-range rank {0}")]
    RankOverflow(usize),
    #[error("message truncated: received {0} bytes instead of at most {1}")]
    Truncated(u32, u32),
    #[error("{0} unexpected connections were never consumed")]
    UnexpectedNotEmpty(usize),
    #[error("bootstrap ring is busy, only a single outstanding collective is allowed")]
    RingBusy,
    #[error("operation aborted")]
    Aborted,
}

impl From<TcpError> for BootstrapError {
    fn from(err: TcpError) -> Self {
        match err {
            TcpError::Io(err) => BootstrapError::Io(err),
            TcpError::Aborted => BootstrapError::Aborted,
        }
    }
}

/// The only out-of-band state of the rendezvous: whoever holds the handle
/// can join the group. The magic is verified on every accepted connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapHandle {
    pub addr: SocketAddr,
    pub magic: u64,
}

impl BootstrapHandle {
    pub const WIRE_SIZE: usize = tcp::SOCKET_ADDR_WIRE_SIZE + std::mem::size_of::<u64>();

    /// Fixed-layout encoding for out-of-band distribution by the application.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        tcp::encode_socket_addr(&self.addr, &mut buf);
        buf.resize(tcp::SOCKET_ADDR_WIRE_SIZE, 0);
        buf.put_u64(self.magic);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BootstrapError> {
        if bytes.len() < Self::WIRE_SIZE || !matches!(bytes[0], 4 | 6) {
            return Err(BootstrapError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed bootstrap handle",
            )));
        }
        let mut addr_buf = &bytes[..tcp::SOCKET_ADDR_WIRE_SIZE];
        let addr = tcp::decode_socket_addr(&mut addr_buf);
        let mut magic_buf = &bytes[tcp::SOCKET_ADDR_WIRE_SIZE..];
        let magic = magic_buf.get_u64();
        Ok(BootstrapHandle { addr, magic })
    }
}

/// A tagged connection whose `(peer, tag)` did not match the pending recv;
/// parked with its payload still unread on the socket.
pub struct UnexpectedConn {
    pub peer: usize,
    pub tag: i32,
    pub stream: TcpStream,
}

pub struct BootstrapRing {
    pub ring_send: TcpStream,
    pub ring_recv: TcpStream,
}

/// Per-communicator, per-rank bootstrap state. Sockets close and address
/// tables free when the state drops.
pub struct BootstrapState {
    pub rank: usize,
    pub num_ranks: usize,
    pub magic: u64,
    pub(crate) listener: TcpListener,
    pub(crate) ring: Mutex<BootstrapRing>,
    pub(crate) peer_addrs: Vec<SocketAddr>,
    pub(crate) peer_proxy_addrs: Vec<SocketAddr>,
    pub(crate) unexpected_connections: Mutex<Vec<UnexpectedConn>>,
    pub(crate) abort_flag: AbortFlag,
    pub(crate) proxy: Option<Arc<ProxyState>>,
}
