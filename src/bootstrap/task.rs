use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicU32;
use std::thread;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut};
use nix::sys::resource::{self, Resource};

use crate::utils::tcp;

use super::{BootstrapError, BootstrapHandle};

pub const SOCKET_ADDR_SEND_SIZE: usize = tcp::SOCKET_ADDR_WIRE_SIZE;
pub const EXCHANGE_INFO_SEND_SIZE: usize = 80;

/// Rendezvous payload each rank sends to the root: two listeners, one for
/// the root's callback and one for rank-to-rank ring traffic.
pub struct BootstrapExchangeInfo {
    pub rank: usize,
    pub num_ranks: usize,
    pub listen_addr_root: SocketAddr,
    pub listen_addr: SocketAddr,
}

impl BootstrapExchangeInfo {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.rank as u64);
        buf.put_u64(self.num_ranks as u64);
        tcp::encode_socket_addr(&self.listen_addr_root, buf);
        tcp::encode_socket_addr(&self.listen_addr, buf);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Self {
        let rank = buf.get_u64() as usize;
        let num_ranks = buf.get_u64() as usize;
        let listen_addr_root = tcp::decode_socket_addr(buf);
        let listen_addr = tcp::decode_socket_addr(buf);
        Self {
            rank,
            num_ranks,
            listen_addr_root,
            listen_addr,
        }
    }
}

/// Sends one logical message: a 4-byte length followed by the payload.
pub fn bootstrap_net_send(
    stream: &mut TcpStream,
    data: &[u8],
    abort: Option<&AtomicU32>,
) -> Result<(), BootstrapError> {
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, data.len() as u32);
    tcp::send_exact(stream, &len, abort)?;
    tcp::send_exact(stream, data, abort)?;
    Ok(())
}

/// Receives one logical message into `data`. A message longer than the
/// buffer is a truncation error; a shorter one fills a prefix and the
/// number of bytes received is returned.
pub fn bootstrap_net_recv(
    stream: &mut TcpStream,
    data: &mut [u8],
    abort: Option<&AtomicU32>,
) -> Result<usize, BootstrapError> {
    let mut len = [0u8; 4];
    tcp::recv_exact(stream, &mut len, abort)?;
    let recv_size = LittleEndian::read_u32(&len);
    if recv_size as usize > data.len() {
        return Err(BootstrapError::Truncated(recv_size, data.len() as u32));
    }
    tcp::recv_exact(stream, &mut data[..recv_size as usize], abort)?;
    Ok(recv_size as usize)
}

// The collect phase briefly holds one descriptor per rank.
fn raise_files_limit() -> Result<(), BootstrapError> {
    let (_soft, hard) = resource::getrlimit(Resource::RLIMIT_NOFILE)
        .map_err(|err| io::Error::from_raw_os_error(err as i32))?;
    resource::setrlimit(Resource::RLIMIT_NOFILE, hard, hard)
        .map_err(|err| io::Error::from_raw_os_error(err as i32))?;
    Ok(())
}

/// Rendezvous root: collects every rank's listen addresses, then sends each
/// rank the comm address of its ring successor. Serves exactly one group and
/// exits; any protocol violation terminates the service.
pub fn bootstrap_root(listener: TcpListener, magic: u64) -> Result<(), BootstrapError> {
    raise_files_limit()?;

    let mut rank_addrs: Vec<Option<SocketAddr>> = Vec::new();
    let mut rank_addrs_root: Vec<Option<SocketAddr>> = Vec::new();
    let mut num_ranks = 0;
    let mut received = 0;

    let mut recv_buf = [0u8; EXCHANGE_INFO_SEND_SIZE];
    loop {
        let mut stream = tcp::accept(&listener, magic, None)?;
        bootstrap_net_recv(&mut stream, &mut recv_buf, None)?;
        drop(stream);
        let mut buf = recv_buf.as_slice();
        let info = BootstrapExchangeInfo::decode(&mut buf);

        if received == 0 {
            // the first check-in fixes the group size
            num_ranks = info.num_ranks;
            rank_addrs = vec![None; num_ranks];
            rank_addrs_root = vec![None; num_ranks];
        }
        if info.num_ranks != num_ranks {
            return Err(BootstrapError::NumRanksMismatch(info.num_ranks, num_ranks));
        }
        if info.rank >= num_ranks {
            return Err(BootstrapError::RankOverflow(info.rank));
        }
        if rank_addrs_root[info.rank].is_some() {
            return Err(BootstrapError::DuplicatedCheckIn(info.rank));
        }
        rank_addrs[info.rank] = Some(info.listen_addr);
        rank_addrs_root[info.rank] = Some(info.listen_addr_root);
        received += 1;
        log::trace!(
            "bootstrap root received check-in from rank {} ({}/{})",
            info.rank,
            received,
            num_ranks
        );
        if received == num_ranks {
            break;
        }
    }

    let mut send_buf = [0u8; SOCKET_ADDR_SEND_SIZE];
    for r in 0..num_ranks {
        let next = (r + 1) % num_ranks;
        send_buf.fill(0);
        let mut buf = send_buf.as_mut_slice();
        tcp::encode_socket_addr(rank_addrs[next].as_ref().unwrap(), &mut buf);

        let connect_addr = rank_addrs_root[r].as_ref().unwrap();
        let mut stream = tcp::connect(connect_addr, magic, None)?;
        bootstrap_net_send(&mut stream, &send_buf, None)?;
    }
    log::trace!(
        "bootstrap root has sent out all {} successor addresses",
        num_ranks
    );
    Ok(())
}

/// Binds the rendezvous listener, records the bound address in the handle
/// and spawns the root service as a detached worker.
pub fn bootstrap_create_root(handle: &mut BootstrapHandle) -> Result<(), BootstrapError> {
    let listener = tcp::listen(&handle.addr)?;
    handle.addr = listener.local_addr()?;
    let magic = handle.magic;
    thread::Builder::new()
        .name("bootstrap-root".to_string())
        .spawn(move || {
            if let Err(err) = bootstrap_root(listener, magic) {
                log::error!("bootstrap root: {}", err);
            }
        })?;
    Ok(())
}
