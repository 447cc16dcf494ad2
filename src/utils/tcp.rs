use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

/// Interval at which blocking operations wake up to observe the abort flag.
pub const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: i32 = 16384;

/// Encoded size of a socket address, padded so fixed-slot tables can hold
/// either family.
pub const SOCKET_ADDR_WIRE_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum TcpError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("blocking operation observed the abort flag")]
    Aborted,
}

fn check_abort(abort: Option<&AtomicU32>) -> Result<(), TcpError> {
    match abort {
        Some(flag) if flag.load(Ordering::Relaxed) != 0 => Err(TcpError::Aborted),
        _ => Ok(()),
    }
}

// Read/write timeouts surface as WouldBlock or TimedOut depending on platform.
fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

pub fn listen(addr: &SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    // accept() polls so it can observe the abort flag
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(ABORT_POLL_INTERVAL))?;
    stream.set_write_timeout(Some(ABORT_POLL_INTERVAL))?;
    Ok(())
}

/// Accepts the next connection that presents the expected magic. Connections
/// with a mismatched magic are dropped and the wait continues.
pub fn accept(
    listener: &TcpListener,
    magic: u64,
    abort: Option<&AtomicU32>,
) -> Result<TcpStream, TcpError> {
    loop {
        match listener.accept() {
            Ok((mut stream, _)) => match handshake(&mut stream, magic, abort) {
                Ok(true) => return Ok(stream),
                Ok(false) => (),
                Err(TcpError::Aborted) => return Err(TcpError::Aborted),
                // a peer dying mid-handshake must not take down the listener
                Err(TcpError::Io(err)) => {
                    log::warn!("tcp accept: handshake failed: {}", err);
                }
            },
            Err(ref err) if is_poll_timeout(err) => {
                check_abort(abort)?;
                std::thread::sleep(ABORT_POLL_INTERVAL);
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err.into()),
        }
    }
}

fn handshake(
    stream: &mut TcpStream,
    magic: u64,
    abort: Option<&AtomicU32>,
) -> Result<bool, TcpError> {
    prepare_stream(stream)?;
    let mut buf = [0u8; std::mem::size_of::<u64>()];
    recv_exact(stream, &mut buf, abort)?;
    let recv_magic = LittleEndian::read_u64(&buf);
    if recv_magic != magic {
        log::warn!(
            "tcp accept: invalid magic {:#x} != {:#x}",
            recv_magic,
            magic
        );
        return Ok(false);
    }
    Ok(true)
}

pub fn connect(
    addr: &SocketAddr,
    magic: u64,
    abort: Option<&AtomicU32>,
) -> Result<TcpStream, TcpError> {
    let mut stream = loop {
        check_abort(abort)?;
        match TcpStream::connect_timeout(addr, CONNECT_POLL_INTERVAL) {
            Ok(stream) => break stream,
            Err(ref err) if is_poll_timeout(err) => (),
            Err(err) => return Err(err.into()),
        }
    };
    prepare_stream(&stream)?;
    let mut buf = [0u8; std::mem::size_of::<u64>()];
    LittleEndian::write_u64(&mut buf, magic);
    send_exact(&mut stream, &buf, abort)?;
    Ok(stream)
}

pub fn send_exact(
    stream: &mut TcpStream,
    data: &[u8],
    abort: Option<&AtomicU32>,
) -> Result<(), TcpError> {
    let mut sent = 0;
    while sent < data.len() {
        match stream.write(&data[sent..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => sent += n,
            Err(ref err) if is_poll_timeout(err) => check_abort(abort)?,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub fn recv_exact(
    stream: &mut TcpStream,
    data: &mut [u8],
    abort: Option<&AtomicU32>,
) -> Result<(), TcpError> {
    let mut received = 0;
    while received < data.len() {
        match stream.read(&mut data[received..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => received += n,
            Err(ref err) if is_poll_timeout(err) => check_abort(abort)?,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub fn encode_socket_addr<B: BufMut>(sock_addr: &SocketAddr, buf: &mut B) {
    match sock_addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(4);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(6);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
            buf.put_u32(addr.flowinfo());
            buf.put_u32(addr.scope_id());
        }
    }
}

pub fn decode_socket_addr<B: Buf>(buf: &mut B) -> SocketAddr {
    let addr_type = buf.get_u8();
    match addr_type {
        4 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port))
        }
        6 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            let flowinfo = buf.get_u32();
            let scope_id = buf.get_u32();
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            ))
        }
        _ => panic!("unexpected address type"),
    }
}
