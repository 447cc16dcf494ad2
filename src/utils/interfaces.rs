use std::net::{IpAddr, SocketAddr};

use atoi::atoi;
use nix::sys::socket::SockaddrLike;
use socket2::SockAddr;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetInterfaceError {
    #[error("failed to parse interface prefix list: {0}")]
    ParsePrefix(String),
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

pub struct NetInterfaceSpec {
    pub prefix: String,
    pub port: Option<u16>,
}

/// Parses a comma-separated interface prefix list; an entry may carry a
/// `:port` suffix.
pub fn parse_prefix_list(prefix_list: &str) -> Result<Vec<NetInterfaceSpec>, NetInterfaceError> {
    if !prefix_list.is_ascii() {
        return Err(NetInterfaceError::ParsePrefix(prefix_list.to_string()));
    }
    let mut specs = Vec::new();
    for entry in prefix_list.split(',') {
        match entry.split_once(':') {
            Some((prefix, port)) => {
                if prefix.is_empty() {
                    continue;
                }
                let port = atoi::<u16>(port.as_bytes())
                    .ok_or_else(|| NetInterfaceError::ParsePrefix(prefix_list.to_string()))?;
                specs.push(NetInterfaceSpec {
                    prefix: prefix.to_string(),
                    port: Some(port),
                });
            }
            None => {
                if !entry.is_empty() {
                    specs.push(NetInterfaceSpec {
                        prefix: entry.to_string(),
                        port: None,
                    });
                }
            }
        }
    }
    Ok(specs)
}

/// An empty spec list matches everything.
pub fn match_interface_list(
    name: &str,
    port: Option<u16>,
    specs: &[NetInterfaceSpec],
    match_exact: bool,
) -> bool {
    if specs.is_empty() {
        return true;
    }
    specs.iter().any(|spec| {
        if let (Some(spec_port), Some(port)) = (spec.port, port) {
            if spec_port != port {
                return false;
            }
        }
        if match_exact {
            spec.prefix == name
        } else {
            name.starts_with(&spec.prefix)
        }
    })
}

// getifaddrs hands back nix sockaddr storage; round-trip it through socket2
// to reach a std SocketAddr without depending on the nix accessor surface.
fn sockaddr_to_std<S: SockaddrLike>(addr: &S) -> Option<SocketAddr> {
    let sockaddr_ptr = addr.as_ptr();
    let sockaddr_len = addr.len();
    let (_, sock_addr) = unsafe {
        SockAddr::try_init(|storage, len| {
            std::ptr::copy_nonoverlapping(
                sockaddr_ptr as *const u8,
                storage as *mut u8,
                sockaddr_len as usize,
            );
            *len = sockaddr_len;
            Ok(())
        })
    }
    .ok()?;
    sock_addr.as_socket()
}

fn find_interfaces_with_prefix(
    mut prefix_list: &str,
    max_num_interfaces: usize,
) -> Result<Vec<(String, SocketAddr)>, NetInterfaceError> {
    if !prefix_list.is_ascii() {
        return Err(NetInterfaceError::ParsePrefix(prefix_list.to_string()));
    }
    let search_not = prefix_list.starts_with('^');
    if search_not {
        prefix_list = &prefix_list[1..];
    }
    let search_exact = prefix_list.starts_with('=');
    if search_exact {
        prefix_list = &prefix_list[1..];
    }
    let specs = parse_prefix_list(prefix_list)?;

    let mut interfaces: Vec<(String, SocketAddr)> = Vec::new();
    for interface in nix::ifaddrs::getifaddrs()? {
        let addr = match interface.address.as_ref().and_then(sockaddr_to_std) {
            Some(addr) => addr,
            None => continue,
        };
        if let SocketAddr::V6(sa) = &addr {
            if sa.ip().is_loopback() {
                continue;
            }
        }
        log::trace!("found interface {}: {}", interface.interface_name, addr);

        let if_name = interface.interface_name.as_str();
        if !(match_interface_list(if_name, None, &specs, search_exact) ^ search_not) {
            continue;
        }
        if interfaces.iter().any(|(name, _)| name == if_name) {
            continue;
        }
        interfaces.push((interface.interface_name, addr));
        if interfaces.len() >= max_num_interfaces {
            break;
        }
    }
    Ok(interfaces)
}

/// Enumerates usable interfaces. With no explicit prefix list the search
/// prefers RDMA-style interfaces, then anything that is neither docker nor
/// loopback, then docker, then loopback.
pub fn find_interfaces(
    specified_prefix: Option<&str>,
    max_num_interfaces: usize,
) -> Result<Vec<(String, SocketAddr)>, NetInterfaceError> {
    if let Some(prefix_list) = specified_prefix {
        return find_interfaces_with_prefix(prefix_list, max_num_interfaces);
    }
    for prefix_list in ["ib", "^docker,lo", "docker", "lo"] {
        let interfaces = find_interfaces_with_prefix(prefix_list, max_num_interfaces)?;
        if !interfaces.is_empty() {
            return Ok(interfaces);
        }
    }
    Ok(Vec::new())
}

/// Finds the interface whose subnet contains `remote`, used when a
/// rendezvous endpoint pins the bootstrap network.
pub fn find_interface_match_subnet(
    remote: &SocketAddr,
) -> Result<Option<(String, SocketAddr)>, NetInterfaceError> {
    for interface in nix::ifaddrs::getifaddrs()? {
        let addr = match interface.address.as_ref().and_then(sockaddr_to_std) {
            Some(addr) => addr,
            None => continue,
        };
        let netmask = match interface.netmask.as_ref().and_then(sockaddr_to_std) {
            Some(mask) => mask,
            None => continue,
        };
        if subnet_match(addr.ip(), remote.ip(), netmask.ip()) {
            log::trace!(
                "interface {} ({}) matches subnet of {}",
                interface.interface_name,
                addr,
                remote
            );
            return Ok(Some((interface.interface_name, addr)));
        }
    }
    Ok(None)
}

fn subnet_match(local: IpAddr, remote: IpAddr, mask: IpAddr) -> bool {
    match (local, remote, mask) {
        (IpAddr::V4(local), IpAddr::V4(remote), IpAddr::V4(mask)) => {
            u32::from(local) & u32::from(mask) == u32::from(remote) & u32::from(mask)
        }
        (IpAddr::V6(local), IpAddr::V6(remote), IpAddr::V6(mask)) => {
            u128::from(local) & u128::from(mask) == u128::from(remote) & u128::from(mask)
        }
        _ => false,
    }
}
