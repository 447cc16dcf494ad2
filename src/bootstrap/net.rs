use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Mutex;

use crate::config::BootstrapConfig;
use crate::utils::interfaces;

use super::task::bootstrap_create_root;
use super::{BootstrapError, BootstrapHandle};

/// Interface every bootstrap listener binds to, chosen once per process.
#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub addr: SocketAddr,
}

static BOOTSTRAP_NET: Mutex<Option<NetInterface>> = Mutex::new(None);

/// Selects the bootstrap interface on first use and memoizes it for the
/// lifetime of the process; later calls return the cached choice regardless
/// of configuration.
pub fn bootstrap_net_init(config: &BootstrapConfig) -> Result<NetInterface, BootstrapError> {
    let mut selected = BOOTSTRAP_NET.lock().unwrap();
    if let Some(interface) = selected.as_ref() {
        return Ok(interface.clone());
    }
    let interface = select_interface(config)?;
    log::info!(
        "bootstrap: using interface {} ({})",
        interface.name,
        interface.addr
    );
    *selected = Some(interface.clone());
    Ok(interface)
}

fn select_interface(config: &BootstrapConfig) -> Result<NetInterface, BootstrapError> {
    if let Some(comm_id) = config.comm_id.as_deref() {
        // a pinned rendezvous endpoint constrains us to its subnet
        let remote = parse_comm_id(comm_id)?;
        let (name, mut addr) = interfaces::find_interface_match_subnet(&remote)?
            .ok_or(BootstrapError::NoInterfaceForSubnet(remote))?;
        addr.set_port(0);
        return Ok(NetInterface { name, addr });
    }
    let mut found = interfaces::find_interfaces(config.if_prefix.as_deref(), 1)?;
    if found.is_empty() {
        return Err(BootstrapError::NoInterface);
    }
    let (name, mut addr) = found.swap_remove(0);
    addr.set_port(0);
    Ok(NetInterface { name, addr })
}

/// Parses `<host>:<port>` / `[<ipv6>]:<port>`, resolving hostnames.
pub fn parse_comm_id(comm_id: &str) -> Result<SocketAddr, BootstrapError> {
    comm_id
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| BootstrapError::InvalidCommId(comm_id.to_string()))
}

/// Produces the handle the application distributes to every rank.
///
/// Without a configured rendezvous endpoint this binds the root listener on
/// the bootstrap interface, spawns the root service and records the bound
/// address in the handle. With `comm_id` set the root is *not* started: the
/// application must run one at that address by calling
/// `bootstrap_create_root` on exactly one process.
pub fn get_unique_id(config: &BootstrapConfig) -> Result<BootstrapHandle, BootstrapError> {
    let magic: u64 = rand::random();

    if let Some(comm_id) = config.comm_id.as_deref() {
        log::info!("rendezvous endpoint set to {}, root is managed externally", comm_id);
        let addr = parse_comm_id(comm_id)?;
        return Ok(BootstrapHandle { addr, magic });
    }

    let interface = bootstrap_net_init(config)?;
    let mut handle = BootstrapHandle {
        addr: interface.addr,
        magic,
    };
    bootstrap_create_root(&mut handle)?;
    Ok(handle)
}
