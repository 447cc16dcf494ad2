//! Out-of-band bootstrap control plane: rendezvous, ring wiring and small
//! control-message exchange for a multi-rank collective communication
//! library.

pub mod bootstrap;
pub mod config;
pub mod proxy;
pub mod utils;

pub use bootstrap::{
    bootstrap_create_root, bootstrap_net_init, bootstrap_root, get_unique_id, AbortFlag,
    BootstrapError, BootstrapHandle, BootstrapState,
};
pub use config::BootstrapConfig;
