use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const ENV_COMM_ID: &str = "COMM_ID";
pub const ENV_COMM_IF: &str = "COMM_IF";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BootstrapConfig {
    /// Rendezvous endpoint, `<host>:<port>` or `[<ipv6>]:<port>`. When set,
    /// `get_unique_id` does not auto-start the root service and interface
    /// selection is constrained to the subnet of this host.
    pub comm_id: Option<String>,
    /// Interface prefix list, e.g. `"eth"`, `"=eth0"` or `"^docker,lo"`.
    pub if_prefix: Option<String>,
    /// Communicators created by `split` reuse the parent's proxy service.
    pub split_share_proxy: bool,
}

impl BootstrapConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Settings taken from the environment alone.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Environment overrides layered on top of file-based settings.
    pub fn with_env(mut self) -> Self {
        if let Ok(comm_id) = std::env::var(ENV_COMM_ID) {
            if !comm_id.is_empty() {
                self.comm_id = Some(comm_id);
            }
        }
        if let Ok(prefix) = std::env::var(ENV_COMM_IF) {
            if !prefix.is_empty() {
                self.if_prefix = Some(prefix);
            }
        }
        self
    }
}
