use crate::config::{Config, DEFAULT_BIND_ADDR};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name and bind address of this node, fixed for the life of the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub bind_addr: String,
    /// 0 lets the transport pick an ephemeral port
    pub bind_port: u16,
}

impl NodeIdentity {
    pub fn resolve(config: &Config) -> Result<Self> {
        let name = match config.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => generate_name(),
        };
        let (bind_addr, bind_port) = match config.bind.as_deref() {
            Some(addr) if !addr.is_empty() => split_host_port(addr)?,
            _ => (DEFAULT_BIND_ADDR.to_string(), 0),
        };
        Ok(Self {
            name,
            bind_addr,
            bind_port,
        })
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.bind_addr, self.bind_port)
    }
}

/// `<hostname>-<uuid>`
pub fn generate_name() -> String {
    format!("{}-{}", hostname(), Uuid::new_v4())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Split `host:port`; an empty host means the default bind address.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let invalid = || Error::InvalidAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = match host.strip_prefix('[') {
        Some(rest) => rest.strip_suffix(']').ok_or_else(invalid)?,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };
    let host = if host.is_empty() {
        DEFAULT_BIND_ADDR
    } else {
        host
    };
    Ok((host.to_string(), port))
}
