//! Target node descriptors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Immutable descriptor of a target system.
///
/// Carries addressing and credential material for the transports a collector
/// source may use, plus a map of log-file aliases to paths. Nodes have no
/// behavior; one is passed by reference into every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    /// Host name, also the identity used in persisted key layouts.
    pub hostname: String,

    /// Network address. Defaults to the hostname when empty.
    #[serde(default)]
    pub netaddr: String,

    /// Free-form node type tag (e.g. "linux", "aix").
    #[serde(default)]
    pub kind: Option<String>,

    /// SSH port.
    #[serde(default)]
    pub ssh_port: Option<u16>,

    /// SSH user.
    #[serde(default)]
    pub ssh_user: Option<String>,

    /// SSH password.
    #[serde(default)]
    pub ssh_password: Option<String>,

    /// SSH private key material.
    #[serde(default)]
    pub ssh_key: Option<String>,

    /// Management API endpoint.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Management API user.
    #[serde(default)]
    pub api_user: Option<String>,

    /// Management API password.
    #[serde(default)]
    pub api_password: Option<String>,

    /// Database user.
    #[serde(default)]
    pub db_user: Option<String>,

    /// Database password.
    #[serde(default)]
    pub db_password: Option<String>,

    /// Database port.
    #[serde(default)]
    pub db_port: Option<u16>,

    /// Log-file aliases to paths.
    #[serde(default)]
    pub files: HashMap<String, String>,
}

impl Node {
    /// Create a node with the given hostname, netaddr defaulting to it.
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            netaddr: hostname.clone(),
            hostname,
            ..Self::default()
        }
    }

    /// Set the network address.
    pub fn with_netaddr(mut self, netaddr: impl Into<String>) -> Self {
        self.netaddr = netaddr.into();
        self
    }
}
