//! Rendering inputs: the global proxy settings, virtual servers and upstream pools
//!
//! These types are plain data handed in by the desired-state watcher. They are
//! serialized into the template context, so field names are what templates see.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the routing domain used when none is given
pub const DEFAULT_DOMAIN: &str = "default";

/// Process-wide proxy options needed by every template.
///
/// Passed by reference into each render as an immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxySettings {
    /// Default HTTP listen port
    pub http_port: u16,
    /// Default HTTPS listen port
    pub https_port: u16,
    /// Listen on IPv6 as well as IPv4
    pub enable_ipv6: bool,
    /// Keepalive timeout for client connections in seconds
    pub keepalive_timeout_secs: u64,
    /// Timeout for establishing upstream connections in seconds
    pub proxy_connect_timeout_secs: u64,
    /// Timeout for reading upstream responses in seconds
    pub proxy_read_timeout_secs: u64,
    /// Maximum accepted request body size, nginx syntax (e.g. "10m")
    pub client_max_body_size: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            enable_ipv6: false,
            keepalive_timeout_secs: 60,
            proxy_connect_timeout_secs: 5,
            proxy_read_timeout_secs: 60,
            client_max_body_size: "10m".to_string(),
        }
    }
}

/// Data for the global `nginx.conf`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MainConfig {
    pub user: String,
    /// Worker process count, "auto" or a number
    pub worker_processes: String,
    pub worker_connections: u32,
    pub error_log: String,
    pub pid_file: String,
    /// Settings shared with server and upstream templates
    pub settings: ProxySettings,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            worker_processes: "auto".to_string(),
            worker_connections: 4000,
            error_log: "/dev/stderr".to_string(),
            pid_file: "/run/nginx.pid".to_string(),
            settings: ProxySettings::default(),
        }
    }
}

/// One routing rule of a virtual server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Location {
    /// URI prefix matched by this rule
    pub path: String,
    /// Name of the upstream pool requests are proxied to
    pub upstream: String,
    /// Extra headers set on proxied requests
    pub headers: BTreeMap<String, String>,
}

/// One proxy listener with its routing rules
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VirtualServer {
    /// Listen address, e.g. ":80" or "0.0.0.0:5000"
    pub listen: String,
    /// Host match pattern; empty for address-only (stream) servers
    pub server_name: String,
    /// Upstream for stream servers, which have no locations
    pub proxy_pass: Option<String>,
    pub ssl_certificate: Option<String>,
    pub ssl_certificate_key: Option<String>,
    pub locations: Vec<Location>,
}

impl VirtualServer {
    pub fn new(listen: &str, server_name: &str) -> Self {
        Self {
            listen: listen.to_string(),
            server_name: server_name.to_string(),
            ..Default::default()
        }
    }

    /// Add a routing rule to an upstream pool
    pub fn with_location(mut self, path: &str, upstream: &str) -> Self {
        self.locations.push(Location {
            path: path.to_string(),
            upstream: upstream.to_string(),
            headers: BTreeMap::new(),
        });
        self
    }

    /// Label used in logs: the server name, or the listen address when unnamed
    pub fn label(&self) -> &str {
        if self.server_name.is_empty() {
            &self.listen
        } else {
            &self.server_name
        }
    }
}

/// A backend endpoint of an upstream pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    /// "host:port"
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Unhealthy endpoints are still rendered, marked down
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_healthy() -> bool {
    true
}

impl Endpoint {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            weight: default_weight(),
            healthy: default_healthy(),
        }
    }
}

/// A named set of backend endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamPool {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    /// Balancing directive, e.g. "least_conn"; round robin when unset
    pub balance: Option<String>,
}

impl UpstreamPool {
    pub fn new(name: &str, addresses: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            endpoints: addresses.iter().map(|a| Endpoint::new(a)).collect(),
            balance: None,
        }
    }

    /// Number of endpoints currently marked healthy
    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.healthy).count()
    }
}

/// Template context for a virtual server
#[derive(Debug, Serialize)]
pub struct ServerContext<'a> {
    pub server: &'a VirtualServer,
    pub set: &'a ProxySettings,
}

/// Template context for an upstream pool
#[derive(Debug, Serialize)]
pub struct UpstreamContext<'a> {
    pub upstream: &'a UpstreamPool,
    pub set: &'a ProxySettings,
}

/// Configuration subtree a virtual server file is written under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP-style virtual servers (`<base>/http`)
    #[default]
    Http,
    /// TCP/UDP stream servers and upstream pools (`<base>/stream`)
    Stream,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Stream => "stream",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing domain (tenant); doubles as a directory name on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingDomain(String);

impl RoutingDomain {
    /// Parse a domain name, mapping the empty string to [`DEFAULT_DOMAIN`].
    ///
    /// The name must be usable as a single path component.
    pub fn parse(name: &str) -> Result<Self, SyncError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Self::default());
        }
        if name == "."
            || name == ".."
            || name.contains(['/', '\\', '\0'])
        {
            return Err(SyncError::InvalidDomain(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoutingDomain {
    fn default() -> Self {
        Self(DEFAULT_DOMAIN.to_string())
    }
}

impl fmt::Display for RoutingDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
