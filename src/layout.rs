//! On-disk layout of the generated configuration tree
//!
//! ```text
//! <base>/nginx.conf
//! <base>/<protocol>/<domain>/servers.conf            joint server + upstream commits
//! <base>/<protocol>/<domain>/<domain>_servers.conf   batch-built server files
//! <base>/stream/<domain>/upstreams.conf
//! ```

use crate::model::{Protocol, RoutingDomain};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Category of generated artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    MainConfig,
    VirtualServers,
    UpstreamPool,
}

/// Resolves artifact paths under a base directory
#[derive(Debug, Clone)]
pub struct ConfigLayout {
    base: PathBuf,
}

impl ConfigLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of an artifact. `protocol` only matters for virtual servers;
    /// upstream pools always live in the stream subtree.
    pub fn path(&self, kind: ConfigKind, protocol: Protocol, domain: &RoutingDomain) -> PathBuf {
        match kind {
            ConfigKind::MainConfig => self.main_config(),
            ConfigKind::VirtualServers => self.server_file(protocol, domain),
            ConfigKind::UpstreamPool => self.upstream_file(domain),
        }
    }

    pub fn main_config(&self) -> PathBuf {
        self.base.join("nginx.conf")
    }

    /// Server file written by joint server + upstream commits
    pub fn server_file(&self, protocol: Protocol, domain: &RoutingDomain) -> PathBuf {
        self.domain_dir(protocol, domain).join("servers.conf")
    }

    /// Server file built entry by entry by batch publishes
    pub fn batch_server_file(&self, protocol: Protocol, domain: &RoutingDomain) -> PathBuf {
        self.domain_dir(protocol, domain)
            .join(format!("{}_servers.conf", domain))
    }

    pub fn upstream_file(&self, domain: &RoutingDomain) -> PathBuf {
        self.domain_dir(Protocol::Stream, domain).join("upstreams.conf")
    }

    /// Directory holding everything a domain owns in one subtree
    pub fn domain_dir(&self, protocol: Protocol, domain: &RoutingDomain) -> PathBuf {
        self.base.join(protocol.as_str()).join(domain.as_str())
    }
}

/// The transient `<path>.bak` sibling used as a rollback point
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}
