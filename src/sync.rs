//! Public entry point: render, lock, write and commit proxy configuration
//!
//! Every operation on a routing domain holds that domain's lock for its whole
//! duration (render, write, validate, rollback or cleanup). Operations on
//! different domains run in parallel; only the validator sees the whole tree.

use crate::command::{
    CleanupFilter, CommandNormalizer, CommandValidator, ConfigValidator, SqueezeBlankLines,
    TextNormalizer,
};
use crate::config::Config;
use crate::error::SyncError;
use crate::layout::ConfigLayout;
use crate::locks::TenantLocks;
use crate::model::{
    MainConfig, Protocol, ProxySettings, RoutingDomain, ServerContext, UpstreamContext,
    UpstreamPool, VirtualServer,
};
use crate::template::Templates;
use crate::writer::{run_to_completion, ConfigWriter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

/// Result of a publish that does not surface validator rejections as errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The new content is live
    Committed,
    /// The validator refused the tree; the previous content is live
    Rejected,
    /// Nothing could be rendered, nothing touched disk
    Skipped,
}

/// Per-entry results of an incrementally built server file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Labels of servers now present in the file
    pub committed: Vec<String>,
    /// Labels of servers the validator refused
    pub rejected: Vec<String>,
    /// Servers whose template rendering failed
    pub skipped: usize,
    /// An empty server list was refused; the previous routes stay live
    pub truncation_rejected: bool,
}

impl BatchReport {
    /// Every entry made it into the file
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty() && self.skipped == 0 && !self.truncation_rejected
    }
}

/// Synchronizes the desired proxy state into the on-disk configuration tree
pub struct ConfigSynchronizer<V, N> {
    layout: ConfigLayout,
    templates: Templates<N>,
    writer: ConfigWriter<V>,
    locks: TenantLocks,
    /// Serializes writes of the global nginx.conf, which belongs to no domain
    main_lock: Arc<Mutex<()>>,
}

impl ConfigSynchronizer<CommandValidator, CleanupFilter> {
    /// Build the production synchronizer: subprocess validator and filter,
    /// templates loaded from `config.template_dir`.
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let validator = CommandValidator::from_command_line(&config.check.command)?
            .with_timeout(config.check.timeout());
        let filter = if config.cleanup.builtin {
            CleanupFilter::Builtin(SqueezeBlankLines)
        } else {
            CleanupFilter::Command(
                CommandNormalizer::from_command_line(&config.cleanup.command)?
                    .with_timeout(config.cleanup.timeout()),
            )
        };
        let templates = Templates::load(&config.template_dir, config.buffer_size, filter)?;

        info!(
            config_dir = %config.config_dir.display(),
            template_dir = %config.template_dir.display(),
            check = %validator.program(),
            "Config synchronizer ready"
        );
        Ok(Self::new(&config.config_dir, templates, validator))
    }
}

impl<V: ConfigValidator, N: TextNormalizer> ConfigSynchronizer<V, N> {
    pub fn new(config_dir: &Path, templates: Templates<N>, validator: V) -> Self {
        Self {
            layout: ConfigLayout::new(config_dir),
            templates,
            writer: ConfigWriter::new(validator),
            locks: TenantLocks::new(),
            main_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Root of the generated configuration tree
    pub fn config_dir(&self) -> &Path {
        self.layout.base()
    }

    pub fn layout(&self) -> &ConfigLayout {
        &self.layout
    }

    pub fn validator(&self) -> &V {
        self.writer.validator()
    }

    /// Number of routing domains written so far
    pub fn domains_seen(&self) -> usize {
        self.locks.len()
    }

    /// Render and commit the global `nginx.conf`.
    ///
    /// Render and validation failures are returned to the caller; there is
    /// no smaller unit to fall back to.
    pub async fn publish_main_config(&self, config: &MainConfig) -> Result<(), SyncError> {
        let guard = Arc::clone(&self.main_lock).lock_owned().await;
        let body = self.templates.main.render(config).await?;
        let path = self.layout.main_config();
        let (_guard, result) = self.write_detached(guard, true, body, path.clone()).await?;
        result?;
        info!(path = %path.display(), "Main config committed");
        Ok(())
    }

    /// Commit one virtual server together with its upstream pool.
    ///
    /// Both files are written, the tree is validated once, and on rejection
    /// both are rolled back before [`SyncError::Validation`] is returned. A
    /// render failure for either artifact is logged and nothing is written.
    pub async fn publish_virtual_server_and_upstream(
        &self,
        first: bool,
        settings: &ProxySettings,
        protocol: Protocol,
        domain: &str,
        server: &VirtualServer,
        upstream: &UpstreamPool,
    ) -> Result<Outcome, SyncError> {
        let domain = RoutingDomain::parse(domain)?;
        let guard = self.locks.acquire(&domain).await;

        let server_body = match self
            .templates
            .server
            .render(&ServerContext { server, set: settings })
            .await
        {
            Ok(body) => body,
            Err(e) => {
                error!(%domain, server = server.label(), error = %e, "Create server config by template failure, ignore it");
                return Ok(Outcome::Skipped);
            }
        };
        let upstream_body = match self
            .templates
            .upstream
            .render(&UpstreamContext { upstream, set: settings })
            .await
        {
            Ok(body) => body,
            Err(e) => {
                error!(%domain, upstream = %upstream.name, error = %e, "Create upstream config by template failure, ignore it");
                return Ok(Outcome::Skipped);
            }
        };

        let upstream_file = self.layout.upstream_file(&domain);
        let server_file = self.layout.server_file(protocol, &domain);
        let writer = self.writer.clone();
        let (_guard, result) = run_to_completion(guard, async move {
            writer
                .write_checked_all(
                    first,
                    &[
                        (upstream_body.as_slice(), upstream_file.as_path()),
                        (server_body.as_slice(), server_file.as_path()),
                    ],
                )
                .await
        })
        .await?;

        match result {
            Ok(()) => {
                info!(%domain, server = server.label(), upstream = %upstream.name, "Server and upstream committed");
                Ok(Outcome::Committed)
            }
            Err(e) => {
                if e.is_validation() {
                    error!(%domain, server = server.label(), error = %e, "Server config error, rolled back");
                }
                Err(e)
            }
        }
    }

    /// Build the domain's server file one entry at a time.
    ///
    /// The first successfully committed entry replaces the file, later ones
    /// are appended. Each entry is validated on its own, so a rejected entry
    /// is dropped while the entries before it stay committed. An empty list
    /// truncates the file.
    pub async fn publish_virtual_servers(
        &self,
        settings: &ProxySettings,
        protocol: Protocol,
        domain: &str,
        servers: &[VirtualServer],
    ) -> Result<BatchReport, SyncError> {
        let domain = RoutingDomain::parse(domain)?;
        let mut guard = self.locks.acquire(&domain).await;
        let path = self.layout.batch_server_file(protocol, &domain);
        let mut report = BatchReport::default();

        if servers.is_empty() {
            warn!(%domain, path = %path.display(), "Proxy list is empty, server config will be cleaned up");
            let (_guard, result) = self.write_detached(guard, true, Vec::new(), path).await?;
            match result {
                Ok(()) => {}
                Err(e) if e.is_validation() => {
                    error!(%domain, error = %e, "Empty server config rejected, previous routes stay active");
                    report.truncation_rejected = true;
                }
                Err(e) => return Err(e),
            }
            return Ok(report);
        }

        let mut first = true;
        for server in servers {
            let body = match self
                .templates
                .server
                .render(&ServerContext { server, set: settings })
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    error!(%domain, server = server.label(), error = %e, "Create server config by template failure");
                    report.skipped += 1;
                    continue;
                }
            };

            let (returned, result) = self.write_detached(guard, first, body, path.clone()).await?;
            guard = returned;
            match result {
                Ok(()) => {
                    first = false;
                    report.committed.push(server.label().to_string());
                }
                Err(e) if e.is_validation() => {
                    error!(%domain, server = server.label(), error = %e, "Server config error, will ignore it");
                    report.rejected.push(server.label().to_string());
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            %domain,
            committed = report.committed.len(),
            rejected = report.rejected.len(),
            skipped = report.skipped,
            "Server config published"
        );
        Ok(report)
    }

    /// Replace the domain's upstream file with all `pools` in a single commit.
    ///
    /// Pools that fail to render are left out; a validator rejection keeps the
    /// previous file and yields [`Outcome::Rejected`].
    pub async fn publish_upstream_pools(
        &self,
        settings: &ProxySettings,
        domain: &str,
        pools: &[UpstreamPool],
    ) -> Result<Outcome, SyncError> {
        let domain = RoutingDomain::parse(domain)?;
        let guard = self.locks.acquire(&domain).await;
        let path = self.layout.upstream_file(&domain);

        let mut body = Vec::new();
        for upstream in pools {
            match self
                .templates
                .upstream
                .render(&UpstreamContext { upstream, set: settings })
                .await
            {
                Ok(rendered) => {
                    body.extend_from_slice(&rendered);
                    body.push(b'\n');
                }
                Err(e) => {
                    error!(%domain, upstream = %upstream.name, error = %e, "Create upstream config by template failure");
                }
            }
        }

        let (_guard, result) = self.write_detached(guard, true, body, path).await?;
        match result {
            Ok(()) => {
                info!(%domain, pools = pools.len(), "Upstream config committed");
                Ok(Outcome::Committed)
            }
            Err(e) if e.is_validation() => {
                error!(%domain, error = %e, "Upstream config check error");
                Ok(Outcome::Rejected)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove everything a decommissioned domain owns. Already-absent
    /// directories are not an error.
    pub async fn clear_domain(&self, domain: &str) -> Result<(), SyncError> {
        let domain = RoutingDomain::parse(domain)?;
        let guard = self.locks.acquire(&domain).await;
        let dirs: Vec<PathBuf> = [Protocol::Http, Protocol::Stream]
            .into_iter()
            .map(|protocol| self.layout.domain_dir(protocol, &domain))
            .collect();

        let (_guard, result) = run_to_completion(guard, remove_dirs(dirs)).await?;
        result
    }

    /// One write-and-commit on a detached task that owns `guard` until done
    async fn write_detached(
        &self,
        guard: OwnedMutexGuard<()>,
        first: bool,
        body: Vec<u8>,
        path: PathBuf,
    ) -> Result<(OwnedMutexGuard<()>, Result<(), SyncError>), SyncError> {
        let writer = self.writer.clone();
        run_to_completion(guard, async move { writer.write_checked(first, &body, &path).await }).await
    }
}

async fn remove_dirs(dirs: Vec<PathBuf>) -> Result<(), SyncError> {
    for dir in dirs {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!(path = %dir.display(), "Domain config removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::io("remove", dir, e)),
        }
    }
    Ok(())
}
