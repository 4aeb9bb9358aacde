//! Desired-state documents and one-shot application
//!
//! A [`DesiredState`] is a snapshot of what the watcher would hand in: the
//! global config, per-domain servers and pools, and domains to tear down.

use crate::command::{ConfigValidator, TextNormalizer};
use crate::error::SyncError;
use crate::model::{MainConfig, Protocol, UpstreamPool, VirtualServer};
use crate::sync::{BatchReport, ConfigSynchronizer, Outcome};
use anyhow::Context;
use futures::future::join_all;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Everything to publish in one pass
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DesiredState {
    /// Global nginx.conf; left untouched when absent
    pub main: Option<MainConfig>,
    pub domains: Vec<DomainState>,
    /// Domains whose configuration should be removed
    pub removed: Vec<String>,
}

/// Servers and pools of one routing domain
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DomainState {
    pub name: String,
    pub protocol: Protocol,
    pub servers: Vec<VirtualServer>,
    pub upstreams: Vec<UpstreamPool>,
}

impl DesiredState {
    /// Load from a `.json` file, or TOML for any other extension
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read desired state {}", path.display()))?;
        let state = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        Ok(state)
    }
}

/// Result of applying a [`DesiredState`]
#[derive(Debug, Default)]
pub struct ApplyResult {
    pub main_committed: bool,
    /// Per domain: upstream outcome and server batch report
    pub domains: Vec<(String, Outcome, BatchReport)>,
    pub removed: Vec<String>,
}

impl ApplyResult {
    /// Every artifact was committed
    pub fn is_clean(&self) -> bool {
        self.domains
            .iter()
            .all(|(_, outcome, report)| *outcome == Outcome::Committed && report.is_complete())
    }
}

/// Publish `state`: removals first, then every domain concurrently (pools
/// before the servers referring to them), then the main config so its
/// includes see the final tree.
pub async fn apply<V, N>(
    sync: &ConfigSynchronizer<V, N>,
    state: &DesiredState,
) -> Result<ApplyResult, SyncError>
where
    V: ConfigValidator,
    N: TextNormalizer,
{
    let mut result = ApplyResult::default();
    let settings = state
        .main
        .as_ref()
        .map(|m| m.settings.clone())
        .unwrap_or_default();

    for name in &state.removed {
        sync.clear_domain(name).await?;
        result.removed.push(name.clone());
    }

    let publishes = state.domains.iter().map(|domain| {
        let settings = &settings;
        async move {
            let outcome = sync
                .publish_upstream_pools(settings, &domain.name, &domain.upstreams)
                .await?;
            let report = sync
                .publish_virtual_servers(settings, domain.protocol, &domain.name, &domain.servers)
                .await?;
            Ok::<_, SyncError>((domain.name.clone(), outcome, report))
        }
    });
    for published in join_all(publishes).await {
        result.domains.push(published?);
    }

    if let Some(main) = &state.main {
        sync.publish_main_config(main).await?;
        result.main_committed = true;
    }

    info!(
        domains = result.domains.len(),
        removed = result.removed.len(),
        main = result.main_committed,
        "Desired state applied"
    );
    Ok(result)
}
