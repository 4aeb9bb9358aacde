use gatesync::config::Config;
use gatesync::state::{self, DesiredState};
use gatesync::ConfigSynchronizer;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatesync=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(state_path) = args.next().map(PathBuf::from) else {
        anyhow::bail!("usage: gatesync <desired-state.toml|json> [config.toml]");
    };

    // Without a config file, defaults plus NGINX_CUSTOM_CONFIG / NGINX_CONFIG_TMPL apply
    let config = match args.next().map(PathBuf::from) {
        Some(path) => Config::load(&path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::from_env()?,
    };

    let desired = DesiredState::load(&state_path)?;
    info!(
        path = %state_path.display(),
        domains = desired.domains.len(),
        removed = desired.removed.len(),
        "Desired state loaded"
    );

    let sync = ConfigSynchronizer::from_config(&config)?;
    let result = state::apply(&sync, &desired).await?;

    for (domain, outcome, report) in &result.domains {
        if !report.rejected.is_empty() {
            warn!(domain, rejected = ?report.rejected, "Servers rejected by config check");
        }
        if report.truncation_rejected {
            warn!(domain, "Empty server list rejected by config check, old routes still active");
        }
        info!(
            domain,
            upstreams = ?outcome,
            servers = report.committed.len(),
            skipped = report.skipped,
            "Domain synchronized"
        );
    }

    if !result.is_clean() {
        anyhow::bail!("some configuration was not committed, previous state remains active");
    }
    Ok(())
}
