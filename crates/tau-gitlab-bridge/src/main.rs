//! `tau-gitlab-bridge`: GitLab issue ⇄ Matrix room bridge service.

mod bootstrap_helpers;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tau_gitlab_issues_runtime::{
    build_bridge_deps, build_connection_registry, load_bridge_config, serve_bridge,
    BridgeConfig, BridgeServerState,
};
use tokio::net::TcpListener;

use crate::bootstrap_helpers::init_tracing;

#[derive(Debug, Parser)]
#[command(
    name = "tau-gitlab-bridge",
    about = "Bridge GitLab issues into Matrix rooms",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "TAU_GITLAB_BRIDGE_CONFIG",
        default_value = "gitlab-bridge.toml",
        help = "Path to the bridge TOML configuration."
    )]
    config: PathBuf,

    #[arg(
        long,
        env = "TAU_GITLAB_BRIDGE_BIND",
        default_value = "127.0.0.1:9993",
        help = "Address serving GitLab webhooks and homeserver transactions."
    )]
    bind: String,

    #[arg(
        long = "check-config",
        default_value_t = false,
        help = "Validate the configuration, print a summary, and exit."
    )]
    check_config: bool,
}

fn render_config_summary(config: &BridgeConfig) -> String {
    let instances = config
        .gitlab
        .instances
        .keys()
        .cloned()
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "gitlab bridge config ok: homeserver={} instances={} connections={} credentials={} \
         grace_period_ms={}",
        config.matrix.homeserver_url,
        instances,
        config.connections.len(),
        config.credentials.len(),
        config.bridge.comment_grace_period_ms
    )
}

async fn run_cli(cli: Cli) -> Result<()> {
    let config = load_bridge_config(&cli.config)?;
    if cli.check_config {
        println!("{}", render_config_summary(&config));
        return Ok(());
    }

    let bind_addr = cli
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid --bind '{}'", cli.bind))?;
    let deps = build_bridge_deps(&config)?;
    let registry = Arc::new(build_connection_registry(&config, &deps)?);
    let restored = registry.restore_persisted_states().await;
    tracing::info!(
        connections = restored.matched,
        failed = restored.failed,
        "loaded persisted connection state"
    );
    let state = Arc::new(BridgeServerState::from_config(registry.clone(), &config));

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gitlab bridge on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gitlab bridge address")?;
    tracing::info!(
        addr = %local_addr,
        connections = registry.len(),
        "gitlab bridge listening"
    );

    serve_bridge(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    tracing::info!("gitlab bridge stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run_cli(Cli::parse()).await
}
