use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;

use crate::hawser::{config, logging, ssh::SshConnector, tunnel::Tunnel};

#[derive(Debug, Default)]
pub struct Options {
    pub config_path: Option<PathBuf>,
    pub overrides: config::Overrides,
    pub run_for: Option<Duration>,
}

pub async fn run(opts: Options) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(opts.config_path)?;
    let file = match &resolved {
        Some(r) => Some(
            config::load_file(&r.path)
                .with_context(|| format!("load config: {}", r.path.display()))?,
        ),
        None => None,
    };
    let cfg = config::Config::resolve(file, opts.overrides)?;

    let _log_guard = logging::init(&cfg.logging)?;

    if let Some(r) = &resolved {
        tracing::info!(path = %r.path.display(), source = %r.source, "config: loaded");
    }

    tracing::info!(
        ssh = %cfg.ssh.address(),
        user = %cfg.ssh.user,
        orientation = %cfg.tunnel.orientation,
        local = %cfg.tunnel.local_addr,
        remote = %cfg.tunnel.remote_addr,
        "hawser: starting"
    );

    let connector = Arc::new(SshConnector::new(cfg.ssh.clone(), cfg.tunnel.dial_timeout));
    let tunnel = Tunnel::new(cfg.tunnel.clone(), connector);
    tunnel.start();

    match opts.run_for {
        Some(d) => {
            tokio::select! {
                _ = tokio::time::sleep(d) => {
                    tracing::info!(after = %humantime::format_duration(d), "hawser: run duration elapsed");
                }
                res = tokio::signal::ctrl_c() => {
                    res.context("wait for ctrl-c")?;
                    tracing::info!("hawser: interrupt received");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            tracing::info!("hawser: interrupt received");
        }
    }

    tunnel.close().await;
    Ok(())
}
