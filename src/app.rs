use crate::{
    api::{self, ApiContext},
    config::Config,
    dcc::{registry, store::DownloadStore, transfer::ProgressSettings},
    irc::{IrcSession, SessionConfig},
};
use anyhow::{Context, bail};
use std::net::{IpAddr, SocketAddr};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let irc_cfg = irc_config(&config)?;

    let store = DownloadStore::new(&config.file_destination);
    store
        .ensure_dir()
        .await
        .context("failed to prepare download directory")?;
    tracing::info!(dest = %store.dest_dir().display(), "download directory ready");

    let session = IrcSession::connect(&irc_cfg)
        .await
        .context("failed to establish IRC session")?;

    let registry = registry::shared();
    let gc = registry::spawn_gc(registry.clone());

    let bind_ip: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid API bind host '{}'", config.host))?;
    let addr = SocketAddr::new(bind_ip, config.port);
    let ctx = ApiContext {
        irc: session.handle(),
        store,
        registry,
        progress: ProgressSettings {
            interval: config.progress_interval(),
            log_step: config.progress_update_percent,
            plain_lines: config.disable_progress_ansi,
        },
    };

    tokio::select! {
        result = api::serve(addr, ctx) => {
            gc.abort();
            session.shutdown("api server failed").await;
            result.context("api server failed")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping");
            gc.abort();
            session.shutdown("xdccd shutting down").await;
        }
    }

    tracing::info!("xdccd stopped");
    Ok(())
}

fn irc_config(config: &Config) -> anyhow::Result<SessionConfig> {
    let (Some(server), Some(nick), Some(channel)) = (
        config.irc_server.clone(),
        config.irc_nick.clone(),
        config.irc_channel.clone(),
    ) else {
        bail!("IRC_SERVER, IRC_NICK and IRC_CHANNEL must be set");
    };
    Ok(SessionConfig {
        server,
        nick,
        channel,
    })
}

async fn shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(error = %error, "no SIGTERM handler; falling back to ctrl-c");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = signal::ctrl_c() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
