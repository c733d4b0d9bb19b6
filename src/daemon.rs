use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::client::SyncClient;
use crate::config::Config;
use crate::manager::SyncManager;
use crate::workspace;

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub log_path: Option<PathBuf>,
}

/// Run the sync daemon on the current runtime until `shutdown` is notified
/// or the manager hits a fatal error.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    opts: DaemonOptions,
    shutdown: Arc<Notify>,
) -> Result<()> {
    match opts.log_path {
        Some(path) => crate::logging::init_log_file(&path)?,
        None => {
            crate::logging::init_default_log_file()?;
        }
    }
    crate::logging::info(format!(
        "daemon start version={} email={} server={}",
        env!("CARGO_PKG_VERSION"),
        cfg.email,
        cfg.server_url
    ));

    workspace::ensure_workspace_layout(&cfg.data_dir, &cfg.email)?;
    let _lock = workspace::WorkspaceLock::try_lock(&cfg.data_dir)
        .context("another sync process owns this workspace")?;

    let client = SyncClient::new(&cfg.server_url, &cfg.email, cfg.access_token.as_deref())?;
    if let Err(e) = client.healthz().await {
        crate::logging::warn(format!("server health check failed, will keep retrying: {e}"));
    }

    let manager = SyncManager::new(&cfg, client)?;
    let mut handle = manager.start();

    tokio::select! {
        _ = shutdown.notified() => {
            crate::logging::info("shutdown requested, stopping after the current tick");
        }
        result = handle.wait() => {
            // The loop only returns on its own when something fatal happened.
            return result.map_err(|e| anyhow::anyhow!("{e}"));
        }
    }

    handle.stop().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Convenience entrypoint: wire SIGINT/SIGTERM to a clean shutdown between
/// ticks.
pub async fn run_daemon(cfg: Config, opts: DaemonOptions) -> Result<()> {
    let shutdown = Arc::new(Notify::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.notify_waiters();
    });
    run_daemon_with_shutdown(cfg, opts, shutdown).await
}

/// Resolves when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
