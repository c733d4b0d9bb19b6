use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use syftbox_sync::auth::{run_login, LoginArgs};
use syftbox_sync::config::{Config, ConfigOverrides, DEFAULT_MAX_FILE_SIZE_MB};
use syftbox_sync::daemon::{run_daemon, DaemonOptions};
use syftbox_sync::server::{self, ServerSettings};

#[derive(Parser, Debug)]
#[command(name = "syftbox-sync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Email override (takes precedence over env/config)
    #[arg(long = "email")]
    email: Option<String>,

    /// Data directory override (takes precedence over env/config)
    #[arg(long = "datadir")]
    datadir: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    /// Per-file size cap in MiB
    #[arg(long = "max-file-size-mb")]
    max_file_size_mb: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in to the server and write the config file
    #[command(alias = "init")]
    Login,

    /// Run the client sync daemon
    Daemon,

    /// Run the sync server
    Server {
        /// Address to bind
        #[arg(short = 'a', long = "addr", default_value = "0.0.0.0:5001")]
        addr: String,

        /// Data directory (snapshot, metadata index, users)
        #[arg(long = "data", default_value = "data")]
        data: PathBuf,
    },

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        email,
        datadir,
        server,
        max_file_size_mb,
        command,
    } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());

    match command {
        Some(Commands::Login) => {
            let Some(email) = email else {
                anyhow::bail!("login requires --email");
            };
            run_login(LoginArgs {
                config_path: resolved_config,
                server_url: server.unwrap_or_else(|| Config::default_server_url().to_string()),
                data_dir: datadir.unwrap_or_else(Config::default_data_dir),
                email,
                max_file_size_mb: max_file_size_mb.unwrap_or(DEFAULT_MAX_FILE_SIZE_MB),
            })
            .await
        }
        Some(Commands::Server { addr, data }) => run_server(addr, data, max_file_size_mb).await,
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("{}", detailed_version());
            Ok(())
        }
        Some(Commands::Daemon) | None => {
            // No subcommand runs the daemon.
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                max_file_size_mb,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon(cfg, DaemonOptions::default()).await
        }
    }
}

async fn run_server(addr: String, data: PathBuf, max_file_size_mb: Option<u64>) -> Result<()> {
    syftbox_sync::logging::init_default_log_file()?;
    let mut settings = ServerSettings::new(data);
    if let Some(mb) = max_file_size_mb {
        settings.max_file_size_mb = mb;
    }

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        syftbox_sync::daemon::shutdown_signal().await;
        signal_shutdown.notify_waiters();
    });

    let bound = server::start(settings, &addr, Some(shutdown.clone())).await?;
    println!("sync server listening on {bound}");
    shutdown.notified().await;
    Ok(())
}

fn detailed_version() -> String {
    format!(
        "{} (rust; {}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
