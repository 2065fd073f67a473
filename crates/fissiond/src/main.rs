//! fissiond — the Fission daemon.
//!
//! One binary for every core component:
//! - Executor (function → serving address, pools, idle reaping)
//! - Router (HTTP triggers, retrying proxy)
//! - Builder manager (source packages → deployment archives)
//!
//! Each runs on its own with a subcommand, or all together with
//! `standalone`.
//!
//! # Usage
//!
//! ```text
//! fissiond standalone --config fission.toml --resources resources.json
//! fissiond executor --port 8888 --data-dir /var/lib/fission
//! fissiond router --port 8080 --log-format json
//! ```

mod seed;
mod services;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::services::Daemon;

const DEFAULT_LOG_FILTER: &str = "info,fissiond=debug,fission=debug";

#[derive(Parser)]
#[command(name = "fissiond", about = "Fission daemon", version)]
struct Cli {
    /// `fission.toml`; every setting has a default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Directory holding the catalog file. The catalog is in-memory when
    /// omitted.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON file of resources applied to the catalog at start-up.
    #[arg(long, global = true)]
    resources: Option<PathBuf>,

    /// IP the in-process orchestrator assigns to every pod.
    #[arg(long, global = true)]
    pod_ip: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the executor API.
    Executor {
        #[arg(long, default_value = "8888")]
        port: u16,
    },
    /// Serve HTTP triggers, asking the configured executor for addresses.
    Router {
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Build source packages through environment builders.
    Buildermgr,
    /// Executor, router and builder manager in one process.
    Standalone {
        #[arg(long, default_value = "8080")]
        router_port: u16,

        #[arg(long, default_value = "8888")]
        executor_port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let daemon = Daemon::open(
        cli.config.as_deref(),
        cli.data_dir.as_deref(),
        cli.pod_ip.as_deref(),
    )?;
    if let Some(path) = &cli.resources {
        seed::Resources::from_file(path)?.apply(&daemon.store)?;
    }

    match cli.command {
        Command::Executor { port } => services::run_executor(daemon, port).await,
        Command::Router { port } => services::run_router(daemon, port).await,
        Command::Buildermgr => services::run_buildermgr(daemon).await,
        Command::Standalone {
            router_port,
            executor_port,
        } => services::run_standalone(daemon, router_port, executor_port).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => fmt.init(),
        LogFormat::Json => fmt.json().init(),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "fissiond",
            "router",
            "--port",
            "9090",
            "--log-format",
            "json",
            "--config",
            "fission.toml",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("fission.toml")));
        assert!(matches!(cli.command, Command::Router { port: 9090 }));
    }

    #[test]
    fn standalone_ports_default() {
        let cli = Cli::try_parse_from(["fissiond", "standalone"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(matches!(
            cli.command,
            Command::Standalone {
                router_port: 8080,
                executor_port: 8888
            }
        ));
    }
}
