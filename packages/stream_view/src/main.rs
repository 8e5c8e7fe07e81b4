use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stream_mux::DistributionMode;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod cli;
mod config;

#[derive(Parser)]
#[command(name = "bmview")]
#[command(about = "Watch BM-APP video channels over a shared or dedicated WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory containing config.toml (defaults to <config dir>/bmview)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream one or more channels and print per-channel status every second
    Watch(WatchArgs),

    /// List the configured channels
    Channels(ChannelsArgs),

    /// Print the resolved configuration
    Config(ConfigArgs),
}

#[derive(Parser)]
pub(crate) struct WatchArgs {
    /// Channel ids to watch (defaults to every configured channel)
    pub channels: Vec<String>,

    /// Override the configured distribution mode
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Label the upstream is expected to report (single channel only)
    #[arg(long)]
    pub label: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub seconds: Option<u64>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub(crate) enum ModeArg {
    Shared,
    Dedicated,
}

impl From<ModeArg> for DistributionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Shared => DistributionMode::Shared,
            ModeArg::Dedicated => DistributionMode::Dedicated,
        }
    }
}

#[derive(Parser)]
struct ChannelsArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ConfigArgs {
    /// Output as JSON instead of TOML
    #[arg(long)]
    json: bool,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "bmview=debug,stream_mux=debug,info"
    } else {
        "bmview=info,stream_mux=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let dir = config::config_dir(cli.config_dir);
    debug!(config_dir = %dir.display(), "loading configuration");
    let file_config = config::file_config(&dir)?;

    match cli.command {
        Commands::Watch(args) => cli::watch::watch_command(file_config, args).await,
        Commands::Channels(args) => cli::channels_command(&file_config, args.json).await,
        Commands::Config(args) => cli::config_command(&file_config, args.json),
    }
}
