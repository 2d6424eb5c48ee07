//! imgfetch CLI - concurrent image downloader
//!
//! Fetches a batch of image URLs through the download manager with live
//! progress bars.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use imgfetch_types::ExecutionOrder;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// imgfetch - Concurrent Image Downloader
#[derive(Parser)]
#[command(name = "imgfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, env = "IMGFETCH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OrderArg {
    Fifo,
    Lifo,
}

impl From<OrderArg> for ExecutionOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::Fifo => ExecutionOrder::Fifo,
            OrderArg::Lifo => ExecutionOrder::Lifo,
        }
    }
}

#[derive(clap::Args, Debug)]
struct FetchArgs {
    /// Image URLs to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory to write images into
    #[arg(short = 'd', long, default_value = ".")]
    dir: PathBuf,

    /// Max concurrent downloads
    #[arg(short = 'j', long)]
    max_concurrent: Option<usize>,

    /// Queue discipline
    #[arg(long)]
    order: Option<OrderArg>,

    /// Report partial payloads while downloading
    #[arg(long)]
    progressive: bool,

    /// Allow the HTTP cache
    #[arg(long)]
    use_cache: bool,

    /// Skip writing responses that came from the cache
    #[arg(long, requires = "use_cache")]
    ignore_cached: bool,

    /// Admit these downloads after normal-priority ones
    #[arg(long)]
    low_priority: bool,

    /// Extra request header, e.g. -H "Referer: https://example.com"
    #[arg(short = 'H', long = "header", value_parser = commands::parse_header)]
    headers: Vec<(String, String)>,

    /// Share one fetch between duplicate URLs
    #[arg(long)]
    coalesce: bool,

    /// Decode images and report their dimensions
    #[arg(long)]
    decode: bool,

    /// Basic-auth credentials as user:password
    #[arg(long)]
    auth: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download images
    Fetch(FetchArgs),

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective config
    Show,

    /// Print the config file location
    Path,

    /// Write the default config to the config file
    Reset,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .or_else(imgfetch_core::config::default_config_path);

    match cli.command {
        Commands::Fetch(args) => commands::fetch(args, config_path, cli.output).await?,

        Commands::Config { action } => {
            commands::config_action(action, config_path, cli.output).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "imgfetch", &mut std::io::stdout());
        }
    }

    Ok(())
}
