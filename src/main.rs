use anyhow::Context;
use clap::{Parser, Subcommand};
use fetchplay::commands::{self, AppContext};
use fetchplay::logging::{self, BackendLogger};
use fetchplay::paths::PathConfig;
use fetchplay::settings::PlayerSettings;
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Keep data, cache and logs under this directory instead of the per-user defaults
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Log filter used when RUST_LOG is not set (e.g. "debug", "fetchplay=trace")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download (or reuse from cache) and play an audio URL
    Play { url: String },
    /// Serve files from a directory at /file/{name}
    Serve {
        /// Address to listen on [default: from settings, 127.0.0.1:5000]
        #[arg(long)]
        bind: Option<String>,
        /// Directory to serve [default: from settings, or the working directory]
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Inspect or clear the audio cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print the resolved application paths
    Paths,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    Stats,
    Clear,
    /// Show where a URL is cached
    Path { url: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = PathConfig::new(cli.data_dir.as_deref()).context("Failed to resolve application paths")?;
    paths.ensure_directories_exist()?;

    let files = match BackendLogger::open(&paths.logs) {
        Ok(files) => Some(files),
        Err(e) => {
            eprintln!("Backend log files unavailable: {}", e);
            None
        }
    };
    logging::init(&cli.log_level, files)?;

    let settings = PlayerSettings::load(&paths.settings_file);
    if !paths.settings_file.exists() {
        if let Err(e) = settings.save(&paths.settings_file) {
            warn!("[settings] Could not write default settings: {}", e);
        }
    }

    let ctx = AppContext { paths, settings };
    match cli.command {
        Command::Play { url } => commands::run_play(&ctx, &url).await,
        Command::Serve { bind, root } => commands::run_serve(&ctx, bind, root).await,
        Command::Cache { action } => match action {
            CacheAction::Stats => commands::cache_stats(&ctx),
            CacheAction::Clear => commands::cache_clear(&ctx),
            CacheAction::Path { url } => commands::cache_path(&ctx, &url),
        },
        Command::Paths => commands::print_paths(&ctx),
    }
}
