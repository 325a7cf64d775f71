mod commands;

use abkit_core::Settings;
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use commands::{
    convert::{FromTarCommand, ToTarCommand},
    inspect::InspectCommand,
    pack::PackCommand,
    unpack::UnpackCommand,
};
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "abkit",
    about = "Android backup (.ab) archive toolkit",
    long_about = "abkit converts between Android backup archives and per-category tar segment sets, \
                  with optional AES-256 encryption and compression"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "ABKIT_CONFIG", help = "Settings file (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, env = "ABKIT_PASSWORD", hide_env_values = true, help = "Backup password")]
    password: Option<String>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build an .ab archive from stored segment sets")]
    Pack(PackCommand),

    #[command(about = "Split an .ab archive into per-category segment sets")]
    Unpack(UnpackCommand),

    #[command(about = "Unwrap an .ab archive into a plain tar file")]
    ToTar(ToTarCommand),

    #[command(about = "Wrap a plain tar file into an .ab archive")]
    FromTar(FromTarCommand),

    #[command(about = "Show the header of an .ab archive")]
    Inspect(InspectCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    info!("Starting abkit");

    match cli.command {
        Commands::Pack(ref cmd) => cmd.run(&cli).await,
        Commands::Unpack(ref cmd) => cmd.run(&cli).await,
        Commands::ToTar(ref cmd) => cmd.run(&cli).await,
        Commands::FromTar(ref cmd) => cmd.run(&cli).await,
        Commands::Inspect(ref cmd) => cmd.run(&cli).await,
    }
}

/// `--config` if given, else `config.toml` in the user config directory
/// when it exists, else built-in defaults.
fn load_settings(cli: &Cli) -> Result<Settings> {
    if let Some(path) = &cli.config {
        return Settings::load(path).with_context(|| format!("Failed to load {}", path.display()));
    }
    let Some(dirs) = ProjectDirs::from("", "", "abkit") else {
        return Ok(Settings::default());
    };
    let path = dirs.config_dir().join("config.toml");
    debug!("Looking for settings in {}", path.display());
    Settings::load_or_default(&path).with_context(|| format!("Failed to load {}", path.display()))
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!("abkit={}", level)))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Setting default subscriber failed: {}", e))
}
