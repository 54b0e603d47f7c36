use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use nestdbx::{
    config::{ConfigUpdate, load_or_default},
    logging, server,
};

#[derive(Parser)]
#[command(author, version, about = "NestDBX server CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.nestdbx/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the NestDBX server
    Start(StartArgs),
    /// Update persisted configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Override the configured server port
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// JSON Schema file used to validate document bodies
    #[arg(long, short = 's')]
    schema: Option<PathBuf>,

    /// JSON file mapping usernames to bootstrap tokens
    #[arg(long, short = 't')]
    tokens: Option<PathBuf>,
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    schema: Option<PathBuf>,

    #[arg(long)]
    tokens: Option<PathBuf>,

    #[arg(long)]
    token_ttl_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => start(cli.config, args).await,
        Commands::Config(args) => update_config(cli.config, args),
    }
}

async fn start(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (mut config, _) = load_or_default(config_path)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(schema) = args.schema {
        config.schema_file = Some(schema);
    }
    if let Some(tokens) = args.tokens {
        config.token_file = Some(tokens);
    }

    server::run(config).await?;
    Ok(())
}

fn update_config(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;
    config.apply_update(ConfigUpdate {
        port: args.port,
        schema_file: args.schema,
        token_file: args.tokens,
        token_ttl_secs: args.token_ttl_secs,
    });
    config.save(&path)?;
    info!("configuration updated at {}", path.display());
    Ok(())
}
