//! YaPPuchino server binary entry point. See the `yappuchino` library for
//! the core session/presence engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use yappuchino::Config;

#[derive(Parser)]
#[command(name = "yappuchino-server", version, about = "Real-time chat server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server and block until terminated.
    Serve {
        /// TCP port to bind, overriding the config file and
        /// `YAPPUCHINO_PORT`.
        #[arg(long)]
        port: Option<u16>,
        /// Directory for public/private history files, overriding the
        /// config file and `YAPPUCHINO_HISTORY_DIR`.
        #[arg(long)]
        history_dir: Option<std::path::PathBuf>,
    },
    /// Print the resolved configuration as JSON and exit.
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Serve { port, history_dir } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(history_dir) = history_dir {
                config.history_dir = history_dir;
            }
            log::info!("starting yappuchino-server v{}", env!("CARGO_PKG_VERSION"));
            yappuchino::server::run(config).await?;
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
