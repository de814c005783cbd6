#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::LevelFilter;

use talksphere::console::{self, ConsoleView};
use talksphere::media::SystemDevices;
use talksphere::{client, config, logging, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, created with defaults when missing.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,

    /// Also write the log to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    logging::init(args.log_level, args.log_file.as_deref())?;
    let path = args.config.unwrap_or_else(config::default_path);
    info!("Loading config from {}", path.display());
    let config = config::load(&path)?;

    let client = client::connect(&config, Arc::new(SystemDevices::new())).await?;
    println!("signed in as {}, type /help for commands", client.me());
    client.run(console::spawn_stdin(), ConsoleView).await;
    Ok(())
}
