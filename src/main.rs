use anyhow::Result;
use clap::Parser;

use rover_signal::config::{Cli, Command};
use rover_signal::{peer, server, util};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    util::init_log();

    match cli.command {
        Command::Server(config) => server::run(config).await,
        Command::Peer(config) => peer::run(config).await,
    }
}
