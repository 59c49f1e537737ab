use clap::Parser;
use sealgate_server::cli::{Cli, Command};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config();
    sealgate_server::logging::init(&config.log_level, config.log_format)?;

    match cli.effective_command() {
        Command::Serve(_) => sealgate_server::serve(config).await,
        Command::Worker => sealgate_server::worker(config).await,
    }
}
