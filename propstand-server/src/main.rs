use std::time::Duration;

use clap::Parser;
use miette::Result;
use tokio_graceful_shutdown::Toplevel;

use propstand_server::{config, Cli, Session, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    log::info!("propstand-server {}", VERSION);

    let server_config = config::load(args.config.as_deref()).map_err(miette::Report::msg)?;

    Toplevel::new(|s| async move {
        let _session = Session::new(&s, args, server_config).await;
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .map_err(miette::Report::msg)
}
