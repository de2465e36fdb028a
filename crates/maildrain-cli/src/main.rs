//! maildrain - one-shot IMAP mailbox drainer

use anyhow::Result;
use maildrain_common::config::Config;
use maildrain_core::Session;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load configuration: explicit path argument or the default locations
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(std::path::Path::new(&path))?,
        None => Config::load()?,
    };

    init_logging(&config.logging.directive);

    info!(
        "Draining {} on {} into {}",
        config.account.mailbox,
        config.account.host,
        config.maildir.path.display()
    );

    let session = Session::connect(&config).await?;
    session.run().await?;

    info!("Done.");
    Ok(())
}

fn init_logging(directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
