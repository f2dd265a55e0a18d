use anyhow::Context;
use clap::Parser;
use depotd::config::DepotConfig;
use depotd::mailbox::MailboxManager;
use depotd::peers::{spawn_writer, PeerNotifier};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// The maildepot store daemon.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Configuration file.
    #[arg(long, default_value = "/etc/maildepot/depotd.toml")]
    config: PathBuf,

    /// Diagnostic log filter; overrides MAILDEPOT_LOG.
    #[arg(long)]
    log_filter: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    let filter = match &opts.log_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_env("MAILDEPOT_LOG")
            .unwrap_or_else(|_| EnvFilter::new("depotd=info,dbpool=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(opts))
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let config = DepotConfig::load(&opts.config)?;
    config
        .database
        .validate_backend()
        .context("validating database configuration")?;

    let pool = dbpool::Pool::connect(config.database.clone()).context("starting database pool")?;

    let mailboxes = MailboxManager::new();
    let loaded = mailboxes
        .load(&pool)
        .await
        .context("loading mailbox registry")?;
    tracing::info!("loaded {loaded} mailboxes");

    let (_notifier, receiver) = PeerNotifier::new();
    spawn_writer(receiver, config.peers.clone());

    tracing::info!("depotd ready");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    pool.shutdown();
    Ok(())
}
