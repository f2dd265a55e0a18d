use anyhow::Context;
use clap::Parser;
use dbpool::Pool;
use depotd::config::DepotConfig;
use depotd::undelete::{undelete, Selector};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// maildepot administration CLI.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Configuration file.
    #[arg(long, default_value = "/etc/maildepot/depotd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Parser)]
enum SubCommand {
    Undelete(UndeleteCommand),
}

impl SubCommand {
    async fn run(&self, pool: &Pool) -> anyhow::Result<()> {
        match self {
            Self::Undelete(cmd) => cmd.run(pool).await,
        }
    }
}

/// Move deleted messages back into their mailbox under fresh UIDs.
#[derive(Debug, Parser)]
struct UndeleteCommand {
    /// Mailbox name (UTF-8).
    mailbox: String,

    /// Restore only these UIDs; everything deleted when omitted.
    #[arg(long = "uid")]
    uids: Vec<u32>,

    /// Print who deleted each message, when, and why.
    #[arg(short, long)]
    verbose: bool,
}

impl UndeleteCommand {
    async fn run(&self, pool: &Pool) -> anyhow::Result<()> {
        let selector = if self.uids.is_empty() {
            Selector::All
        } else {
            Selector::Uids(self.uids.iter().copied().collect::<BTreeSet<u32>>())
        };
        let report = undelete(pool, &self.mailbox, selector, self.verbose).await?;
        println!(
            "depotctl: Undeleting {} messages into {}",
            report.restored, report.mailbox
        );
        for line in &report.details {
            println!("{line}");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    let config = DepotConfig::load(&opts.config)?;
    config
        .database
        .validate_backend()
        .context("validating database configuration")?;
    let pool = Pool::connect(config.database.clone()).context("starting database pool")?;
    let result = opts.cmd.run(&pool).await;
    pool.shutdown();
    result
}
