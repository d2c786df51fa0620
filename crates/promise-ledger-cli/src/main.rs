use clap::Parser;
use promise_ledger_cli::{run_cli, Cli};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    run_cli(Cli::parse())
}
