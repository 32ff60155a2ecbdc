//! The bootstrap-salt CLI.

use anyhow::Result;
use structopt::StructOpt;

use bootstrap_salt::BootstrapSalt;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = BootstrapSalt::from_args();
    cli.run().await
}
