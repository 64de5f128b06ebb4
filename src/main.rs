use clap::Parser;

use registry_report::cli::{run, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    registry_report::init_tracing(cli.verbose);
    run(cli).await
}
