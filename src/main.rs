use clap::Parser;
use retinvest::api::{Cli, run};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    retinvest::logging::init_logger(cli.verbose);

    if let Err(e) = run(cli).await {
        tracing::debug!(error = %e, "command failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
