use clap::Parser;
use corkboard_client::{cli, logging};

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();
    if let Err(e) = logging::init(args.verbose) {
        eprintln!("failed to initialize logger: {}", e);
    }

    if let Err(e) = cli::run(args).await {
        log::error!("[corkboard.cli] {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
