use std::process::ExitCode;

use clap::Parser;
use log::error;

use glcrawl::cli_args::Cli;
use glcrawl::commands;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The alternate format prints the source chain, which carries
            // the endpoint and status context for transport failures.
            let report = anyhow::Error::new(e);
            error!("{report:#}");
            eprintln!("error: {report:#}");
            ExitCode::FAILURE
        }
    }
}
