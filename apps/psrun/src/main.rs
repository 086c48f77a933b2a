mod cli;
mod config;

use clap::Parser;

#[tokio::main]
async fn main() {
    let code = cli::Cli::parse().run().await;
    std::process::exit(code);
}
