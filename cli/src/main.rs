mod arg_parser;
mod client_cli;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = arg_parser::Cli::parse();
    client_cli::run(cli).await
}
