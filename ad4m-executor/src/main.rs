use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ad4m_executor::cli::Cli::parse();
    ad4m_executor::run_with_cli(cli).await
}
