//! ad4m-executor: HTTP + WebSocket daemon around [`ad4m_core::Ad4mCore`].
//!
//! Every API route takes a credential (bearer header or `token` query
//! parameter) and hands it to the engine, which does all authorization.
//! Apps without a credential pair first through `/api/capabilities/*`.

pub mod auth;
pub mod cli;
pub mod config;
pub mod server;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::ExecutorConfig;

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Run the executor using CLI args (parsed by the caller).
pub async fn run_with_cli(cli: cli::Cli) -> Result<()> {
    init_tracing(cli.verbose)?;

    let config = ExecutorConfig::from_cli(&cli)?;
    server::serve(config).await
}
