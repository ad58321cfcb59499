use std::path::PathBuf;

use clap::Parser;

/// CLI for the executor daemon. Flags override the YAML config file.
#[derive(Debug, Clone, Parser)]
#[command(name = "ad4m-executor", about = "Agent-centric perspective engine daemon")]
pub struct Cli {
    /// YAML config file
    #[arg(long, short, env = "AD4M_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for persisted state. Without it everything is in memory.
    #[arg(long, env = "AD4M_DATA_PATH")]
    pub data_path: Option<PathBuf>,

    /// Listen address for HTTP/WS endpoints
    #[arg(long, env = "AD4M_ADDR")]
    pub listen_addr: Option<String>,

    /// Credential that grants every capability.
    /// If not set, only paired apps can call the API.
    #[arg(long, env = "AD4M_ADMIN_CREDENTIAL", hide_env_values = true)]
    pub admin_credential: Option<String>,

    /// Secret for signing capability tokens (HS256).
    /// If not set, a random one is used and tokens die with the process.
    #[arg(long, env = "AD4M_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Per-subscriber event queue length
    #[arg(long, env = "AD4M_BUS_CAPACITY")]
    pub bus_capacity: Option<usize>,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,
}
