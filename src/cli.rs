use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// svcgw: policy-enforcing gateway for registered services
#[derive(Parser)]
#[command(name = "svcgw", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run migrations, then start the gateway server
    Serve {
        /// Port to bind (defaults to SVCGW_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply pending migrations and exit
    Migrate,

    /// Manage registered services
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },
}

#[derive(Subcommand)]
pub enum ServiceCommands {
    /// List registered services
    List,
    /// Set one service's upstream API key
    SetKey {
        #[arg(long)]
        name: String,
        #[arg(long)]
        key: String,
    },
    /// Remove one service's upstream API key
    ClearKey {
        #[arg(long)]
        name: String,
    },
    /// Rotate API keys for every service from <NAME>_API_KEY entries
    SyncKeys {
        /// dotenv-style file; the process environment is used when omitted
        #[arg(long)]
        env_file: Option<PathBuf>,
    },
    /// Enable a service
    Enable {
        #[arg(long)]
        name: String,
    },
    /// Disable a service
    Disable {
        #[arg(long)]
        name: String,
    },
}
