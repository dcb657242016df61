use clap::{Args, Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server.
    Serve(ServeArgs),
    /// Connect to a server as an interactive terminal user.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Path to the TOML config file. Missing files fall back to defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Override `[server] address`. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Base URL of the server.
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    pub server: String,
}
