use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hopshell", version, about = "Tunnels and remote commands over shared SSH connections")]
pub struct Args {
    /// JSON host configuration; built-in defaults are used when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// `ssh` executable to drive
    #[arg(long, global = true, default_value = "ssh")]
    pub ssh: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Forward a local port to HOST:PORT and hold it until interrupted
    Tunnel {
        /// Destination, as `[user@]host`
        host: String,

        /// Destination port
        port: u16,

        /// Hop to route through before any configured hops
        #[arg(long)]
        via: Option<String>,
    },

    /// Run one command on a remote login
    Exec {
        /// Login, as `[user@]host[:port]`
        login: String,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}
