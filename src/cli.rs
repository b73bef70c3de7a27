use clap::{Parser, Subcommand};

/// Devicelock - device-bound access tokens
#[derive(Parser)]
#[command(name = "devicelock", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (defaults to DEVICELOCK_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a new token
    Issue {
        #[arg(long)]
        owner: String,
        /// Caller-chosen value (letters and digits only)
        #[arg(long)]
        custom_token: Option<String>,
        /// "never", a number of days, or a DD-MM-YYYY date
        #[arg(long)]
        expiration: Option<String>,
    },
    /// Validate a token, binding it to the device on first use
    Validate {
        #[arg(long)]
        token: String,
        #[arg(long)]
        device_id: Option<String>,
    },
    /// List tokens issued to an owner
    List {
        #[arg(long)]
        owner: String,
    },
    /// Decrypt and print a stored token
    Reveal {
        #[arg(long)]
        id: String,
    },
}
