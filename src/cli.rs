use clap::{Parser, Subcommand};

/// Credential broker and tool proxy for sandboxed agents
#[derive(Parser)]
#[command(name = "credential-broker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker server
    Serve {
        /// Port to bind; defaults to PORT
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Mint and inspect session tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Inspect the credential encryption key
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a session token and print it
    Issue {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "")]
        conversation: String,
        #[arg(long, default_value = "")]
        sandbox: String,
        /// Scope names, e.g. mcp:list_tools,mcp:call_tools
        #[arg(long, value_delimiter = ',')]
        scope: Vec<String>,
        /// Lifetime in seconds, capped at the configured maximum
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// Validate a token and print its claims
    Inspect {
        #[arg(long)]
        token: String,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Report how ENCRYPTION_KEY is fitted to the 32-byte AES key
    Check,
}
