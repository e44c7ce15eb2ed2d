#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "browserforce",
    version,
    about = "Relay broker bridging CDP clients to a user-driven browser",
    long_about = "browserforce runs a loopback relay broker that bridges automation clients \
        speaking the Chrome DevTools Protocol (CDP) to the user's real browser via its \
        extension API. The in-browser extension holds the debugging capability and connects \
        to the broker over a single WebSocket; any number of CDP clients connect alongside \
        and drive the user's actual tabs, with their logged-in sessions and cookies, without \
        launching a headless instance.\n\n\
        The broker publishes its CDP URL (including a local shared-secret token) to a \
        well-known file under the user config directory, serves a small admin HTTP surface \
        on the same port, and keeps a bounded in-memory log of every brokered frame for \
        diagnosis.",
    term_width = 100
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalOpts {
    /// Path to a config file (default: search standard locations)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay broker
    #[command(
        long_about = "Start the relay broker on the loopback interface. Reads or creates the \
            shared-secret token, binds the configured port (default 19222), publishes the CDP \
            URL file, and serves until SIGINT/SIGTERM. Exits nonzero if the port is held."
    )]
    Serve(ServeArgs),

    /// Query a running broker's health
    #[command(
        long_about = "Query the admin endpoint of a running broker and report extension \
            presence, target count, and client count. Exits nonzero when no broker is \
            reachable."
    )]
    Status(StatusArgs),

    /// Configuration management (show, init, path)
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),

    /// Generate man pages
    Man(ManArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on (falls back to the config file, then 19222)
    #[arg(env = "RELAY_PORT")]
    pub port: Option<u16>,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Output as compact JSON
    #[arg(long)]
    pub json: bool,

    /// Port of the broker to query
    #[arg(long, env = "RELAY_PORT")]
    pub port: Option<u16>,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the merged configuration from all sources
    Show,
    /// Create a commented template config file
    Init(ConfigInitArgs),
    /// Print the path of the config file in use
    Path,
}

#[derive(Args)]
pub struct ConfigInitArgs {
    /// Where to write the template (default: platform config dir)
    pub path: Option<PathBuf>,
}

#[derive(Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[derive(Args)]
pub struct ManArgs {
    /// Subcommand to render (default: top-level page)
    pub command: Option<String>,
}
