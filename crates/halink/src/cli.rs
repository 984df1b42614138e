//! Clap derive structures for the `halink` CLI.

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// halink -- stream and query a Home Assistant instance over one WebSocket
#[derive(Debug, Parser)]
#[command(
    name = "halink",
    version,
    about = "Stream events from and send commands to Home Assistant",
    long_about = "Keeps one authenticated WebSocket to a Home Assistant instance,\n\
        multiplexing commands over it and fanning events out to filters.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Profile to use
    #[arg(long, short = 'p', env = "HALINK_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Home Assistant URL, http(s) base or ws(s) endpoint (overrides profile)
    #[arg(long, short = 'u', env = "HALINK_URL", global = true)]
    pub url: Option<String>,

    /// Long-lived access token
    #[arg(long, env = "HALINK_TOKEN", global = true, hide_env = true)]
    pub token: Option<String>,

    /// Request timeout in seconds (overrides profile)
    #[arg(long, env = "HALINK_TIMEOUT", global = true)]
    pub timeout: Option<u64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print matching events as JSON lines until interrupted
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Send one command and print its result
    Call(CallArgs),

    /// Connect, report the backend version and session state, disconnect
    Status,

    /// Manage profiles and configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Interest filter: a domain (`light`, `lights`), an entity
    /// (`light.kitchen`), or a prefix (`sensor.temp_*`). Comma-separated
    /// for several. Empty = every event in the category.
    #[arg(default_value = "")]
    pub filter: String,

    /// Event category to subscribe to
    #[arg(long, short = 'c', default_value = "state_changed")]
    pub category: String,

    /// Exit after this many events
    #[arg(long, short = 'n')]
    pub limit: Option<usize>,

    /// Print only the event payload instead of the full envelope
    #[arg(long)]
    pub payload_only: bool,
}

#[derive(Debug, Args)]
pub struct CallArgs {
    /// Command type, e.g. `get_states` or `get_config`
    pub kind: String,

    /// Extra fields as a JSON object, e.g. '{"domain": "light"}'
    #[arg(long, short = 'd')]
    pub data: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Show the loaded configuration (tokens redacted)
    Show,

    /// Create or replace a profile
    Init(InitArgs),

    /// Store a profile's token in the system keyring
    SetToken {
        /// The access token
        token: String,
    },
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Home Assistant base URL
    #[arg(long, default_value = "http://homeassistant.local:8123")]
    pub url: String,

    /// Environment variable to read the token from
    #[arg(long)]
    pub token_env: Option<String>,

    /// Make this the default profile
    #[arg(long)]
    pub make_default: bool,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Target shell
    pub shell: clap_complete::Shell,
}
