use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "notiwatch",
    version,
    about = "Watch, list and acknowledge notifications"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to <config dir>/notiwatch/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// REST base address, e.g. https://example.com/api
    #[arg(long, global = true, env = "NOTIWATCH_BASE_URL")]
    pub base_url: Option<String>,

    /// Access token
    #[arg(long, global = true, env = "NOTIWATCH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Profile to act as
    #[arg(long, global = true, env = "NOTIWATCH_PROFILE")]
    pub profile: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Keep the notification channel open and print events until Ctrl-C
    Watch {
        /// Print one JSON object per event
        #[arg(long)]
        json: bool,

        /// Count owned by another subsystem, added to the unread total
        #[arg(long, default_value_t = 0)]
        external_pending: u64,
    },

    /// Fetch persisted history and print it
    List {
        /// Number of pages to fetch
        #[arg(short, long, default_value_t = 1)]
        pages: usize,

        #[arg(long)]
        json: bool,
    },

    /// Mark one notification as read
    MarkRead {
        id: i64,
    },

    /// Mark every notification as read
    MarkAllRead,

    /// Inspect configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}
