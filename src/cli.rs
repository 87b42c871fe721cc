/// CLI argument parsing
use clap::{Parser, Subcommand};

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built: ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

#[derive(Parser)]
#[command(name = "stackbak")]
#[command(author, version = VERSION_WITH_BUILD, long_about = None)]
#[command(about = "Backup and restore orchestration for docker-compose app fleets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Back up one app, every eligible app, or list what would run
    Backup {
        /// App name, `all`, or `list`
        target: String,
    },

    /// Restore an app from a remote snapshot
    Restore {
        /// App name, `all`, or `list`
        target: String,

        /// Snapshot id, or `latest`
        #[arg(default_value = "latest")]
        snapshot_ref: String,

        /// Restore on-disk state only; leave containers untouched
        #[arg(long)]
        data_only: bool,
    },

    /// Validate environment, tools and app eligibility
    Check,
}
