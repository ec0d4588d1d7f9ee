use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "idp")]
#[command(about = "Administer the local identity store and its remote mirror")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show per-table sync counts and mirror connectivity
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push queued records to the mirror now
    Push {
        /// Also retry records whose last push failed
        #[arg(long)]
        failed: bool,
    },
    /// Clear the lock and failure counter of an account
    Unlock {
        /// Account email
        email: String,
    },
    /// List locked accounts
    Locked {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or change lockout and session settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Print the settings in effect
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Override one or more settings
    Set {
        /// Failed attempts that lock an account
        #[arg(long, value_name = "N")]
        max_login_attempts: Option<u32>,
        /// Lock duration in minutes
        #[arg(long, value_name = "MINUTES")]
        lock_duration_minutes: Option<u32>,
        /// Session lifetime in minutes
        #[arg(long, value_name = "MINUTES")]
        session_duration_minutes: Option<u32>,
    },
}
