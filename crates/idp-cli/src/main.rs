//! idp CLI - administration of the local identity store
//!
//! Inspects sync state, drains the push queue, unlocks accounts and edits
//! the lockout settings of the database the API serves from.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, SettingsCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::locked::run_locked;
use crate::commands::push::run_push;
use crate::commands::settings::{run_settings_set, run_settings_show, SettingsOverrides};
use crate::commands::status::run_status;
use crate::commands::unlock::run_unlock;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idp=info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Status { json } => run_status(json, &db_path).await?,
        Commands::Push { failed } => run_push(failed, &db_path).await?,
        Commands::Unlock { email } => run_unlock(&email, &db_path).await?,
        Commands::Locked { json } => run_locked(json, &db_path).await?,
        Commands::Settings { command } => match command {
            SettingsCommands::Show { json } => run_settings_show(json, &db_path).await?,
            SettingsCommands::Set {
                max_login_attempts,
                lock_duration_minutes,
                session_duration_minutes,
            } => {
                let overrides = SettingsOverrides {
                    max_login_attempts,
                    lock_duration_minutes,
                    session_duration_minutes,
                };
                run_settings_set(overrides, &db_path).await?;
            }
        },
    }

    Ok(())
}
