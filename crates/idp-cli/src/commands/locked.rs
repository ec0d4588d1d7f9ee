use std::path::Path;

use idp_core::util::now_millis;

use crate::commands::common::{
    format_locked_lines, locked_user_to_item, open_database, LockedUserItem, RemoteSettings,
};
use crate::error::CliError;

pub async fn run_locked(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path, &RemoteSettings::from_env()).await?;
    let users = db.list_locked_users().await?;
    let now = now_millis();

    if as_json {
        let json_items = users
            .iter()
            .map(|user| locked_user_to_item(user, now))
            .collect::<Vec<LockedUserItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if users.is_empty() {
        println!("No locked accounts.");
        return Ok(());
    }

    for line in format_locked_lines(&users, now) {
        println!("{line}");
    }
    Ok(())
}
