use std::path::Path;

use idp_core::util::now_millis;
use idp_core::{DatabaseService, SecuritySettings};

use crate::commands::common::{open_database, RemoteSettings};
use crate::error::CliError;

/// Values passed to `idp settings set`; `None` keeps the stored value
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsOverrides {
    pub max_login_attempts: Option<u32>,
    pub lock_duration_minutes: Option<u32>,
    pub session_duration_minutes: Option<u32>,
}

impl SettingsOverrides {
    const fn is_empty(&self) -> bool {
        self.max_login_attempts.is_none()
            && self.lock_duration_minutes.is_none()
            && self.session_duration_minutes.is_none()
    }

    fn apply(&self, settings: &mut SecuritySettings) {
        if let Some(value) = self.max_login_attempts {
            settings.max_login_attempts = value;
        }
        if let Some(value) = self.lock_duration_minutes {
            settings.lock_duration_minutes = value;
        }
        if let Some(value) = self.session_duration_minutes {
            settings.session_duration_minutes = value;
        }
    }
}

pub async fn run_settings_show(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path, &RemoteSettings::from_env()).await?;
    let settings = db.security_settings().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        for line in format_settings_lines(&settings) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_settings_set(
    overrides: SettingsOverrides,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path, &RemoteSettings::from_env()).await?;
    let settings = update_settings(&db, overrides).await?;

    println!("Settings saved:");
    for line in format_settings_lines(&settings) {
        println!("{line}");
    }
    Ok(())
}

pub async fn update_settings(
    db: &DatabaseService,
    overrides: SettingsOverrides,
) -> Result<SecuritySettings, CliError> {
    if overrides.is_empty() {
        return Err(CliError::NothingToUpdate);
    }
    let mut settings = db.security_settings().await?;
    overrides.apply(&mut settings);
    db.save_security_settings(&settings, now_millis()).await?;
    Ok(settings)
}

pub fn format_settings_lines(settings: &SecuritySettings) -> Vec<String> {
    vec![
        format!("max login attempts:  {}", settings.max_login_attempts),
        format!("lock duration:       {} min", settings.lock_duration_minutes),
        format!("session duration:    {} min", settings.session_duration_minutes),
    ]
}
