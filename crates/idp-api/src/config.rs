use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use idp_core::util::is_http_url;
use idp_core::{SecuritySettings, SyncSettings};
use thiserror::Error;

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_token_ttl: Duration,
    pub document_store: Option<RemoteEndpoint>,
    pub identity_provider: Option<RemoteEndpoint>,
    pub sync_source_tag: String,
    pub security_defaults: SecuritySettings,
    pub connectivity_cache_ttl: Duration,
    pub connectivity_probe_timeout: Duration,
    pub push_timeout: Duration,
    pub pending_retry_interval: Duration,
    pub failed_retry_interval: Duration,
}

/// Base URL plus optional bearer token of an upstream service
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub url: String,
    pub token: Option<String>,
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteEndpoint")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("document_store", &self.document_store)
            .field("identity_provider", &self.identity_provider)
            .field("sync_source_tag", &self.sync_source_tag)
            .field("security_defaults", &self.security_defaults)
            .field("connectivity_cache_ttl", &self.connectivity_cache_ttl)
            .field(
                "connectivity_probe_timeout",
                &self.connectivity_probe_timeout,
            )
            .field("push_timeout", &self.push_timeout)
            .field("pending_retry_interval", &self.pending_retry_interval)
            .field("failed_retry_interval", &self.failed_retry_interval)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "IDP_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path =
            PathBuf::from(value_or_default(&lookup, "IDP_DATABASE_PATH", "idp.db"));

        let jwt_secret = required_trimmed(&lookup, "JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters"
            )));
        }
        let jwt_issuer = value_or_default(&lookup, "JWT_ISSUER", "idp-api");
        let access_token_ttl_secs =
            bounded(&lookup, "ACCESS_TOKEN_TTL_SECS", 900, 60..=86_400)?;

        let document_store = parse_endpoint(&lookup, "DOCUMENT_STORE_URL", "DOCUMENT_STORE_TOKEN")?;
        let identity_provider =
            parse_endpoint(&lookup, "IDENTITY_PROVIDER_URL", "IDENTITY_PROVIDER_TOKEN")?;
        let sync_source_tag = value_or_default(&lookup, "SYNC_SOURCE_TAG", "LOCAL");

        let security_defaults = SecuritySettings {
            max_login_attempts: bounded(&lookup, "MAX_LOGIN_ATTEMPTS", 3, 1..=100)?,
            lock_duration_minutes: bounded(&lookup, "LOCK_DURATION_MINUTES", 30, 1..=10_080)?,
            session_duration_minutes: bounded(
                &lookup,
                "SESSION_DURATION_MINUTES",
                60,
                1..=43_200,
            )?,
        };

        let connectivity_cache_ttl_secs =
            bounded(&lookup, "CONNECTIVITY_CACHE_TTL_SECS", 5, 0..=3_600)?;
        let connectivity_probe_timeout_secs =
            bounded(&lookup, "CONNECTIVITY_PROBE_TIMEOUT_SECS", 3, 1..=60)?;
        let push_timeout_secs = bounded(&lookup, "PUSH_TIMEOUT_SECS", 5, 1..=120)?;
        let pending_retry_interval_secs =
            bounded(&lookup, "PENDING_RETRY_INTERVAL_SECS", 30, 1..=86_400)?;
        let failed_retry_interval_secs =
            bounded(&lookup, "FAILED_RETRY_INTERVAL_SECS", 60, 1..=86_400)?;

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            jwt_issuer,
            access_token_ttl: Duration::from_secs(access_token_ttl_secs),
            document_store,
            identity_provider,
            sync_source_tag,
            security_defaults,
            connectivity_cache_ttl: Duration::from_secs(connectivity_cache_ttl_secs),
            connectivity_probe_timeout: Duration::from_secs(connectivity_probe_timeout_secs),
            push_timeout: Duration::from_secs(push_timeout_secs),
            pending_retry_interval: Duration::from_secs(pending_retry_interval_secs),
            failed_retry_interval: Duration::from_secs(failed_retry_interval_secs),
        })
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings::default()
            .with_source_tag(self.sync_source_tag.clone())
            .with_connectivity(self.connectivity_cache_ttl, self.connectivity_probe_timeout)
            .with_push_timeout(self.push_timeout)
            .with_retry_intervals(self.pending_retry_interval, self.failed_retry_interval)
    }
}

fn parse_endpoint(
    lookup: impl Fn(&str) -> Option<String>,
    url_var: &'static str,
    token_var: &'static str,
) -> Result<Option<RemoteEndpoint>, ConfigError> {
    let url = optional_trimmed(&lookup, url_var).map(|value| trim_trailing(&value).to_string());
    let token = optional_trimmed(&lookup, token_var);

    let Some(url) = url else {
        if token.is_some() {
            return Err(ConfigError::MissingVar(url_var));
        }
        return Ok(None);
    };
    if !is_http_url(&url) {
        return Err(ConfigError::Invalid(format!(
            "{url_var} must start with http:// or https://"
        )));
    }
    Ok(Some(RemoteEndpoint { url, token }))
}

fn bounded<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + fmt::Display + Copy,
{
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let message = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = raw.parse::<T>().map_err(|_| message())?;
    if !range.contains(&value) {
        return Err(message());
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn load(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_jwt_secret() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn config_rejects_short_jwt_secret() {
        let map = HashMap::from([("JWT_SECRET", "short")]);
        assert!(load(&map).unwrap_err().to_string().contains("at least"));
    }

    #[test]
    fn config_defaults_to_local_only_mode() {
        let map = HashMap::from([("JWT_SECRET", SECRET)]);

        let config = load(&map).unwrap();

        assert_eq!(config.document_store, None);
        assert_eq!(config.identity_provider, None);
        assert_eq!(config.security_defaults, SecuritySettings::default());
        assert_eq!(config.sync_settings().source_tag, "LOCAL");
        assert_eq!(config.connectivity_cache_ttl, Duration::from_secs(5));
        assert_eq!(config.connectivity_probe_timeout, Duration::from_secs(3));
    }

    #[test]
    fn config_validates_integer_ranges() {
        let map = HashMap::from([("JWT_SECRET", SECRET), ("MAX_LOGIN_ATTEMPTS", "0")]);
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("MAX_LOGIN_ATTEMPTS must be an integer in [1, 100]"));

        let map = HashMap::from([("JWT_SECRET", SECRET), ("PUSH_TIMEOUT_SECS", "soon")]);
        assert!(load(&map).is_err());
    }

    #[test]
    fn config_requires_url_when_token_given() {
        let map = HashMap::from([("JWT_SECRET", SECRET), ("DOCUMENT_STORE_TOKEN", "t")]);
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("DOCUMENT_STORE_URL"));
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let map = HashMap::from([
            ("JWT_SECRET", SECRET),
            ("DOCUMENT_STORE_URL", "https://mirror.example.com/"),
            ("DOCUMENT_STORE_TOKEN", "sensitive-store-token"),
            ("IDENTITY_PROVIDER_URL", "https://idp.example.com"),
            ("IDENTITY_PROVIDER_TOKEN", "sensitive-idp-token"),
        ]);

        let config = load(&map).unwrap();

        assert_eq!(
            config.document_store.as_ref().map(|endpoint| endpoint.url.as_str()),
            Some("https://mirror.example.com")
        );
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains(SECRET));
        assert!(!debug_output.contains("sensitive-store-token"));
        assert!(!debug_output.contains("sensitive-idp-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
