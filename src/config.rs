//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::mailbox::graph::GRAPH_API_BASE;

/// Application configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    /// Bearer secret for trigger endpoints. `None` rejects every trigger.
    pub cron_secret: Option<SecretString>,
    /// Access token handed to the engine. `None` fails every run with an auth error.
    pub graph_access_token: Option<SecretString>,
    pub graph_api_base: String,
    /// Notification webhook. `None` disables notification.
    pub webhook_url: Option<SecretString>,
    /// Cron expression for the in-process ticker (seconds field first).
    pub schedule: Option<String>,
    pub page_size: u32,
    pub max_pages: usize,
    pub max_matched: usize,
    pub from_year: i32,
    pub source_folder: String,
}

impl AppConfig {
    /// Build config from environment variables.
    ///
    /// Absent optional values disable their feature; values that are present
    /// but unparsable are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secret = |key: &str| get(key).map(SecretString::from);

        let page_size: u32 = parse_or(&get, "CLEANMAIL_PAGE_SIZE", 50)?;

        Ok(Self {
            db_path: get("CLEANMAIL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/clean-mail.db")),
            port: parse_or(&get, "CLEANMAIL_PORT", 8080)?,
            cron_secret: secret("CRON_SECRET"),
            graph_access_token: secret("GRAPH_ACCESS_TOKEN"),
            graph_api_base: get("GRAPH_API_BASE")
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| GRAPH_API_BASE.to_string()),
            webhook_url: secret("GOOGLE_CHAT_WEBHOOK_URL"),
            schedule: get("CLEANMAIL_SCHEDULE"),
            page_size: page_size.clamp(1, 1000),
            max_pages: parse_or(&get, "CLEANMAIL_MAX_PAGES", 100)?,
            max_matched: parse_or(&get, "CLEANMAIL_MAX_MATCHED", 500)?,
            from_year: parse_or(&get, "CLEANMAIL_FROM_YEAR", 0)?,
            source_folder: get("CLEANMAIL_SOURCE_FOLDER").unwrap_or_else(|| "inbox".to_string()),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_size: self.page_size,
            max_pages: self.max_pages,
            max_matched: self.max_matched,
            default_source: self.source_folder.clone(),
            default_from_year: self.from_year,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("./data/clean-mail.db"));
        assert_eq!(config.port, 8080);
        assert!(config.cron_secret.is_none());
        assert!(config.graph_access_token.is_none());
        assert!(config.webhook_url.is_none());
        assert!(config.schedule.is_none());
        assert_eq!(config.graph_api_base, GRAPH_API_BASE);

        let engine = config.engine_config();
        assert_eq!(engine.page_size, 50);
        assert_eq!(engine.max_pages, 100);
        assert_eq!(engine.max_matched, 500);
        assert_eq!(engine.default_source, "inbox");
        assert_eq!(engine.default_from_year, 0);
    }

    #[test]
    fn reads_values_and_secrets() {
        let config = config_from(&[
            ("CLEANMAIL_PORT", "9090"),
            ("CRON_SECRET", "s3cret"),
            ("GRAPH_API_BASE", "http://localhost:1234/v1.0/"),
            ("CLEANMAIL_FROM_YEAR", "2025"),
            ("CLEANMAIL_SOURCE_FOLDER", "all"),
            ("CLEANMAIL_SCHEDULE", "0 0 * * * *"),
        ])
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.cron_secret.unwrap().expose_secret(), "s3cret");
        assert_eq!(config.graph_api_base, "http://localhost:1234/v1.0");
        assert_eq!(config.from_year, 2025);
        assert_eq!(config.source_folder, "all");
        assert_eq!(config.schedule.as_deref(), Some("0 0 * * * *"));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("CRON_SECRET", "   "), ("CLEANMAIL_PORT", "")]).unwrap();
        assert!(config.cron_secret.is_none());
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(config_from(&[("CLEANMAIL_PAGE_SIZE", "0")]).unwrap().page_size, 1);
        assert_eq!(config_from(&[("CLEANMAIL_PAGE_SIZE", "5000")]).unwrap().page_size, 1000);
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let err = config_from(&[("CLEANMAIL_MAX_PAGES", "lots")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "CLEANMAIL_MAX_PAGES"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
