use std::path::Path;

use cairn_session::SessionConfiguration;
use serde::Deserialize;

/// Top-level `cairn.toml` layout.
#[derive(Debug, Default, Deserialize)]
pub struct CairnConfig {
    #[serde(default)]
    pub session: SessionConfiguration,
    #[serde(default)]
    pub redis: RedisSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CairnConfig {
    /// Load configuration from `path`, or use defaults if the file does not
    /// exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = if path.exists() {
            std::fs::read_to_string(path)?
        } else {
            String::new()
        };
        Ok(toml::from_str(&contents)?)
    }
}

/// Store connection settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    /// Store configuration string, e.g. `host=redis-1/redis-2,mode=SENTINEL`.
    pub url: String,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "host=localhost".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: CairnConfig = toml::from_str("").unwrap();
        assert_eq!(config.session.namespace, "default");
        assert_eq!(config.session.max_inactive_interval, 1800);
        assert_eq!(config.redis.url, "host=localhost");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn full_file() {
        let toml = r#"
            [session]
            namespace = "shop"
            max_inactive_interval = 600
            sticky = true
            node = "web-1"

            [redis]
            url = "mode=SENTINEL,master=main,host=s1/s2,expiration=ZRANGE"

            [logging]
            level = "cairn_redis=debug"
            format = "json"
        "#;
        let config: CairnConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.session.namespace, "shop");
        assert!(config.session.sticky);
        assert_eq!(config.session.node, "web-1");
        assert_eq!(config.logging.format, LogFormat::Json);

        let redis = cairn_redis::RedisConfig::parse(&config.redis.url).unwrap();
        assert_eq!(redis.mode, cairn_redis::ClusterMode::Sentinel);
        assert_eq!(redis.expiration, cairn_redis::ExpirationKind::SortedSet);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = CairnConfig::load(Path::new("/nonexistent/cairn.toml")).unwrap();
        assert_eq!(config.session.namespace, "default");
    }
}
