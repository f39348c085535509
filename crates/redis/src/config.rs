use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use cairn_crypto::{MasterKey, decrypt_value, is_encrypted};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::error::StoreError;

/// Everything except RFC 3986 unreserved characters is escaped in userinfo.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Redis deployment topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    Single,
    Sentinel,
    Cluster,
}

impl FromStr for ClusterMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SINGLE" => Ok(Self::Single),
            "SENTINEL" => Ok(Self::Sentinel),
            "CLUSTER" => Ok(Self::Cluster),
            other => Err(StoreError::Config(format!("unknown cluster mode: {other}"))),
        }
    }
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "SINGLE",
            Self::Sentinel => "SENTINEL",
            Self::Cluster => "CLUSTER",
        })
    }
}

/// Proactive expiration algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationKind {
    /// Minute buckets plus keyspace expiry notifications.
    Notification,
    /// One sorted set scored by expiry instant, swept periodically.
    SortedSet,
}

impl FromStr for ExpirationKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOTIF" => Ok(Self::Notification),
            "ZRANGE" => Ok(Self::SortedSet),
            other => Err(StoreError::Config(format!(
                "unknown expiration strategy: {other}"
            ))),
        }
    }
}

/// Configuration for the Redis store facade and session repository.
///
/// Usually parsed from a comma separated `key=value` string:
///
/// ```text
/// mode=CLUSTER,host=redis-a/redis-b:7001,port=7000,pool=32,expiration=ZRANGE,timeout=1500
/// ```
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Maximum pooled connections.
    pub pool_size: usize,
    pub mode: ClusterMode,
    /// Sentinel master name.
    pub master: String,
    /// Hosts, each optionally `host:port`.
    pub hosts: Vec<String>,
    /// Port for hosts that do not carry their own.
    pub port: u16,
    pub expiration: ExpirationKind,
    /// Bound on acquiring a connection.
    pub connect_timeout: Duration,
    /// Bound on a single command round trip.
    pub socket_timeout: Duration,
    pub password: Option<SecretString>,
    pub database: i64,
    pub tls: bool,
    /// Delay before the forced-expiration safety net fires (sticky mode).
    pub forced_expiration_grace: Duration,
    /// How long other nodes wait before expiring a sticky owner's sessions.
    pub sorted_set_grace: Duration,
    /// Upper bound on the sorted-set sweep interval.
    pub sweep_ceiling: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            mode: ClusterMode::Single,
            master: "mymaster".to_owned(),
            hosts: vec!["localhost".to_owned()],
            port: 6379,
            expiration: ExpirationKind::Notification,
            connect_timeout: Duration::from_secs(2),
            socket_timeout: Duration::from_secs(2),
            password: None,
            database: 0,
            tls: false,
            forced_expiration_grace: Duration::from_secs(60),
            sorted_set_grace: Duration::from_secs(5 * 60),
            sweep_ceiling: Duration::from_secs(60),
        }
    }
}

impl RedisConfig {
    /// Parse a configuration string. Encrypted passwords are rejected; use
    /// [`parse_with_master_key`](Self::parse_with_master_key) for those.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Self::parse_with_master_key(s, None)
    }

    /// Parse a configuration string, decrypting an `ENC[...]` password with
    /// `master_key`.
    pub fn parse_with_master_key(s: &str, master_key: Option<&MasterKey>) -> Result<Self, StoreError> {
        let mut config = Self::default();
        for pair in split_pairs(s) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| StoreError::Config(format!("expected key=value, got {pair:?}")))?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "pool" => config.pool_size = number(&key, value)?,
                "mode" | "cluster" => config.mode = value.parse()?,
                "master" => value.clone_into(&mut config.master),
                "host" | "hosts" => {
                    config.hosts = value
                        .split('/')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(str::to_owned)
                        .collect();
                }
                "port" => config.port = number(&key, value)?,
                "expiration" => config.expiration = value.parse()?,
                "timeout" => {
                    let timeout = Duration::from_millis(number(&key, value)?);
                    config.connect_timeout = timeout;
                    config.socket_timeout = timeout;
                }
                "connect-timeout" => config.connect_timeout = Duration::from_millis(number(&key, value)?),
                "socket-timeout" => config.socket_timeout = Duration::from_millis(number(&key, value)?),
                "password" => config.password = Some(resolve_secret(value, master_key)?),
                "db" | "database" => config.database = number(&key, value)?,
                "tls" => config.tls = number(&key, value)?,
                "forced-expiration-minutes" => {
                    config.forced_expiration_grace = Duration::from_secs(60 * number::<u64>(&key, value)?);
                }
                "sorted-set-grace-minutes" => {
                    config.sorted_set_grace = Duration::from_secs(60 * number::<u64>(&key, value)?);
                }
                "sweep-ceiling" => config.sweep_ceiling = Duration::from_secs(number(&key, value)?),
                _ => warn!(key = %key, "ignoring unknown redis configuration key"),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate values that cannot be checked while parsing.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.hosts.is_empty() {
            return Err(StoreError::Config("host list must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(StoreError::Config("pool must be at least 1".into()));
        }
        if self.mode == ClusterMode::Sentinel && self.master.is_empty() {
            return Err(StoreError::Config("sentinel mode requires a master name".into()));
        }
        if self.sweep_ceiling < Duration::from_secs(1) {
            return Err(StoreError::Config("sweep-ceiling must be at least 1 second".into()));
        }
        Ok(())
    }

    /// `(host, port)` of every configured node.
    pub fn addresses(&self) -> Vec<(String, u16)> {
        self.hosts
            .iter()
            .map(|h| match h.rsplit_once(':') {
                Some((host, port)) => match port.parse() {
                    Ok(port) => (host.to_owned(), port),
                    Err(_) => (h.clone(), self.port),
                },
                None => (h.clone(), self.port),
            })
            .collect()
    }

    /// Connection URL for every configured node.
    pub fn urls(&self) -> Vec<String> {
        self.addresses()
            .into_iter()
            .map(|(host, port)| self.url_for(&host, port, true))
            .collect()
    }

    /// Sentinel URLs; sentinels are addressed without the data password or
    /// database.
    pub fn sentinel_urls(&self) -> Vec<String> {
        self.addresses()
            .into_iter()
            .map(|(host, port)| self.url_for(&host, port, false))
            .collect()
    }

    fn url_for(&self, host: &str, port: u16, with_auth: bool) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let auth = match (&self.password, with_auth) {
            (Some(pw), true) => format!(":{}@", utf8_percent_encode(pw.expose_secret(), USERINFO)),
            _ => String::new(),
        };
        let db = if with_auth && self.mode != ClusterMode::Cluster {
            format!("/{}", self.database)
        } else {
            String::new()
        };
        format!("{scheme}://{auth}{host}:{port}{db}")
    }
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Config(format!("invalid value for {key}: {value:?}")))
}

fn resolve_secret(value: &str, master_key: Option<&MasterKey>) -> Result<SecretString, StoreError> {
    if !is_encrypted(value) {
        return Ok(SecretString::new(value.to_owned()));
    }
    let key = master_key.ok_or_else(|| {
        StoreError::Config("password is encrypted but no master key was provided".into())
    })?;
    decrypt_value(value, key).map_err(|e| StoreError::Config(format!("password: {e}")))
}

/// Split on commas outside `[...]`, so `ENC[...]` envelopes survive intact.
fn split_pairs(s: &str) -> Vec<&str> {
    let mut pairs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                pairs.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pairs.push(&s[start..]);
    pairs.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use cairn_crypto::encrypt_value;

    use super::*;

    #[test]
    fn defaults() {
        let cfg = RedisConfig::parse("").unwrap();
        assert_eq!(cfg.mode, ClusterMode::Single);
        assert_eq!(cfg.expiration, ExpirationKind::Notification);
        assert_eq!(cfg.urls(), vec!["redis://localhost:6379/0"]);
        assert_eq!(cfg.forced_expiration_grace, Duration::from_secs(60));
        assert_eq!(cfg.sorted_set_grace, Duration::from_secs(300));
    }

    #[test]
    fn parses_full_string() {
        let cfg = RedisConfig::parse(
            "pool=32, mode=cluster, host=a/b:7001, port=7000, expiration=ZRANGE, timeout=1500, \
             socket-timeout=250, sorted-set-grace-minutes=2, sweep-ceiling=30",
        )
        .unwrap();
        assert_eq!(cfg.pool_size, 32);
        assert_eq!(cfg.mode, ClusterMode::Cluster);
        assert_eq!(
            cfg.addresses(),
            vec![("a".to_owned(), 7000), ("b".to_owned(), 7001)]
        );
        assert_eq!(cfg.expiration, ExpirationKind::SortedSet);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.socket_timeout, Duration::from_millis(250));
        assert_eq!(cfg.sorted_set_grace, Duration::from_secs(120));
        assert_eq!(cfg.sweep_ceiling, Duration::from_secs(30));
        assert_eq!(cfg.urls(), vec!["redis://a:7000", "redis://b:7001"]);
    }

    #[test]
    fn rejects_unknown_literals() {
        assert!(matches!(RedisConfig::parse("mode=RING"), Err(StoreError::Config(_))));
        assert!(matches!(
            RedisConfig::parse("expiration=LAZY"),
            Err(StoreError::Config(_))
        ));
        assert!(matches!(RedisConfig::parse("pool=many"), Err(StoreError::Config(_))));
        assert!(matches!(RedisConfig::parse("host=/"), Err(StoreError::Config(_))));
        assert!(matches!(RedisConfig::parse("novalue"), Err(StoreError::Config(_))));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = RedisConfig::parse("colour=blue,port=6380").unwrap();
        assert_eq!(cfg.port, 6380);
    }

    #[test]
    fn password_is_encoded_into_urls() {
        let cfg = RedisConfig::parse("password=p@ss/word,db=3,tls=true").unwrap();
        assert_eq!(cfg.urls(), vec!["rediss://:p%40ss%2Fword@localhost:6379/3"]);
        assert_eq!(cfg.sentinel_urls(), vec!["rediss://localhost:6379"]);
    }

    #[test]
    fn password_escapes_reserved_and_non_ascii_bytes() {
        let cfg = RedisConfig::parse("password=pä:ss w~x").unwrap();
        assert_eq!(cfg.urls(), vec!["redis://:p%C3%A4%3Ass%20w~x@localhost:6379/0"]);
    }

    #[test]
    fn encrypted_password_needs_master_key() {
        let key = MasterKey::derive("ops");
        let envelope = encrypt_value("s3cret", &key, None).unwrap();
        let raw = format!("host=r1,password={envelope},pool=4");

        assert!(matches!(RedisConfig::parse(&raw), Err(StoreError::Config(_))));

        let cfg = RedisConfig::parse_with_master_key(&raw, Some(&key)).unwrap();
        assert_eq!(cfg.password.unwrap().expose_secret(), "s3cret");
        assert_eq!(cfg.pool_size, 4);
    }
}
