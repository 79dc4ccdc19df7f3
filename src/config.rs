//! Runtime configuration from the environment (`.env` is loaded by `main`).

use std::net::SocketAddr;

use crate::error::CollabError;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Postgres URL. When absent presence lives in process memory.
    pub database_url: Option<String>,
    /// Connections silent for longer than this are evicted.
    pub ping_timeout_secs: u64,
    pub prune_interval_secs: u64,
    /// Presence rows last seen more than this many days ago are deleted. Unset keeps them forever.
    pub retention_days: Option<i64>,
    /// Outbound frames buffered per connection before broadcasts to it are skipped.
    pub send_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database_url: None,
            ping_timeout_secs: 300,
            prune_interval_secs: 60,
            retention_days: None,
            send_buffer: 64,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, CollabError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CollabError> {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Config {
            bind_addr: parse_or(get("BIND_ADDR"), "BIND_ADDR", defaults.bind_addr)?,
            database_url: get("DATABASE_URL"),
            ping_timeout_secs: parse_or(
                get("WS_PING_TIMEOUT_SECS"),
                "WS_PING_TIMEOUT_SECS",
                defaults.ping_timeout_secs,
            )?,
            prune_interval_secs: parse_or(
                get("WS_PRUNE_INTERVAL_SECS"),
                "WS_PRUNE_INTERVAL_SECS",
                defaults.prune_interval_secs,
            )?
            .max(1),
            retention_days: match get("PRESENCE_RETENTION_DAYS") {
                None => None,
                Some(v) => {
                    let days: i64 = parse("PRESENCE_RETENTION_DAYS", &v)?;
                    if days <= 0 {
                        return Err(CollabError::Config(
                            "PRESENCE_RETENTION_DAYS must be positive".to_string(),
                        ));
                    }
                    Some(days)
                }
            },
            send_buffer: parse_or(get("WS_SEND_BUFFER"), "WS_SEND_BUFFER", defaults.send_buffer)?
                .max(1),
        })
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CollabError> {
    value
        .trim()
        .parse()
        .map_err(|_| CollabError::Config(format!("{key} has invalid value {value:?}")))
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &str,
    default: T,
) -> Result<T, CollabError> {
    match value {
        Some(v) => parse(key, &v),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<Config, CollabError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_overrides() {
        let cfg = from(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("DATABASE_URL", "postgres://localhost/walkthroughs"),
            ("WS_PING_TIMEOUT_SECS", "90"),
            ("PRESENCE_RETENTION_DAYS", "30"),
        ])
        .unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/walkthroughs"));
        assert_eq!(cfg.ping_timeout_secs, 90);
        assert_eq!(cfg.retention_days, Some(30));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(from(&[("WS_SEND_BUFFER", "lots")]), Err(CollabError::Config(_))));
        assert!(matches!(
            from(&[("PRESENCE_RETENTION_DAYS", "0")]),
            Err(CollabError::Config(_))
        ));
    }
}
