use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

use parley_gateway::bus::DEFAULT_CAPACITY;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub event_capacity: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = get("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLEY_JWT_SECRET is unset or still a placeholder");
        }

        let host = get("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = get("PARLEY_PORT")
            .unwrap_or_else(|| "4000".into())
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", host, port))?;

        let db_path = get("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into()).into();

        let event_capacity = match get("PARLEY_EVENT_CAPACITY") {
            Some(v) => v
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .context("PARLEY_EVENT_CAPACITY must be a positive integer")?,
            None => DEFAULT_CAPACITY,
        };

        Ok(Self {
            addr,
            db_path,
            jwt_secret,
            event_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = config(&[("PARLEY_JWT_SECRET", "hunter2hunter2")]).unwrap();
        assert_eq!(config.addr.port(), 4000);
        assert_eq!(config.db_path, PathBuf::from("parley.db"));
        assert_eq!(config.event_capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn placeholder_or_missing_secret_is_fatal() {
        assert!(config(&[]).is_err());
        assert!(config(&[("PARLEY_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn malformed_values_are_rejected() {
        let secret = ("PARLEY_JWT_SECRET", "hunter2hunter2");
        assert!(config(&[secret, ("PARLEY_PORT", "http")]).is_err());
        assert!(config(&[secret, ("PARLEY_EVENT_CAPACITY", "0")]).is_err());
        assert!(config(&[secret, ("PARLEY_HOST", "not a host")]).is_err());

        let custom = config(&[secret, ("PARLEY_HOST", "127.0.0.1"), ("PARLEY_PORT", "9000")]).unwrap();
        assert_eq!(custom.addr.to_string(), "127.0.0.1:9000");
    }
}
