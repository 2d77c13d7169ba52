use crate::queue::RetryPolicy;
use anyhow::{bail, Context, Result};
use std::{fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

/// Runtime settings, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub storage_dir: PathBuf,
    /// URL prefix under which stored attachments are served
    pub storage_url_prefix: String,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub bus_channel_capacity: usize,
    /// `(name, token)` pairs provisioned at startup
    pub bootstrap_users: Vec<(String, String)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_path = match get("DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                // ~/.chatrooms/chatrooms.db
                let home_dir = get("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir)
                    .join(".chatrooms")
                    .join("chatrooms.db")
            }
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy::new(
            parse(&get, "QUEUE_MAX_ATTEMPTS", defaults.max_attempts)?,
            Duration::from_millis(parse(
                &get,
                "QUEUE_BACKOFF_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
            Duration::from_millis(parse(
                &get,
                "QUEUE_BACKOFF_MAX_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
        );

        Ok(Self {
            database_path,
            bind_addr: parse(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            storage_dir: get("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("storage")),
            storage_url_prefix: "/storage".to_string(),
            queue_capacity: parse(&get, "QUEUE_CAPACITY", 1024usize)?,
            retry,
            bus_channel_capacity: parse(&get, "BUS_CHANNEL_CAPACITY", 100usize)?,
            bootstrap_users: parse_users(&get("BOOTSTRAP_USERS").unwrap_or_default())?,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}

/// Parses `name:token,name:token`.
fn parse_users(raw: &str) -> Result<Vec<(String, String)>> {
    let mut users = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, token)) = entry.split_once(':') else {
            bail!("BOOTSTRAP_USERS entry {:?} is not name:token", entry);
        };
        let (name, token) = (name.trim(), token.trim());
        if name.is_empty() || token.is_empty() {
            bail!("BOOTSTRAP_USERS entry {:?} has an empty name or token", entry);
        }
        users.push((name.to_string(), token.to_string()));
    }
    Ok(users)
}
