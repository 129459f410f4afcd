use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::service::ServiceOptions;
use crate::support::clock::Clock;

#[derive(Clone, Debug)]
pub struct Config {
    /// In-memory store when unset.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub sweep_interval: Duration,
    pub sweep_concurrency: usize,
    pub channel_capacity: usize,
    pub vote_attempts: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
        where F: Fn(&str) -> Option<String>
    {
        let database_url = lookup("EASYPOLL_DATABASE_URL")
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty());

        Ok(Self {
            database_url,
            database_max_connections: positive(&lookup, "EASYPOLL_DATABASE_MAX_CONNECTIONS", 10)?,
            sweep_interval: Duration::from_secs(positive(&lookup, "EASYPOLL_SWEEP_INTERVAL_SECS", 60)?),
            sweep_concurrency: positive(&lookup, "EASYPOLL_SWEEP_CONCURRENCY", 8)?,
            channel_capacity: positive(&lookup, "EASYPOLL_CHANNEL_CAPACITY", 64)?,
            vote_attempts: positive(&lookup, "EASYPOLL_VOTE_ATTEMPTS", 3)?,
        })
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            channel_capacity: self.channel_capacity,
            vote_attempts: self.vote_attempts,
            sweep_interval: self.sweep_interval,
            sweep_concurrency: self.sweep_concurrency,
            clock: Clock::System,
        }
    }
}

fn positive<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
    where F: Fn(&str) -> Option<String>,
          T: FromStr + PartialEq + Default,
          T::Err: Display
{
    let raw = match lookup(key) {
        None => return Ok(default),
        Some(v) => v,
    };

    let value = raw.trim().parse::<T>()
        .map_err(|e| anyhow!("{} is invalid ('{}'): {}", key, raw, e))?;

    if value == T::default() {
        bail!("{} must be greater than zero", key);
    }

    Ok(value)
}
