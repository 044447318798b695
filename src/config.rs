use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;

/// Runtime settings, read from the environment (and `.env` when present).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub db_max_connections: u32,

    /// Presence is demoted to offline after this much silence, even if the
    /// socket never sent a close frame.
    pub presence_ttl: Duration,
    pub presence_sweep: Duration,

    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Bound of each connection's outbound queue. A connection whose queue is
    /// full gets closed.
    pub outbound_queue: usize,
    pub auth_timeout: Duration,
    pub ticket_ttl: Duration,

    pub session_idle_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://whispers.db".to_owned(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            db_max_connections: 16,
            presence_ttl: Duration::from_secs(5 * 60),
            presence_sweep: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            outbound_queue: 64,
            auth_timeout: Duration::from_secs(10),
            ticket_ttl: Duration::from_secs(60),
            session_idle_minutes: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: parse(&lookup, "BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.db_max_connections),
            presence_ttl: secs(&lookup, "PRESENCE_TTL_SECS")?.unwrap_or(defaults.presence_ttl),
            presence_sweep: secs(&lookup, "PRESENCE_SWEEP_SECS")?
                .unwrap_or(defaults.presence_sweep),
            ping_interval: secs(&lookup, "PING_INTERVAL_SECS")?.unwrap_or(defaults.ping_interval),
            pong_timeout: secs(&lookup, "PONG_TIMEOUT_SECS")?.unwrap_or(defaults.pong_timeout),
            outbound_queue: parse(&lookup, "OUTBOUND_QUEUE")?.unwrap_or(defaults.outbound_queue),
            auth_timeout: secs(&lookup, "AUTH_TIMEOUT_SECS")?.unwrap_or(defaults.auth_timeout),
            ticket_ttl: secs(&lookup, "TICKET_TTL_SECS")?.unwrap_or(defaults.ticket_ttl),
            session_idle_minutes: parse(&lookup, "SESSION_IDLE_MINUTES")?
                .unwrap_or(defaults.session_idle_minutes),
        };

        anyhow::ensure!(config.outbound_queue > 0, "OUTBOUND_QUEUE must be positive");
        anyhow::ensure!(!config.presence_ttl.is_zero(), "PRESENCE_TTL_SECS must be positive");
        anyhow::ensure!(!config.presence_sweep.is_zero(), "PRESENCE_SWEEP_SECS must be positive");
        anyhow::ensure!(!config.ping_interval.is_zero(), "PING_INTERVAL_SECS must be positive");
        anyhow::ensure!(
            config.pong_timeout > config.ping_interval,
            "PONG_TIMEOUT_SECS must exceed PING_INTERVAL_SECS"
        );
        // keepalives must land inside the staleness window or idle users flap
        anyhow::ensure!(
            config.presence_ttl > config.pong_timeout,
            "PRESENCE_TTL_SECS must exceed PONG_TIMEOUT_SECS"
        );

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("invalid {key}: {raw:?}")))
        .transpose()
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<Duration>> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_secs))
}
