use std::env;
use std::time::Duration;

/// Parsed once in `main` from environment variables (§4.9). A
/// recognized-but-malformed value is a fatal startup error, never a silent
/// fallback to its default; an unset variable falls back to the documented
/// default below.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_addr: String,
    pub max_senders: usize,
    pub sender_timeout: Duration,
    pub batch_interval: Duration,
    pub max_batch_size: usize,
    pub write_queue_cap: usize,
    pub slow_consumer_deadline: Duration,
    pub drain_deadline: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port: u16 = parse_env_or("PORT", 8080);
        Self {
            port,
            bind_addr: format!("0.0.0.0:{port}"),
            max_senders: parse_env_or("MAX_SENDERS", 25),
            sender_timeout: Duration::from_secs(parse_env_or("SENDER_TIMEOUT", 120)),
            batch_interval: Duration::from_millis(parse_env_or("BATCH_INTERVAL", 1000)),
            max_batch_size: parse_env_or("MAX_BATCH_SIZE", 10),
            write_queue_cap: parse_env_or("WRITE_QUEUE_CAP", 64),
            slow_consumer_deadline: Duration::from_secs(parse_env_or("SLOW_CONSUMER_DEADLINE", 5)),
            drain_deadline: Duration::from_secs(parse_env_or("DRAIN_DEADLINE", 5)),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
        }
    }
}

fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|err| panic!("invalid {key} value {raw:?}: {err}")),
        Err(_) => default,
    }
}
