use std::{env, time::Duration};

/// Tunables for the bridge. Defaults match the browser bootstrap's expectations.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Pending statements allowed per session before producers have to wait.
    pub queue_capacity: usize,
    /// How many backoff periods a producer waits for queue space.
    pub enqueue_attempts: u32,
    pub enqueue_backoff: Duration,
    /// How long a `next` poll is held open when no statement is pending.
    pub poll_timeout: Duration,
    /// Default wait for a synchronous evaluation reply.
    pub eval_timeout: Duration,
    /// A page without activity for this long is no longer alive.
    pub page_expiry: Duration,
    pub sweep_interval: Duration,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: env_parse("RIPTIDE_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity),
            enqueue_attempts: env_parse("RIPTIDE_ENQUEUE_ATTEMPTS")
                .unwrap_or(defaults.enqueue_attempts),
            enqueue_backoff: env_millis("RIPTIDE_ENQUEUE_BACKOFF_MS")
                .unwrap_or(defaults.enqueue_backoff),
            poll_timeout: env_millis("RIPTIDE_POLL_TIMEOUT_MS").unwrap_or(defaults.poll_timeout),
            eval_timeout: env_millis("RIPTIDE_EVAL_TIMEOUT_MS").unwrap_or(defaults.eval_timeout),
            page_expiry: env_millis("RIPTIDE_PAGE_EXPIRY_MS").unwrap_or(defaults.page_expiry),
            sweep_interval: env_millis("RIPTIDE_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.sweep_interval),
        }
    }

    /// Total time a producer may wait for queue space.
    pub fn enqueue_budget(&self) -> Duration {
        self.enqueue_backoff * self.enqueue_attempts
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            enqueue_attempts: 10,
            enqueue_backoff: Duration::from_millis(100),
            poll_timeout: Duration::from_secs(5),
            eval_timeout: Duration::from_secs(10),
            page_expiry: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
