use std::time::Duration;

/// Engine configuration with environment overrides.
///
/// Every knob has a default; `from_env` reads `STRATA_*` variables and
/// falls back to the default on absence or parse failure.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-level concurrency cap for the executor. `None` means all nodes
    /// of a level are dispatched at once.
    pub level_fanout: Option<usize>,
    /// Default retry budget for new executions and nodes.
    pub default_max_retries: u32,
    /// Number of broker workers. Defaults to the CPU count.
    pub workers: usize,
    /// Hard per-job timeout enforced by the worker.
    pub hard_timeout: Duration,
    /// Soft per-job timeout; triggers a graceful abort before the hard
    /// limit is reached.
    pub soft_timeout: Duration,
    /// Outbound buffer size per event-bus connection.
    pub send_buffer: usize,
    /// Completed executions older than this many days are deleted.
    pub retention_completed_days: i64,
    /// Failed executions (retries exhausted) older than this are deleted.
    pub retention_failed_days: i64,
    /// Interval between maintenance sweeps. Missed ticks are skipped.
    pub cleanup_interval: Duration,
    /// Bind port for the reference HTTP server.
    pub api_port: u16,
}

const DEFAULT_API_PORT: u16 = 8000;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            level_fanout: None,
            default_max_retries: 3,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            hard_timeout: Duration::from_secs(3600),
            soft_timeout: Duration::from_secs(3300),
            send_buffer: 256,
            retention_completed_days: 30,
            retention_failed_days: 7,
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            api_port: DEFAULT_API_PORT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            level_fanout: env_parse::<usize>("STRATA_LEVEL_FANOUT").filter(|&n| n > 0),
            default_max_retries: env_parse("STRATA_DEFAULT_MAX_RETRIES")
                .unwrap_or(defaults.default_max_retries),
            workers: env_parse::<usize>("STRATA_WORKERS")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.workers),
            hard_timeout: env_parse("STRATA_HARD_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.hard_timeout),
            soft_timeout: env_parse("STRATA_SOFT_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.soft_timeout),
            send_buffer: env_parse::<usize>("STRATA_SEND_BUFFER")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.send_buffer),
            retention_completed_days: env_parse("STRATA_RETENTION_COMPLETED_DAYS")
                .unwrap_or(defaults.retention_completed_days),
            retention_failed_days: env_parse("STRATA_RETENTION_FAILED_DAYS")
                .unwrap_or(defaults.retention_failed_days),
            cleanup_interval: env_parse("STRATA_CLEANUP_INTERVAL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            api_port: env_parse("STRATA_API_PORT").unwrap_or(defaults.api_port),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.level_fanout, None);
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.hard_timeout, Duration::from_secs(3600));
        assert_eq!(config.soft_timeout, Duration::from_secs(3300));
        assert_eq!(config.send_buffer, 256);
        assert_eq!(config.retention_completed_days, 30);
        assert_eq!(config.retention_failed_days, 7);
    }
}
