use std::time::Duration;

use anyhow::{bail, Result};

/// Runtime configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_url: String,
    /// None runs single-instance mode: no leader election, no exec locks.
    pub redis_url: Option<String>,

    pub worker_max_consecutive_errors: usize,
    pub worker_error_window_seconds: u64,
    pub worker_retry_base_delay: Duration,
    pub worker_retry_max_delay: Duration,
    pub worker_retry_jitter: bool,

    pub simulator_maker_fee: f64,
    pub simulator_taker_fee: f64,
    pub simulator_default_slippage: f64,
    pub mock_initial_balance: f64,

    pub default_max_positions: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = match std::env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => bail!("DATABASE_URL is required"),
        };
        let redis_url = std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty());

        let config = Self {
            database_url,
            redis_url,
            worker_max_consecutive_errors: env_or("WORKER_MAX_CONSECUTIVE_ERRORS", 5),
            worker_error_window_seconds: env_or("WORKER_ERROR_WINDOW_SECONDS", 600),
            worker_retry_base_delay: Duration::from_secs_f64(env_or(
                "WORKER_RETRY_BASE_DELAY",
                2.0,
            )),
            worker_retry_max_delay: Duration::from_secs_f64(env_or(
                "WORKER_RETRY_MAX_DELAY",
                60.0,
            )),
            worker_retry_jitter: env_or("WORKER_RETRY_JITTER", true),
            simulator_maker_fee: env_or("SIMULATOR_MAKER_FEE", 0.0002),
            simulator_taker_fee: env_or("SIMULATOR_TAKER_FEE", 0.0005),
            simulator_default_slippage: env_or("SIMULATOR_DEFAULT_SLIPPAGE", 0.001),
            mock_initial_balance: env_or("MOCK_INITIAL_BALANCE", 10_000.0),
            default_max_positions: env_or("DEFAULT_MAX_POSITIONS", 3),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_max_consecutive_errors == 0 {
            bail!("WORKER_MAX_CONSECUTIVE_ERRORS must be >= 1");
        }
        if self.worker_retry_base_delay > self.worker_retry_max_delay {
            bail!("WORKER_RETRY_BASE_DELAY must not exceed WORKER_RETRY_MAX_DELAY");
        }
        if self.mock_initial_balance <= 0.0 {
            bail!("MOCK_INITIAL_BALANCE must be positive");
        }
        if self.default_max_positions == 0 {
            bail!("DEFAULT_MAX_POSITIONS must be >= 1");
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            redis_url: None,
            worker_max_consecutive_errors: 5,
            worker_error_window_seconds: 600,
            worker_retry_base_delay: Duration::from_secs(2),
            worker_retry_max_delay: Duration::from_secs(60),
            worker_retry_jitter: true,
            simulator_maker_fee: 0.0002,
            simulator_taker_fee: 0.0005,
            simulator_default_slippage: 0.001,
            mock_initial_balance: 10_000.0,
            default_max_positions: 3,
        }
    }
}
