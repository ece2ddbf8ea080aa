use std::time::Duration;

use clap::Args;

pub const DEFAULT_REFRESH_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_DATE_RANGE_DAYS: u32 = 30;
pub const DEFAULT_RATE_LIMIT_PER_SEC: u32 = 5;
pub const DEFAULT_PLATFORM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Upper bound on the backfill window; matches the runaway guard on date enumeration.
pub const MAX_DATE_RANGE_CAP: u32 = 365;

/// Engine tunables, passed explicitly into the pool, client and aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub platform_base_url: Option<String>,
    pub platform_api_token: Option<String>,
    pub refresh_concurrency: usize,
    pub max_date_range_days: u32,
    pub rate_limit_per_sec: u32,
    pub platform_timeout: Duration,
    pub progress_lookback_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            platform_base_url: None,
            platform_api_token: None,
            refresh_concurrency: DEFAULT_REFRESH_CONCURRENCY,
            max_date_range_days: DEFAULT_MAX_DATE_RANGE_DAYS,
            rate_limit_per_sec: DEFAULT_RATE_LIMIT_PER_SEC,
            platform_timeout: Duration::from_secs(DEFAULT_PLATFORM_TIMEOUT_SECS),
            progress_lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

impl SyncConfig {
    /// Clamp values into the ranges the engine can honor.
    pub fn normalized(mut self) -> Self {
        self.refresh_concurrency = self.refresh_concurrency.max(1);
        self.max_date_range_days = self.max_date_range_days.clamp(1, MAX_DATE_RANGE_CAP);
        self.rate_limit_per_sec = self.rate_limit_per_sec.max(1);
        self.progress_lookback_days = self.progress_lookback_days.max(1);
        self.platform_base_url = self
            .platform_base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        self
    }
}

#[derive(Debug, Clone, Args)]
pub struct SyncArgs {
    /// Base URL of the platform REST API
    #[arg(long, env = "PLATFORM_BASE_URL", global = true)]
    pub platform_base_url: Option<String>,

    /// Bearer token sent with every platform request
    #[arg(long, env = "PLATFORM_API_TOKEN", global = true, hide_env_values = true)]
    pub platform_api_token: Option<String>,

    #[arg(long, env = "REFRESH_CONCURRENCY", global = true, default_value_t = DEFAULT_REFRESH_CONCURRENCY)]
    pub refresh_concurrency: usize,

    #[arg(long, env = "MAX_DATE_RANGE_DAYS", global = true, default_value_t = DEFAULT_MAX_DATE_RANGE_DAYS)]
    pub max_date_range_days: u32,

    #[arg(long, env = "PLATFORM_RATE_LIMIT_PER_SEC", global = true, default_value_t = DEFAULT_RATE_LIMIT_PER_SEC)]
    pub rate_limit_per_sec: u32,

    #[arg(long, env = "PLATFORM_TIMEOUT_SECS", global = true, default_value_t = DEFAULT_PLATFORM_TIMEOUT_SECS)]
    pub platform_timeout_secs: u64,

    #[arg(long, env = "PROGRESS_LOOKBACK_DAYS", global = true, default_value_t = DEFAULT_LOOKBACK_DAYS)]
    pub progress_lookback_days: i64,
}

impl SyncArgs {
    pub fn into_config(self) -> SyncConfig {
        SyncConfig {
            platform_base_url: self.platform_base_url,
            platform_api_token: self.platform_api_token,
            refresh_concurrency: self.refresh_concurrency,
            max_date_range_days: self.max_date_range_days,
            rate_limit_per_sec: self.rate_limit_per_sec,
            platform_timeout: Duration::from_secs(self.platform_timeout_secs),
            progress_lookback_days: self.progress_lookback_days,
        }
        .normalized()
    }
}
