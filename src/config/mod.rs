use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Data provider connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_history_range")]
    pub history_range: String,

    #[serde(default = "default_fallback_history_range")]
    pub fallback_history_range: String,

    /// Window for FX quotes; the last close in it is the rate.
    #[serde(default = "default_fx_history_range")]
    pub fx_history_range: String,

    /// Random pause before each symbol's first request.
    #[serde(default = "default_pre_fetch_delay_min_ms")]
    pub pre_fetch_delay_min_ms: u64,

    #[serde(default = "default_pre_fetch_delay_max_ms")]
    pub pre_fetch_delay_max_ms: u64,
}

/// Per-call retry settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff")]
    pub backoff: f64,

    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,

    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Batch fan-out and whole-batch retry rounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Fraction of workers dropped per retry round.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,

    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    #[serde(default = "default_round_delay_min_secs")]
    pub round_delay_min_secs: u64,

    #[serde(default = "default_round_delay_max_secs")]
    pub round_delay_max_secs: u64,
}

/// Statistics parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Annual rate used by the Sharpe ratio.
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,

    #[serde(default)]
    pub downgrade: DowngradeConfig,
}

/// Thresholds of the trend-downgrade heuristic
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DowngradeConfig {
    #[serde(default = "default_min_points")]
    pub min_points: usize,

    #[serde(default = "default_short_window")]
    pub short_window: usize,

    #[serde(default = "default_long_window")]
    pub long_window: usize,

    #[serde(default = "default_volume_window")]
    pub volume_window: usize,

    #[serde(default = "default_lookback")]
    pub lookback: usize,

    #[serde(default = "default_price_drop_ratio")]
    pub price_drop_ratio: f64,

    #[serde(default = "default_volume_spike_ratio")]
    pub volume_spike_ratio: f64,
}

/// Output locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_error_log")]
    pub error_log: PathBuf,

    #[serde(default = "default_summary_file")]
    pub summary_file: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://query2.finance.yahoo.com".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) ticker-export/0.1".to_string()
}
fn default_history_range() -> String {
    "max".to_string()
}
fn default_fallback_history_range() -> String {
    "20y".to_string()
}
fn default_fx_history_range() -> String {
    "5d".to_string()
}
fn default_pre_fetch_delay_min_ms() -> u64 {
    100
}
fn default_pre_fetch_delay_max_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    2000
}
fn default_backoff() -> f64 {
    2.0
}
fn default_jitter_min_ms() -> u64 {
    100
}
fn default_jitter_max_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_workers() -> usize {
    20
}
fn default_min_workers() -> usize {
    10
}
fn default_decay_rate() -> f64 {
    0.2
}
fn default_max_rounds() -> u32 {
    5
}
fn default_round_delay_min_secs() -> u64 {
    5
}
fn default_round_delay_max_secs() -> u64 {
    10
}
fn default_risk_free_rate() -> f64 {
    0.01
}
fn default_min_points() -> usize {
    200
}
fn default_short_window() -> usize {
    50
}
fn default_long_window() -> usize {
    200
}
fn default_volume_window() -> usize {
    20
}
fn default_lookback() -> usize {
    5
}
fn default_price_drop_ratio() -> f64 {
    0.95
}
fn default_volume_spike_ratio() -> f64 {
    1.5
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_error_log() -> PathBuf {
    PathBuf::from("error.log")
}
fn default_summary_file() -> String {
    "all.json".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            history_range: default_history_range(),
            fallback_history_range: default_fallback_history_range(),
            fx_history_range: default_fx_history_range(),
            pre_fetch_delay_min_ms: default_pre_fetch_delay_min_ms(),
            pre_fetch_delay_max_ms: default_pre_fetch_delay_max_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff: default_backoff(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_workers: default_min_workers(),
            decay_rate: default_decay_rate(),
            max_rounds: default_max_rounds(),
            round_delay_min_secs: default_round_delay_min_secs(),
            round_delay_max_secs: default_round_delay_max_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: default_risk_free_rate(),
            downgrade: DowngradeConfig::default(),
        }
    }
}

impl Default for DowngradeConfig {
    fn default() -> Self {
        Self {
            min_points: default_min_points(),
            short_window: default_short_window(),
            long_window: default_long_window(),
            volume_window: default_volume_window(),
            lookback: default_lookback(),
            price_drop_ratio: default_price_drop_ratio(),
            volume_spike_ratio: default_volume_spike_ratio(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            error_log: default_error_log(),
            summary_file: default_summary_file(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("TICKER_EXPORT").separator("__"))
            .build()
            .context("Failed to read configuration sources")?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.batch.max_workers, 20);
        assert_eq!(cfg.batch.min_workers, 10);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.metrics.downgrade.long_window, 200);
        assert_eq!(cfg.output.summary_file, "all.json");
    }

    #[test]
    fn test_partial_toml_overrides() {
        let toml = r#"
            [batch]
            max_workers = 4

            [metrics.downgrade]
            price_drop_ratio = 0.9
        "#;
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.batch.max_workers, 4);
        assert_eq!(cfg.batch.max_rounds, 5);
        assert_eq!(cfg.metrics.downgrade.price_drop_ratio, 0.9);
        assert_eq!(cfg.metrics.downgrade.volume_spike_ratio, 1.5);
    }
}
