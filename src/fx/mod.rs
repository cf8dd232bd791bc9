//! FX conversion rates for currency pairs.
//!
//! A rate is the last close of the provider's `<FROM><TO>=X` quote (`<TO>=X`
//! when quoting from USD). Pence sterling (`GBp`) is never quoted directly:
//! it converts through `GBP` and is scaled by 100 on the way.

use crate::config::ProviderConfig;
use crate::models::{FxPair, FxRate, Symbol, SymbolError};
use crate::pipeline::{BatchTask, TaskFailure};
use crate::provider::{ProviderError, QuoteProvider};
use crate::retry::{RetryError, RetryPolicy};
use crate::utils::random_delay;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const PENCE: &str = "GBp";
const POUNDS: &str = "GBP";

// ── Conversion plan ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    /// Known without asking the provider.
    Fixed(f64),
    /// Last close of `symbol`, multiplied by `scale`.
    Quote { symbol: Symbol, scale: f64 },
}

/// Decide how to price `pair`.
pub fn plan_conversion(pair: &FxPair) -> Result<Conversion, SymbolError> {
    let (from, to) = (pair.from.as_str(), pair.to.as_str());
    if from == PENCE && to == POUNDS {
        return Ok(Conversion::Fixed(0.01));
    }
    if from == POUNDS && to == PENCE {
        return Ok(Conversion::Fixed(100.0));
    }

    let (from, to, scale) = if from == PENCE {
        (POUNDS, to, 0.01)
    } else if to == PENCE {
        (from, POUNDS, 100.0)
    } else {
        (from, to, 1.0)
    };

    if from.eq_ignore_ascii_case(to) {
        return Ok(Conversion::Fixed(1.0));
    }

    let code = if from.eq_ignore_ascii_case("USD") {
        format!("{}=X", to)
    } else {
        format!("{}{}=X", from, to)
    };
    Ok(Conversion::Quote { symbol: Symbol::parse(&code)?, scale })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FxStageError {
    #[error(transparent)]
    Provider(#[from] RetryError<ProviderError>),

    #[error("invalid currency pair")]
    InvalidPair(#[from] SymbolError),
}

#[derive(Debug, Error)]
#[error("failed to fetch {pair}")]
pub struct FxError {
    pub pair: FxPair,
    #[source]
    pub source: FxStageError,
}

impl TaskFailure for FxError {
    fn report(&self) -> String {
        format!(
            "failed to fetch {}: {}",
            self.pair,
            crate::fetcher::root_cause_message(self)
        )
    }

    fn is_permanent(&self) -> bool {
        match &self.source {
            FxStageError::Provider(e) => matches!(e, RetryError::Rejected { .. }),
            FxStageError::InvalidPair(_) => true,
        }
    }
}

// ── Fetcher ───────────────────────────────────────────────────────────────────

pub struct FxFetcher {
    provider: Arc<dyn QuoteProvider>,
    retry: RetryPolicy,
    history_range: String,
    pre_fetch_delay: (Duration, Duration),
}

impl FxFetcher {
    pub fn new(provider: Arc<dyn QuoteProvider>, retry: RetryPolicy, config: &ProviderConfig) -> Self {
        Self {
            provider,
            retry,
            history_range: config.fx_history_range.clone(),
            pre_fetch_delay: (
                Duration::from_millis(config.pre_fetch_delay_min_ms),
                Duration::from_millis(config.pre_fetch_delay_max_ms),
            ),
        }
    }

    pub async fn fetch(&self, pair: &FxPair) -> Result<FxRate, FxError> {
        let started = Utc::now();
        let fail = |source: FxStageError| FxError { pair: pair.clone(), source };

        let conversion_rate = match plan_conversion(pair).map_err(|e| fail(e.into()))? {
            Conversion::Fixed(rate) => {
                debug!("{}: fixed rate {}", pair, rate);
                rate
            }
            Conversion::Quote { symbol, scale } => {
                random_delay(self.pre_fetch_delay.0, self.pre_fetch_delay.1).await;
                let close = self.last_close(&symbol).await.map_err(|e| fail(e.into()))?;
                close * scale
            }
        };

        info!("{}: {}", pair, conversion_rate);
        Ok(FxRate {
            pair: pair.clone(),
            conversion_rate,
            fetched_at: started.naive_utc(),
        })
    }

    async fn last_close(&self, symbol: &Symbol) -> Result<f64, RetryError<ProviderError>> {
        self.retry
            .run("fx quote", || async {
                let history = self.provider.history(symbol, &self.history_range).await?;
                history
                    .rows
                    .iter()
                    .rev()
                    .find_map(|r| r.close)
                    .ok_or_else(|| ProviderError::Empty(format!("no FX data found for {}", symbol)))
            })
            .await
    }
}

#[async_trait]
impl BatchTask for FxFetcher {
    type Key = FxPair;
    type Output = FxRate;
    type Error = FxError;

    async fn execute(&self, pair: &FxPair) -> Result<FxRate, FxError> {
        self.fetch(pair).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::fetcher::tests::ScriptedProvider;
    use crate::pipeline::BatchRunner;
    use crate::provider::PriceHistory;
    use tokio_test::{assert_err, assert_ok};

    fn pair(from: &str, to: &str) -> FxPair {
        FxPair { from: from.into(), to: to.into() }
    }

    fn fx(provider: Arc<ScriptedProvider>, attempts: u32) -> FxFetcher {
        let cfg = ProviderConfig {
            pre_fetch_delay_min_ms: 0,
            pre_fetch_delay_max_ms: 0,
            ..ProviderConfig::default()
        };
        FxFetcher::new(provider, RetryPolicy::immediate(attempts), &cfg)
    }

    fn quote(code: &str, scale: f64) -> Conversion {
        Conversion::Quote { symbol: Symbol::parse(code).unwrap(), scale }
    }

    #[test]
    fn test_pence_rules() {
        assert_eq!(plan_conversion(&pair("GBp", "GBP")).unwrap(), Conversion::Fixed(0.01));
        assert_eq!(plan_conversion(&pair("GBP", "GBp")).unwrap(), Conversion::Fixed(100.0));
        assert_eq!(plan_conversion(&pair("GBp", "USD")).unwrap(), quote("GBPUSD=X", 0.01));
        assert_eq!(plan_conversion(&pair("EUR", "GBp")).unwrap(), quote("EURGBP=X", 100.0));
        assert_eq!(plan_conversion(&pair("USD", "GBp")).unwrap(), quote("GBP=X", 100.0));
        assert_eq!(plan_conversion(&pair("GBp", "GBp")).unwrap(), Conversion::Fixed(1.0));
    }

    #[test]
    fn test_quote_symbols() {
        assert_eq!(plan_conversion(&pair("EUR", "USD")).unwrap(), quote("EURUSD=X", 1.0));
        assert_eq!(plan_conversion(&pair("USD", "JPY")).unwrap(), quote("JPY=X", 1.0));
        assert_eq!(plan_conversion(&pair("usd", "USD")).unwrap(), Conversion::Fixed(1.0));
        assert!(plan_conversion(&pair("EU R", "USD")).is_err());
    }

    #[tokio::test]
    async fn test_rate_is_last_close() {
        // unscripted symbols get 30 rows closing at 100..=129
        let provider = Arc::new(ScriptedProvider::default());
        let rate = assert_ok!(fx(provider.clone(), 1).fetch(&pair("EUR", "USD")).await);

        assert_eq!(rate.pair, pair("EUR", "USD"));
        assert_eq!(rate.conversion_rate, 129.0);
        assert_eq!(provider.calls("history"), 1);
    }

    #[tokio::test]
    async fn test_pence_rates_are_scaled() {
        let provider = Arc::new(ScriptedProvider::default());
        let fetcher = fx(provider.clone(), 1);

        let from_pence = assert_ok!(fetcher.fetch(&pair("GBp", "USD")).await);
        assert!((from_pence.conversion_rate - 1.29).abs() < 1e-9);

        let to_pence = assert_ok!(fetcher.fetch(&pair("USD", "GBp")).await);
        assert!((to_pence.conversion_rate - 12_900.0).abs() < 1e-6);

        let fixed = assert_ok!(fetcher.fetch(&pair("GBp", "GBP")).await);
        assert_eq!(fixed.conversion_rate, 0.01);
        assert_eq!(provider.calls("history"), 2);
    }

    #[tokio::test]
    async fn test_empty_quote_is_retried_then_reported() {
        let provider = ScriptedProvider::default();
        provider
            .history
            .lock()
            .unwrap()
            .insert("CHFUSD=X".into(), vec![Ok(PriceHistory::default())]);
        let provider = Arc::new(provider);

        let err = assert_err!(fx(provider.clone(), 3).fetch(&pair("CHF", "USD")).await);
        assert!(!err.is_permanent());
        assert_eq!(
            err.report(),
            "failed to fetch CHFUSD: empty response: no FX data found for CHFUSD=X"
        );
        assert_eq!(provider.calls("history"), 3);
    }

    #[tokio::test]
    async fn test_unknown_quote_is_permanent() {
        let provider = Arc::new(ScriptedProvider {
            not_found: vec!["XXXYYY=X".into()],
            ..Default::default()
        });

        let err = assert_err!(fx(provider.clone(), 4).fetch(&pair("XXX", "YYY")).await);
        assert!(err.is_permanent());
        assert_eq!(provider.calls("history"), 1);
    }

    #[tokio::test]
    async fn test_batch_over_pairs() {
        let provider = Arc::new(ScriptedProvider {
            not_found: vec!["XXXUSD=X".into()],
            ..Default::default()
        });
        let config = BatchConfig {
            max_workers: 2,
            min_workers: 1,
            decay_rate: 0.5,
            max_rounds: 3,
            round_delay_min_secs: 0,
            round_delay_max_secs: 0,
        };
        let runner = BatchRunner::new(Arc::new(fx(provider.clone(), 1)), config);
        let pairs = [pair("EUR", "USD"), pair("GBp", "GBP"), pair("XXX", "USD")];

        let (result, stats) = runner.run(&pairs, |rate| Ok(rate.conversion_rate)).await;

        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.rounds, 1);
        assert_eq!(result.succeeded()[&pair("GBp", "GBP")], 0.01);
        assert_eq!(
            result.failed()[&pair("XXX", "USD")],
            "failed to fetch XXXUSD: symbol not found: XXXUSD=X"
        );
    }
}
