//! Per-symbol fetch: provider calls → normalized series → metrics → record.
//!
//! ```text
//! Pending → FetchingHistory → FetchingInfo → FetchingAuxiliary
//!         → ComputingMetrics → Assembled          (or Failed at any stage)
//! ```
//!
//! History and info are mandatory. Calendar and fund holdings degrade to
//! empty values once their retries run out.

use crate::config::{MetricsConfig, ProviderConfig};
use crate::metrics::{dividend_frequency, upcoming_dividend, PriceMetrics};
use crate::models::{
    CalendarEvent, DividendSeries, Events, FundHoldings, IssuerInfo, PriceInfo, PriceSeries,
    QuoteType, RecordInfo, Symbol, TickerRecord,
};
use crate::pipeline::{BatchTask, TaskFailure};
use crate::provider::cleaner::select_price_series;
use crate::provider::{ProviderError, QuoteProvider};
use crate::retry::{RetryError, RetryPolicy};
use crate::utils::random_delay;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Stages / errors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    Pending,
    FetchingHistory,
    FetchingInfo,
    FetchingAuxiliary,
    ComputingMetrics,
    Assembled,
}

impl fmt::Display for FetchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::FetchingHistory => "fetching history",
            Self::FetchingInfo => "fetching info",
            Self::FetchingAuxiliary => "fetching dividends/calendar",
            Self::ComputingMetrics => "computing metrics",
            Self::Assembled => "assembled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Provider(#[from] RetryError<ProviderError>),

    #[error("history has no priced rows")]
    EmptyHistory,
}

/// A symbol that could not be turned into a record.
#[derive(Debug, Error)]
#[error("failed to fetch {symbol} while {stage}")]
pub struct FetchError {
    pub symbol: Symbol,
    pub stage: FetchStage,
    #[source]
    pub source: StageError,
}

impl TaskFailure for FetchError {
    fn report(&self) -> String {
        format!("failed to fetch {}: {}", self.symbol, root_cause_message(self))
    }

    /// Rejected requests and histories without a usable price.
    fn is_permanent(&self) -> bool {
        match &self.source {
            StageError::Provider(e) => matches!(e, RetryError::Rejected { .. }),
            StageError::EmptyHistory => true,
        }
    }
}

/// Message of the innermost error in a `source()` chain.
pub fn root_cause_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

// ── Fetcher ───────────────────────────────────────────────────────────────────

pub struct TickerFetcher {
    provider: Arc<dyn QuoteProvider>,
    retry: RetryPolicy,
    metrics: MetricsConfig,
    history_range: String,
    fallback_history_range: String,
    pre_fetch_delay: (Duration, Duration),
}

struct Progress<'a> {
    symbol: &'a Symbol,
    stage: FetchStage,
}

impl Progress<'_> {
    fn enter(&mut self, stage: FetchStage) {
        debug!("{}: {}", self.symbol, stage);
        self.stage = stage;
    }

    fn fail(&self, source: impl Into<StageError>) -> FetchError {
        FetchError {
            symbol: self.symbol.clone(),
            stage: self.stage,
            source: source.into(),
        }
    }
}

impl TickerFetcher {
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        retry: RetryPolicy,
        provider_config: &ProviderConfig,
        metrics: MetricsConfig,
    ) -> Self {
        Self {
            provider,
            retry,
            metrics,
            history_range: provider_config.history_range.clone(),
            fallback_history_range: provider_config.fallback_history_range.clone(),
            pre_fetch_delay: (
                Duration::from_millis(provider_config.pre_fetch_delay_min_ms),
                Duration::from_millis(provider_config.pre_fetch_delay_max_ms),
            ),
        }
    }

    /// Fetch everything for `symbol` and assemble its record.
    pub async fn fetch(&self, symbol: &Symbol) -> Result<TickerRecord, FetchError> {
        let started = Utc::now();
        let mut progress = Progress { symbol, stage: FetchStage::Pending };
        random_delay(self.pre_fetch_delay.0, self.pre_fetch_delay.1).await;

        progress.enter(FetchStage::FetchingHistory);
        let prices = self.fetch_prices(symbol).await.map_err(|e| progress.fail(e))?;

        progress.enter(FetchStage::FetchingInfo);
        let info = self
            .retry
            .run("info", || self.provider.info(symbol))
            .await
            .map_err(|e| progress.fail(e))?;

        progress.enter(FetchStage::FetchingAuxiliary);
        let calendar = match self.retry.run("calendar", || self.provider.calendar(symbol)).await {
            Ok(c) => c,
            Err(e) => {
                warn!("{}: skipping calendar ({}): {}", symbol, e, e.last());
                CalendarEvent::default()
            }
        };
        let dividends = self
            .retry
            .run("dividends", || self.provider.dividends(symbol))
            .await
            .map_err(|e| progress.fail(e))?;
        if dividends.is_empty() {
            debug!("{}: no dividend history", symbol);
        }

        let quote_type = info.quote_type();
        let holdings = if quote_type.is_fund() {
            Some(self.fetch_holdings(symbol).await)
        } else {
            None
        };

        progress.enter(FetchStage::ComputingMetrics);
        let record = self.assemble(symbol, started, quote_type, &info, prices, dividends, &calendar, holdings);

        progress.enter(FetchStage::Assembled);
        info!(
            "{}: {} prices, {} dividends, volatility {:.2}%",
            symbol,
            record.data.len(),
            record.dividends.len(),
            record.info.volatility
        );
        Ok(record)
    }

    /// Full history, falling back once to a shorter range when it comes back empty.
    async fn fetch_prices(&self, symbol: &Symbol) -> Result<PriceSeries, StageError> {
        let history = self
            .retry
            .run("history", || async {
                let history = self.provider.history(symbol, &self.history_range).await?;
                if !history.is_empty() {
                    return Ok(history);
                }
                debug!(
                    "{}: '{}' history empty, trying '{}'",
                    symbol, self.history_range, self.fallback_history_range
                );
                let history = self
                    .provider
                    .history(symbol, &self.fallback_history_range)
                    .await?;
                if history.is_empty() {
                    return Err(ProviderError::Empty(format!("no price history for {}", symbol)));
                }
                Ok::<_, ProviderError>(history)
            })
            .await?;

        let prices = select_price_series(&history);
        if prices.is_empty() {
            return Err(StageError::EmptyHistory);
        }
        debug!("{}: {} priced rows ({:?})", symbol, prices.len(), prices.column());
        Ok(prices)
    }

    async fn fetch_holdings(&self, symbol: &Symbol) -> FundHoldings {
        match self
            .retry
            .run("fund holdings", || self.provider.fund_holdings(symbol))
            .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!("{}: skipping holdings ({}): {}", symbol, e, e.last());
                FundHoldings::default()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        symbol: &Symbol,
        started: DateTime<Utc>,
        quote_type: QuoteType,
        info: &IssuerInfo,
        prices: PriceSeries,
        dividends: DividendSeries,
        calendar: &CalendarEvent,
        holdings: Option<FundHoldings>,
    ) -> TickerRecord {
        let metrics = PriceMetrics::compute(&prices, &self.metrics, started.date_naive());
        let dividend_yield = info.number("dividendYield");

        let latest = prices.last().map(|p| p.price).unwrap_or_default();
        let current_price = info.number("currentPrice").unwrap_or(latest);

        let market_cap = if quote_type.is_fund() {
            info.number("totalAssets").or_else(|| info.number("marketCap"))
        } else {
            info.number("marketCap")
        };

        let or_placeholder = |value: String| match quote_type.fund_placeholder() {
            Some(p) if value.is_empty() => p.to_string(),
            _ => value,
        };

        let record_info = RecordInfo {
            company_name: info.text("longName"),
            company_description: info.text("longBusinessSummary"),
            exchange: info.text("exchange"),
            industry: or_placeholder(info.text("industry")),
            sector: or_placeholder(info.text("sector")),
            website: info.text("website"),
            country: info.text("country"),
            currency: info.text("currency"),
            beta: info.number("beta"),
            payout_ratio: info.number("payoutRatio"),
            dividend_yield,
            dividend_frequency: dividend_frequency(&dividends),
            volatility: metrics.volatility,
            max_drawdown: metrics.max_drawdown,
            sharpe_ratio: metrics.sharpe_ratio,
            short_term_cagr: metrics.short_term_cagr,
            long_term_cagr: metrics.long_term_cagr,
            is_downgrading: metrics.is_downgrading,
            market_cap,
            quote_type,
        };

        TickerRecord {
            ticker_code: symbol.clone(),
            info: record_info,
            events: Events {
                dividends: upcoming_dividend(calendar, &prices, dividend_yield),
            },
            price_info: PriceInfo { current_price },
            price_column: prices.column(),
            data: prices.points().to_vec(),
            dividends: dividends.points().to_vec(),
            holdings,
            fetched_at: started.naive_utc(),
        }
    }
}

#[async_trait]
impl BatchTask for TickerFetcher {
    type Key = Symbol;
    type Output = TickerRecord;
    type Error = FetchError;

    async fn execute(&self, symbol: &Symbol) -> Result<TickerRecord, FetchError> {
        self.fetch(symbol).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{DividendPoint, Holding, PriceColumn};
    use crate::provider::{HistoryRow, PriceHistory};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    /// Scripted provider: each call pops the next canned answer, the last
    /// answer repeats once the script runs out.
    #[derive(Default)]
    pub(crate) struct ScriptedProvider {
        pub history: Mutex<HashMap<String, Vec<Result<PriceHistory, String>>>>,
        pub info: Mutex<HashMap<String, IssuerInfo>>,
        pub calendar_fails: bool,
        pub always_fail: Vec<String>,
        pub not_found: Vec<String>,
        pub calls: Mutex<HashMap<&'static str, u32>>,
    }

    fn transient(msg: &str) -> ProviderError {
        ProviderError::Empty(msg.to_string())
    }

    impl ScriptedProvider {
        fn bump(&self, call: &'static str) {
            *self.calls.lock().unwrap().entry(call).or_default() += 1;
        }

        pub fn calls(&self, call: &str) -> u32 {
            self.calls.lock().unwrap().get(call).copied().unwrap_or_default()
        }

        fn failing(&self, symbol: &Symbol) -> Option<ProviderError> {
            if self.not_found.iter().any(|s| s == symbol.as_str()) {
                return Some(ProviderError::NotFound(symbol.to_string()));
            }
            self.always_fail
                .iter()
                .any(|s| s == symbol.as_str())
                .then(|| ProviderError::Status { status: 503, url: "scripted".into() })
        }
    }

    pub(crate) fn sample_history(days: usize) -> PriceHistory {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        PriceHistory {
            rows: (0..days)
                .map(|i| HistoryRow {
                    date: start + chrono::Duration::days(i as i64),
                    close: Some(100.0 + i as f64),
                    adj_close: Some(99.0 + i as f64),
                    volume: Some(1_000),
                })
                .collect(),
        }
    }

    pub(crate) fn sample_info(quote_type: &str) -> IssuerInfo {
        let mut m = BTreeMap::new();
        m.insert("longName".into(), json!("Sample Co"));
        m.insert("quoteType".into(), json!(quote_type));
        m.insert("marketCap".into(), json!(2.0e9));
        m.insert("totalAssets".into(), json!(5.0e8));
        m.insert("dividendYield".into(), json!(2.0));
        m.insert("currency".into(), json!("USD"));
        IssuerInfo::new(m)
    }

    #[async_trait]
    impl QuoteProvider for ScriptedProvider {
        async fn history(&self, symbol: &Symbol, _range: &str) -> Result<PriceHistory, ProviderError> {
            self.bump("history");
            if let Some(err) = self.failing(symbol) {
                return Err(err);
            }
            let mut scripts = self.history.lock().unwrap();
            match scripts.get_mut(symbol.as_str()) {
                Some(script) if script.len() > 1 => script.remove(0).map_err(|e| transient(&e)),
                Some(script) => script[0].clone().map_err(|e| transient(&e)),
                None => Ok(sample_history(30)),
            }
        }

        async fn info(&self, symbol: &Symbol) -> Result<IssuerInfo, ProviderError> {
            self.bump("info");
            Ok(self
                .info
                .lock()
                .unwrap()
                .get(symbol.as_str())
                .cloned()
                .unwrap_or_else(|| sample_info("EQUITY")))
        }

        async fn dividends(&self, _symbol: &Symbol) -> Result<DividendSeries, ProviderError> {
            self.bump("dividends");
            let d = |m| NaiveDate::from_ymd_opt(2023, m, 1).unwrap();
            Ok(DividendSeries::normalize(
                [3, 6, 9, 12]
                    .into_iter()
                    .map(|m| DividendPoint { date: d(m), amount: 0.5 })
                    .collect(),
            ))
        }

        async fn calendar(&self, _symbol: &Symbol) -> Result<CalendarEvent, ProviderError> {
            self.bump("calendar");
            if self.calendar_fails {
                return Err(transient("calendar unavailable"));
            }
            Ok(CalendarEvent { dividend_date: NaiveDate::from_ymd_opt(2030, 1, 1) })
        }

        async fn fund_holdings(&self, _symbol: &Symbol) -> Result<FundHoldings, ProviderError> {
            self.bump("fund_holdings");
            Ok(FundHoldings {
                top_holdings: vec![Holding {
                    ticker_code: "AAPL".into(),
                    company_name: "Apple Inc.".into(),
                    weight: 0.07,
                }],
                sector_weights: vec![],
            })
        }
    }

    pub(crate) fn fetcher(provider: Arc<ScriptedProvider>, attempts: u32) -> TickerFetcher {
        let cfg = ProviderConfig {
            pre_fetch_delay_min_ms: 0,
            pre_fetch_delay_max_ms: 0,
            ..ProviderConfig::default()
        };
        TickerFetcher::new(provider, RetryPolicy::immediate(attempts), &cfg, MetricsConfig::default())
    }

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_assembles_equity_record() {
        let provider = Arc::new(ScriptedProvider::default());
        let record = assert_ok!(fetcher(provider.clone(), 3).fetch(&sym("acme")).await);

        assert_eq!(record.ticker_code.as_str(), "ACME");
        assert_eq!(record.data.len(), 30);
        // adjusted close column is used throughout
        assert_eq!(record.data[0].price, 99.0);
        assert_eq!(record.price_column, PriceColumn::AdjClose);
        assert_eq!(record.info.market_cap, Some(2.0e9));
        assert_eq!(record.info.company_name, "Sample Co");
        assert_eq!(record.info.industry, "");
        assert_eq!(record.price_info.current_price, 128.0);
        assert!(record.holdings.is_none());
        assert_eq!(record.events.dividends.date, NaiveDate::from_ymd_opt(2030, 1, 1));
        assert!((record.events.dividends.price.unwrap() - 0.64).abs() < 1e-9);
        assert_eq!(provider.calls("fund_holdings"), 0);
    }

    #[tokio::test]
    async fn test_fund_gets_holdings_and_total_assets() {
        let provider = ScriptedProvider::default();
        provider.info.lock().unwrap().insert("SPY".into(), sample_info("ETF"));
        let provider = Arc::new(provider);

        let record = assert_ok!(fetcher(provider.clone(), 1).fetch(&sym("SPY")).await);
        assert_eq!(record.info.market_cap, Some(5.0e8));
        assert_eq!(record.info.sector, "Exchange-Traded Fund");
        assert_eq!(record.holdings.unwrap().top_holdings.len(), 1);
    }

    #[tokio::test]
    async fn test_calendar_failure_is_recoverable() {
        let provider = Arc::new(ScriptedProvider { calendar_fails: true, ..Default::default() });
        let record = assert_ok!(fetcher(provider.clone(), 3).fetch(&sym("ACME")).await);

        assert_eq!(record.events.dividends.date, None);
        assert_eq!(record.events.dividends.price, None);
        assert_eq!(provider.calls("calendar"), 3);
    }

    #[tokio::test]
    async fn test_empty_max_history_falls_back() {
        let provider = ScriptedProvider::default();
        provider.history.lock().unwrap().insert(
            "OLD".into(),
            vec![Ok(PriceHistory::default()), Ok(sample_history(5))],
        );
        let provider = Arc::new(provider);

        let record = assert_ok!(fetcher(provider.clone(), 1).fetch(&sym("OLD")).await);
        assert_eq!(record.data.len(), 5);
        assert_eq!(provider.calls("history"), 2);
    }

    #[tokio::test]
    async fn test_history_failure_aborts_with_root_cause() {
        let provider = ScriptedProvider::default();
        provider
            .history
            .lock()
            .unwrap()
            .insert("GONE".into(), vec![Err("provider timed out".into())]);
        let provider = Arc::new(provider);

        let err = assert_err!(fetcher(provider.clone(), 3).fetch(&sym("GONE")).await);
        assert_eq!(err.stage, FetchStage::FetchingHistory);
        assert!(!err.is_permanent());
        assert_eq!(err.report(), "failed to fetch GONE: empty response: provider timed out");
        assert_eq!(provider.calls("history"), 3);
        assert_eq!(provider.calls("info"), 0);
    }

    #[tokio::test]
    async fn test_unknown_symbol_fails_permanently_without_retry() {
        let provider = Arc::new(ScriptedProvider {
            not_found: vec!["NOPE".into()],
            ..Default::default()
        });

        let err = assert_err!(fetcher(provider.clone(), 5).fetch(&sym("NOPE")).await);
        assert!(err.is_permanent());
        assert_eq!(err.report(), "failed to fetch NOPE: symbol not found: NOPE");
        assert_eq!(provider.calls("history"), 1);
    }

    #[tokio::test]
    async fn test_fetched_at_is_taken_when_the_fetch_starts() {
        let provider = Arc::new(ScriptedProvider::default());
        let before = Utc::now().naive_utc();
        let record = assert_ok!(fetcher(provider, 1).fetch(&sym("ACME")).await);
        let after = Utc::now().naive_utc();

        assert!(before <= record.fetched_at && record.fetched_at <= after);
    }

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer(#[source] Middle);

    #[derive(Debug, Error)]
    #[error("middle")]
    struct Middle(#[source] Inner);

    #[derive(Debug, Error)]
    #[error("connection reset by peer")]
    struct Inner;

    #[test]
    fn test_root_cause_walks_to_deepest_error() {
        let err = Outer(Middle(Inner));
        assert_eq!(root_cause_message(&err), "connection reset by peer");
        assert_eq!(root_cause_message(&Inner), "connection reset by peer");
    }
}
