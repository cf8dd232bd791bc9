pub mod cleaner;
pub mod http_client;
pub mod yahoo;

use crate::models::{CalendarEvent, DividendSeries, FundHoldings, IssuerInfo, Symbol};
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::retry::Retryable;

pub use self::yahoo::YahooProvider;

// ── Raw payloads ──────────────────────────────────────────────────────────────

/// One provider history row before a price column is chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub date: NaiveDate,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<u64>,
}

/// Daily history as the provider returned it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceHistory {
    pub rows: Vec<HistoryRow>,
}

impl PriceHistory {
    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.close.is_none() && r.adj_close.is_none())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("symbol not found: {0}")]
    NotFound(String),

    #[error("empty response: {0}")]
    Empty(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Retryable for ProviderError {
    /// Network trouble, throttling, server errors and empty or garbled
    /// payloads may clear up. Unknown symbols and other client errors won't.
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Empty(_) | Self::Malformed(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound(_) | Self::InvalidRequest(_) => false,
        }
    }
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable market data provider. Every call may fail transiently.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Daily history over a provider range such as `max` or `20y`.
    async fn history(&self, symbol: &Symbol, range: &str) -> Result<PriceHistory, ProviderError>;
    async fn info(&self, symbol: &Symbol) -> Result<IssuerInfo, ProviderError>;
    async fn dividends(&self, symbol: &Symbol) -> Result<DividendSeries, ProviderError>;
    async fn calendar(&self, symbol: &Symbol) -> Result<CalendarEvent, ProviderError>;
    async fn fund_holdings(&self, symbol: &Symbol) -> Result<FundHoldings, ProviderError>;
}
