use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::metrics::DividendFrequency;

// ── Symbol ────────────────────────────────────────────────────────────────────

/// Upper-cased instrument identifier, the key used everywhere in a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

#[derive(Debug, Error, PartialEq)]
pub enum SymbolError {
    #[error("symbol is empty")]
    Empty,

    #[error("symbol {0:?} contains whitespace or a path separator")]
    Invalid(String),
}

impl Symbol {
    /// Trim and upper-case `raw`. Inner whitespace and `/` are rejected.
    pub fn parse(raw: &str) -> Result<Self, SymbolError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(SymbolError::Empty);
        }
        if s.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
            return Err(SymbolError::Invalid(s.to_string()));
        }
        Ok(Self(s.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Price / dividend series ───────────────────────────────────────────────────

/// Which provider column a fetch priced its series from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PriceColumn {
    AdjClose,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub price: f64,
    #[serde(skip)]
    pub volume: Option<u64>,
}

/// Dividend events serialise with the same `{date, price}` shape as prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendPoint {
    pub date: NaiveDate,
    #[serde(rename = "price")]
    pub amount: f64,
}

/// Time-ascending, date-unique daily prices from one column.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    column: PriceColumn,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Sort, drop pre-epoch and non-finite rows, keep the last row per date.
    pub fn normalize(column: PriceColumn, raw: Vec<PricePoint>) -> Self {
        let points = normalize_by_date(raw, |p| p.date, |p| p.price.is_finite());
        Self { column, points }
    }

    pub fn column(&self) -> PriceColumn {
        self.column
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&PricePoint> {
        self.points.last()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DividendSeries {
    points: Vec<DividendPoint>,
}

impl DividendSeries {
    pub fn normalize(raw: Vec<DividendPoint>) -> Self {
        let points = normalize_by_date(raw, |d| d.date, |d| d.amount.is_finite());
        Self { points }
    }

    pub fn points(&self) -> &[DividendPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn normalize_by_date<T>(
    mut raw: Vec<T>,
    date: impl Fn(&T) -> NaiveDate,
    keep: impl Fn(&T) -> bool,
) -> Vec<T> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN);
    raw.retain(|p| date(p) >= epoch && keep(p));
    // stable sort: among equal dates the provider's last row wins below
    raw.sort_by_key(|p| date(p));

    let mut out: Vec<T> = Vec::with_capacity(raw.len());
    for p in raw {
        match out.last_mut() {
            Some(prev) if date(prev) == date(&p) => *prev = p,
            _ => out.push(p),
        }
    }
    out
}

// ── Issuer info ───────────────────────────────────────────────────────────────

/// Sparse attribute bag from the provider. Absent keys are never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssuerInfo(BTreeMap<String, Value>);

/// Look `key` up in `info`, falling back to `default`. Never fails.
pub fn lookup<'a>(info: &'a BTreeMap<String, Value>, key: &str, default: &'a Value) -> &'a Value {
    match info.get(key) {
        Some(Value::Null) | None => default,
        Some(v) => v,
    }
}

impl IssuerInfo {
    pub fn new(attrs: BTreeMap<String, Value>) -> Self {
        Self(attrs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> &Value {
        lookup(&self.0, key, &Value::Null)
    }

    /// String attribute, or `""`.
    pub fn text(&self, key: &str) -> String {
        match self.get(key) {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => String::new(),
        }
    }

    /// Numeric attribute. Numeric strings are accepted, anything else is `None`.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
            Value::String(s) => s.trim().parse().ok().filter(|v: &f64| v.is_finite()),
            _ => None,
        }
    }

    pub fn quote_type(&self) -> QuoteType {
        QuoteType::from_provider(&self.text("quoteType"))
    }
}

// ── Instrument type ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteType {
    Equity,
    Etf,
    MutualFund,
    Other(String),
}

impl QuoteType {
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "EQUITY" => Self::Equity,
            "ETF" => Self::Etf,
            "MUTUALFUND" => Self::MutualFund,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_fund(&self) -> bool {
        matches!(self, Self::Etf | Self::MutualFund)
    }

    /// Industry/sector stand-in for funds that report neither.
    pub fn fund_placeholder(&self) -> Option<&'static str> {
        match self {
            Self::Etf => Some("Exchange-Traded Fund"),
            Self::MutualFund => Some("Mutual Fund"),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Equity => "EQUITY",
            Self::Etf => "ETF",
            Self::MutualFund => "MUTUALFUND",
            Self::Other(s) => s,
        }
    }
}

impl Serialize for QuoteType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

// ── Calendar / holdings ───────────────────────────────────────────────────────

/// Provider-declared upcoming events. Empty when the calendar was unavailable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalendarEvent {
    pub dividend_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub ticker_code: String,
    pub company_name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorWeight {
    pub sector: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundHoldings {
    pub top_holdings: Vec<Holding>,
    pub sector_weights: Vec<SectorWeight>,
}

// ── Output records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpcomingDividend {
    pub date: Option<NaiveDate>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Events {
    pub dividends: UpcomingDividend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceInfo {
    pub current_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInfo {
    pub company_name: String,
    pub company_description: String,
    #[serde(rename = "type")]
    pub quote_type: QuoteType,
    pub exchange: String,
    pub industry: String,
    pub sector: String,
    pub website: String,
    pub country: String,
    pub currency: String,
    pub beta: Option<f64>,
    pub payout_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub dividend_frequency: DividendFrequency,
    pub volatility: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub short_term_cagr: Option<f64>,
    pub long_term_cagr: Option<f64>,
    pub is_downgrading: bool,
    pub market_cap: Option<f64>,
}

/// Everything fetched and derived for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerRecord {
    pub ticker_code: Symbol,
    pub info: RecordInfo,
    pub price_column: PriceColumn,
    pub data: Vec<PricePoint>,
    pub dividends: Vec<DividendPoint>,
    pub events: Events,
    pub price_info: PriceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holdings: Option<FundHoldings>,
    #[serde(skip)]
    pub fetched_at: NaiveDateTime,
}

/// Flat one-line view of a record, used by the summary export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerSummary {
    pub ticker: Symbol,
    pub company_name: String,
    pub company_description: String,
    pub industry: String,
    pub sector: String,
    pub exchange: String,
    #[serde(rename = "type")]
    pub quote_type: QuoteType,
    pub country: String,
    pub currency: String,
    pub beta: Option<f64>,
    pub volatility: f64,
    pub dividend_yield: Option<f64>,
    pub dividend_frequency: DividendFrequency,
    pub website: String,
    pub current_price: f64,
    pub market_cap: Option<f64>,
    pub short_term_cagr: Option<f64>,
    pub long_term_cagr: Option<f64>,
    pub is_downgrading: bool,
}

impl From<&TickerRecord> for TickerSummary {
    fn from(r: &TickerRecord) -> Self {
        let i = &r.info;
        Self {
            ticker: r.ticker_code.clone(),
            company_name: i.company_name.clone(),
            company_description: i.company_description.clone(),
            industry: i.industry.clone(),
            sector: i.sector.clone(),
            exchange: i.exchange.clone(),
            quote_type: i.quote_type.clone(),
            country: i.country.clone(),
            currency: i.currency.clone(),
            beta: i.beta,
            volatility: i.volatility,
            dividend_yield: i.dividend_yield,
            dividend_frequency: i.dividend_frequency,
            website: i.website.clone(),
            current_price: r.price_info.current_price,
            market_cap: i.market_cap,
            short_term_cagr: i.short_term_cagr,
            long_term_cagr: i.long_term_cagr,
            is_downgrading: i.is_downgrading,
        }
    }
}

// ── FX rates ──────────────────────────────────────────────────────────────────

/// Currency pair as listed in the input. Codes keep their case: `GBp` is
/// pence, `GBP` is pounds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FxPair {
    pub from: String,
    pub to: String,
}

impl fmt::Display for FxPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from, self.to)
    }
}

/// Units of `to` per unit of `from`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FxRate {
    #[serde(flatten)]
    pub pair: FxPair,
    pub conversion_rate: f64,
    #[serde(skip)]
    pub fetched_at: NaiveDateTime,
}

// ── Batch result ──────────────────────────────────────────────────────────────

/// Final outcome of a run: each key is in exactly one of the two maps.
#[derive(Debug)]
pub struct BatchResult<T, K = Symbol> {
    succeeded: BTreeMap<K, T>,
    failed: BTreeMap<K, String>,
}

impl<T, K> Default for BatchResult<T, K> {
    fn default() -> Self {
        Self {
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }
}

impl<T, K: Ord + Clone> BatchResult<T, K> {
    pub fn record_success(&mut self, key: K, value: T) {
        self.failed.remove(&key);
        self.succeeded.insert(key, value);
    }

    /// Ignored for a key that already succeeded.
    pub fn record_failure(&mut self, key: K, message: String) {
        if !self.succeeded.contains_key(&key) {
            self.failed.insert(key, message);
        }
    }

    pub fn succeeded(&self) -> &BTreeMap<K, T> {
        &self.succeeded
    }

    pub fn failed(&self) -> &BTreeMap<K, String> {
        &self.failed
    }

    pub fn failed_keys(&self) -> Vec<K> {
        self.failed.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_parts(self) -> (BTreeMap<K, T>, BTreeMap<K, String>) {
        (self.succeeded, self.failed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn pt(date: NaiveDate, price: f64) -> PricePoint {
        PricePoint { date, price, volume: None }
    }

    #[test]
    fn test_symbol_parse() {
        assert_eq!(Symbol::parse("  brk-b ").unwrap().as_str(), "BRK-B");
        assert_eq!(Symbol::parse("^gspc").unwrap().as_str(), "^GSPC");
        assert_eq!(Symbol::parse("   "), Err(SymbolError::Empty));
        assert!(matches!(Symbol::parse("AB CD"), Err(SymbolError::Invalid(_))));
        assert!(matches!(Symbol::parse("../x"), Err(SymbolError::Invalid(_))));
    }

    #[test]
    fn test_price_series_normalize() {
        let raw = vec![
            pt(d(2024, 1, 3), 3.0),
            pt(d(1969, 12, 31), 9.0),
            pt(d(2024, 1, 1), 1.0),
            pt(d(2024, 1, 2), f64::NAN),
            pt(d(2024, 1, 3), 4.0),
        ];
        let s = PriceSeries::normalize(PriceColumn::Close, raw);
        assert_eq!(s.prices(), vec![1.0, 4.0]);
        assert_eq!(s.points()[0].date, d(2024, 1, 1));
        assert_eq!(s.column(), PriceColumn::Close);
    }

    #[test]
    fn test_epoch_day_is_kept() {
        let s = DividendSeries::normalize(vec![DividendPoint { date: d(1970, 1, 1), amount: 0.5 }]);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_issuer_info_lookups() {
        let mut m = BTreeMap::new();
        m.insert("longName".to_string(), json!("Apple Inc."));
        m.insert("beta".to_string(), json!(1.25));
        m.insert("payoutRatio".to_string(), json!("0.15"));
        m.insert("industry".to_string(), Value::Null);
        let info = IssuerInfo::new(m);

        assert_eq!(info.text("longName"), "Apple Inc.");
        assert_eq!(info.text("industry"), "");
        assert_eq!(info.text("missing"), "");
        assert_eq!(info.number("beta"), Some(1.25));
        assert_eq!(info.number("payoutRatio"), Some(0.15));
        assert_eq!(info.number("longName"), None);

        let fallback = json!("n/a");
        assert_eq!(lookup(&BTreeMap::new(), "x", &fallback), &fallback);
    }

    #[test]
    fn test_quote_type() {
        assert_eq!(QuoteType::from_provider("etf"), QuoteType::Etf);
        assert_eq!(QuoteType::from_provider("MUTUALFUND"), QuoteType::MutualFund);
        assert!(!QuoteType::from_provider("EQUITY").is_fund());
        assert_eq!(QuoteType::from_provider("index"), QuoteType::Other("INDEX".into()));
        assert_eq!(QuoteType::Etf.fund_placeholder(), Some("Exchange-Traded Fund"));
    }

    #[test]
    fn test_batch_result_keeps_symbol_once() {
        let a = Symbol::parse("A").unwrap();
        let mut r: BatchResult<u8> = BatchResult::default();
        r.record_failure(a.clone(), "boom".into());
        assert_eq!(r.len(), 1);
        r.record_success(a.clone(), 1);
        assert_eq!(r.len(), 1);
        assert!(r.all_succeeded());
        r.record_failure(a, "late".into());
        assert_eq!(r.len(), 1);
        assert!(r.failed().is_empty());
    }

    #[test]
    fn test_fx_pairs_keep_currency_case() {
        let pence = FxPair { from: "GBp".into(), to: "USD".into() };
        let pounds = FxPair { from: "GBP".into(), to: "USD".into() };
        assert_eq!(pence.to_string(), "GBpUSD");

        let mut r: BatchResult<f64, FxPair> = BatchResult::default();
        r.record_success(pence, 0.0127);
        r.record_failure(pounds, "failed to fetch GBPUSD: timed out".into());
        assert_eq!(r.len(), 2);
        assert!(!r.all_succeeded());
    }

    #[test]
    fn test_fx_rate_serializes_flat() {
        let rate = FxRate {
            pair: FxPair { from: "EUR".into(), to: "USD".into() },
            conversion_rate: 1.08,
            fetched_at: d(2024, 1, 1).and_hms_opt(0, 0, 0).unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&rate).unwrap(),
            json!({ "from": "EUR", "to": "USD", "conversionRate": 1.08 })
        );
    }
}
