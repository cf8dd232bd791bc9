//! Provider payloads → domain types.

use crate::models::{
    CalendarEvent, DividendPoint, DividendSeries, FundHoldings, Holding, IssuerInfo, PriceColumn,
    PricePoint, PriceSeries, SectorWeight,
};
use crate::provider::{HistoryRow, PriceHistory, ProviderError};
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

// ── Chart API ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    events: Option<ChartEvents>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartEvents {
    dividends: Option<HashMap<String, DividendEvent>>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: Option<f64>,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

fn api_error(symbol: &str, err: Option<ApiError>) -> ProviderError {
    match err {
        Some(e) if e.code == "Not Found" => ProviderError::NotFound(symbol.to_string()),
        Some(e) => ProviderError::Malformed(format!("{}: {}", e.code, e.description)),
        None => ProviderError::Empty(format!("no result for {}", symbol)),
    }
}

fn chart_data(symbol: &str, resp: ChartResponse) -> Result<ChartData, ProviderError> {
    let ChartResult { result, error } = resp.chart;
    result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| api_error(symbol, error))
}

fn epoch_date(ts: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.naive_utc().date())
}

/// Daily rows from a chart payload. Rows with neither close column are dropped.
pub fn parse_chart_history(symbol: &str, resp: ChartResponse) -> Result<PriceHistory, ProviderError> {
    let data = chart_data(symbol, resp)?;
    let Some(timestamps) = data.timestamp else {
        return Ok(PriceHistory::default());
    };

    let quote = data.indicators.quote.into_iter().next();
    let adj = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    let mut rows = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let Some(date) = epoch_date(ts) else { continue };
        let close = quote.as_ref().and_then(|q| q.close.get(i).copied().flatten());
        let volume = quote.as_ref().and_then(|q| q.volume.get(i).copied().flatten());
        let adj_close = adj.as_ref().and_then(|a| a.get(i).copied().flatten());

        if close.is_none() && adj_close.is_none() {
            continue;
        }
        rows.push(HistoryRow { date, close, adj_close, volume });
    }

    Ok(PriceHistory { rows })
}

/// Dividend events from a chart payload requested with `events=div`.
pub fn parse_chart_dividends(symbol: &str, resp: ChartResponse) -> Result<DividendSeries, ProviderError> {
    let data = chart_data(symbol, resp)?;
    let raw = data
        .events
        .and_then(|e| e.dividends)
        .unwrap_or_default()
        .into_values()
        .filter_map(|ev| {
            Some(DividendPoint {
                date: epoch_date(ev.date)?,
                amount: ev.amount?,
            })
        })
        .collect();
    Ok(DividendSeries::normalize(raw))
}

/// Pick adjusted close when the provider supplied any, otherwise close.
///
/// The choice is made once for the whole history.
pub fn select_price_series(history: &PriceHistory) -> PriceSeries {
    let has_adj = history.rows.iter().any(|r| r.adj_close.is_some());
    let column = if has_adj { PriceColumn::AdjClose } else { PriceColumn::Close };

    let raw = history
        .rows
        .iter()
        .filter_map(|r| {
            let price = match column {
                PriceColumn::AdjClose => r.adj_close?,
                PriceColumn::Close => r.close?,
            };
            Some(PricePoint { date: r.date, price, volume: r.volume })
        })
        .collect();

    PriceSeries::normalize(column, raw)
}

// ── Quote summary API ─────────────────────────────────────────────────────────

/// Modules merged into the issuer attribute bag; earlier modules win on clashes.
pub const INFO_MODULES: [&str; 8] = [
    "price",
    "quoteType",
    "summaryDetail",
    "financialData",
    "defaultKeyStatistics",
    "assetProfile",
    "summaryProfile",
    "fundProfile",
];

fn summary_result(symbol: &str, body: Value) -> Result<Map<String, Value>, ProviderError> {
    let mut summary = match body {
        Value::Object(mut m) => match m.remove("quoteSummary") {
            Some(Value::Object(s)) => s,
            _ => return Err(ProviderError::Malformed("missing quoteSummary".into())),
        },
        _ => return Err(ProviderError::Malformed("expected a JSON object".into())),
    };

    let first = match summary.remove("result") {
        Some(Value::Array(results)) => results.into_iter().next(),
        _ => None,
    };
    match first {
        Some(Value::Object(m)) => Ok(m),
        _ => {
            let err = summary
                .remove("error")
                .and_then(|e| serde_json::from_value::<ApiError>(e).ok());
            Err(api_error(symbol, err))
        }
    }
}

/// `{ "raw": 1.2, "fmt": "1.20" }` → `1.2`; scalars pass through; other
/// containers are dropped.
fn scalar(v: Value) -> Option<Value> {
    match v {
        Value::Object(mut m) => match m.remove("raw") {
            Some(raw) if !raw.is_object() && !raw.is_array() => Some(raw),
            _ => None,
        },
        Value::Array(_) | Value::Null => None,
        other => Some(other),
    }
}

/// Flatten the quote-summary modules into one attribute bag.
///
/// Yields come back as fractions and are stored in percent.
pub fn flatten_quote_summary(symbol: &str, body: Value) -> Result<IssuerInfo, ProviderError> {
    let mut modules = summary_result(symbol, body)?;
    let mut attrs = BTreeMap::new();

    for name in INFO_MODULES {
        let Some(Value::Object(module)) = modules.remove(name) else { continue };
        for (key, value) in module {
            if attrs.contains_key(&key) {
                continue;
            }
            if let Some(v) = scalar(value) {
                attrs.insert(key, v);
            }
        }
    }

    // funds report `yield` rather than `dividendYield`
    let fraction = attrs
        .get("dividendYield")
        .or_else(|| attrs.get("yield"))
        .and_then(Value::as_f64);
    if let Some(y) = fraction {
        attrs.insert("dividendYield".to_string(), Value::from(y * 100.0));
    }

    Ok(IssuerInfo::new(attrs))
}

/// Next declared dividend date from the `calendarEvents` module.
pub fn parse_calendar(symbol: &str, body: Value) -> Result<CalendarEvent, ProviderError> {
    let mut modules = summary_result(symbol, body)?;
    let dividend_date = match modules.remove("calendarEvents") {
        Some(Value::Object(mut cal)) => cal
            .remove("dividendDate")
            .and_then(scalar)
            .and_then(|v| v.as_i64())
            .and_then(epoch_date),
        _ => None,
    };
    Ok(CalendarEvent { dividend_date })
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// Top holdings and non-zero sector weights from the `topHoldings` module.
pub fn parse_fund_holdings(symbol: &str, body: Value) -> Result<FundHoldings, ProviderError> {
    let mut modules = summary_result(symbol, body)?;
    let Some(Value::Object(mut top)) = modules.remove("topHoldings") else {
        return Ok(FundHoldings::default());
    };

    let top_holdings = match top.remove("holdings") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|h| {
                let weight = h.get("holdingPercent").cloned().and_then(scalar)?.as_f64()?;
                Some(Holding {
                    ticker_code: h.get("symbol")?.as_str()?.to_string(),
                    company_name: h
                        .get("holdingName")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    weight: round6(weight),
                })
            })
            .collect(),
        _ => Vec::new(),
    };

    let sector_weights = match top.remove("sectorWeightings") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|entry| match entry {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .flatten()
            .filter_map(|(sector, v)| {
                let value = scalar(v)?.as_f64()?;
                (value > 0.0).then_some(SectorWeight { sector, value })
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(FundHoldings { top_holdings, sector_weights })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
