//! Derived statistics: pure functions over a normalized series.
//!
//! Every function tolerates short input and returns a neutral value
//! (`0.0`, `None`, [`DividendFrequency::NotAvailable`], `false`) instead of
//! failing. Percentages are rounded to 2 decimals.

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::{DowngradeConfig, MetricsConfig};
use crate::models::{CalendarEvent, DividendSeries, PriceSeries, UpcomingDividend};

const TRADING_DAYS: f64 = 252.0;

/// CAGR horizons in years, split into the short- and long-term groups.
pub const SHORT_TERM_HORIZONS: [u32; 2] = [1, 2];
pub const LONG_TERM_HORIZONS: [u32; 4] = [5, 10, 15, 20];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DividendFrequency {
    Monthly,
    Quarterly,
    #[serde(rename = "Semi-Annually")]
    SemiAnnually,
    Annually,
    Irregular,
    #[serde(rename = "N/A")]
    NotAvailable,
}

/// All price-derived statistics of one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceMetrics {
    pub volatility: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub short_term_cagr: Option<f64>,
    pub long_term_cagr: Option<f64>,
    pub is_downgrading: bool,
}

impl PriceMetrics {
    pub fn compute(prices: &PriceSeries, config: &MetricsConfig, today: NaiveDate) -> Self {
        let cagr = historical_cagr(prices, today);
        Self {
            volatility: volatility(prices),
            max_drawdown: max_drawdown(prices),
            sharpe_ratio: sharpe_ratio(prices, config.risk_free_rate),
            short_term_cagr: cagr.short_term,
            long_term_cagr: cagr.long_term,
            is_downgrading: is_downgrading(prices, &config.downgrade),
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Day-over-day fractional changes. Steps from a zero price are skipped.
fn daily_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .filter(|r| r.is_finite())
        .collect()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample standard deviation; `None` below two observations.
fn std_dev(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    Some(var.sqrt())
}

// ─── Risk ───────────────────────────────────────────────────────────

/// Annualised volatility of daily returns, in percent.
pub fn volatility(prices: &PriceSeries) -> f64 {
    let returns = daily_returns(&prices.prices());
    match std_dev(&returns) {
        Some(sd) => round2(sd * TRADING_DAYS.sqrt() * 100.0),
        None => 0.0,
    }
}

/// Deepest fall below the running maximum, in percent (zero or negative).
pub fn max_drawdown(prices: &PriceSeries) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for p in prices.prices() {
        peak = peak.max(p);
        if peak > 0.0 {
            worst = worst.min((p - peak) / peak);
        }
    }
    round2(worst * 100.0) + 0.0
}

/// Annualised Sharpe ratio of daily returns against `risk_free_rate` (annual).
pub fn sharpe_ratio(prices: &PriceSeries, risk_free_rate: f64) -> f64 {
    let returns = daily_returns(&prices.prices());
    let Some(sd) = std_dev(&returns) else {
        return 0.0;
    };
    if sd == 0.0 || !sd.is_finite() {
        return 0.0;
    }
    let daily_rf = risk_free_rate / TRADING_DAYS;
    round2((mean(&returns) - daily_rf) / sd * TRADING_DAYS.sqrt())
}

// ─── Dividends ──────────────────────────────────────────────────────

/// Classify the mean number of dividends per calendar year.
pub fn dividend_frequency(dividends: &DividendSeries) -> DividendFrequency {
    if dividends.len() < 2 {
        return DividendFrequency::NotAvailable;
    }

    let mut per_year: BTreeMap<i32, u32> = BTreeMap::new();
    for d in dividends.points() {
        *per_year.entry(d.date.year()).or_default() += 1;
    }
    let avg = per_year.values().sum::<u32>() as f64 / per_year.len() as f64;

    if avg >= 11.0 {
        DividendFrequency::Monthly
    } else if avg >= 3.5 {
        DividendFrequency::Quarterly
    } else if avg >= 2.0 {
        DividendFrequency::SemiAnnually
    } else if avg >= 1.0 {
        DividendFrequency::Annually
    } else {
        DividendFrequency::Irregular
    }
}

/// Quarterly estimate of the next declared dividend.
///
/// Only projected when the calendar date is on/after the last priced day and
/// the yield (percent) is positive.
pub fn upcoming_dividend(
    calendar: &CalendarEvent,
    prices: &PriceSeries,
    dividend_yield: Option<f64>,
) -> UpcomingDividend {
    let (Some(date), Some(last), Some(yld)) = (calendar.dividend_date, prices.last(), dividend_yield)
    else {
        return UpcomingDividend::default();
    };
    if date < last.date || yld <= 0.0 {
        return UpcomingDividend::default();
    }

    let amount = (yld / 100.0 * last.price) / 4.0;
    if !amount.is_finite() {
        return UpcomingDividend::default();
    }
    UpcomingDividend {
        date: Some(date),
        price: Some(amount),
    }
}

// ─── Growth ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CagrSummary {
    pub short_term: Option<f64>,
    pub long_term: Option<f64>,
}

/// CAGR (percent) from the last price at/before `today - years` to the latest price.
pub fn cagr_for_horizon(prices: &PriceSeries, today: NaiveDate, years: u32) -> Option<f64> {
    let points = prices.points();
    let end = points.last()?.price;
    let start_date = today - Duration::days(365 * i64::from(years));

    let idx = points.partition_point(|p| p.date <= start_date);
    let start = points.get(idx.checked_sub(1)?)?.price;
    if start <= 0.0 || end <= 0.0 || years == 0 {
        return None;
    }

    let cagr = (end / start).powf(1.0 / f64::from(years)) - 1.0;
    cagr.is_finite().then(|| round2(cagr * 100.0))
}

/// Average CAGR over the short- and long-term horizon groups.
pub fn historical_cagr(prices: &PriceSeries, today: NaiveDate) -> CagrSummary {
    if prices.is_empty() {
        return CagrSummary::default();
    }

    let combine = |horizons: &[u32]| {
        let values: Vec<f64> = horizons
            .iter()
            .filter_map(|&y| cagr_for_horizon(prices, today, y))
            .collect();
        (!values.is_empty()).then(|| round2(mean(&values)))
    };

    CagrSummary {
        short_term: combine(&SHORT_TERM_HORIZONS),
        long_term: combine(&LONG_TERM_HORIZONS),
    }
}

// ─── Trend ──────────────────────────────────────────────────────────

/// Sharp drop on heavy volume below both moving averages.
///
/// Needs `min_points` prices and a volume on each of the last
/// `volume_window` days; otherwise the check is skipped (`false`).
pub fn is_downgrading(prices: &PriceSeries, cfg: &DowngradeConfig) -> bool {
    let points = prices.points();
    let n = points.len();
    let needed = cfg
        .min_points
        .max(cfg.short_window)
        .max(cfg.long_window)
        .max(cfg.volume_window)
        .max(cfg.lookback + 1);
    if n < needed || cfg.short_window == 0 || cfg.long_window == 0 || cfg.volume_window == 0 {
        return false;
    }

    let window_mean = |w: usize| mean(&points[n - w..].iter().map(|p| p.price).collect::<Vec<_>>());
    let ma_short = window_mean(cfg.short_window);
    let ma_long = window_mean(cfg.long_window);

    let volumes: Option<Vec<f64>> = points[n - cfg.volume_window..]
        .iter()
        .map(|p| p.volume.map(|v| v as f64))
        .collect();
    let Some(volumes) = volumes else {
        return false;
    };
    let avg_volume = mean(&volumes);

    let latest = &points[n - 1];
    let Some(latest_volume) = latest.volume else {
        return false;
    };
    let earlier = points[n - 1 - cfg.lookback].price;

    latest.price < cfg.price_drop_ratio * earlier
        && latest_volume as f64 > cfg.volume_spike_ratio * avg_volume
        && latest.price < ma_short
        && latest.price < ma_long
}

// ─── Tests ──────────────────────────────────────────────────────────
