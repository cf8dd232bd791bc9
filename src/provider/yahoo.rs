//! Yahoo Finance implementation of [`QuoteProvider`].
//!
//! History and dividends come from the v8 chart API, issuer attributes,
//! calendar and fund holdings from the v10 quote-summary API. No session or
//! crumb handling is attempted.

use crate::config::ProviderConfig;
use crate::models::{CalendarEvent, DividendSeries, FundHoldings, IssuerInfo, Symbol};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::cleaner::{
    flatten_quote_summary, parse_calendar, parse_chart_dividends, parse_chart_history,
    parse_fund_holdings, ChartResponse, INFO_MODULES,
};
use super::http_client::HttpClient;
use super::{PriceHistory, ProviderError, QuoteProvider};

/// An attribute bag smaller than this is treated as a failed lookup.
const MIN_INFO_ATTRIBUTES: usize = 5;

pub struct YahooProvider {
    client: HttpClient,
    base_url: Url,
}

impl YahooProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("Invalid provider base URL {:?}", config.base_url))?;
        Ok(Self {
            client: HttpClient::new(config)?,
            base_url,
        })
    }

    fn endpoint(&self, path: &[&str], symbol: &Symbol) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::InvalidRequest(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(path)
            .push(symbol.as_str());
        Ok(url)
    }

    /// e.g. AAPL, max → /v8/finance/chart/AAPL?range=max&interval=1d&...
    fn chart_url(&self, symbol: &Symbol, range: &str, events: &str) -> Result<Url, ProviderError> {
        let mut url = self.endpoint(&["v8", "finance", "chart"], symbol)?;
        url.query_pairs_mut()
            .append_pair("range", range)
            .append_pair("interval", "1d")
            .append_pair("events", events)
            .append_pair("includeAdjustedClose", "true");
        Ok(url)
    }

    fn summary_url(&self, symbol: &Symbol, modules: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.endpoint(&["v10", "finance", "quoteSummary"], symbol)?;
        url.query_pairs_mut().append_pair("modules", &modules.join(","));
        Ok(url)
    }
}

#[async_trait]
impl QuoteProvider for YahooProvider {
    async fn history(&self, symbol: &Symbol, range: &str) -> Result<PriceHistory, ProviderError> {
        let url = self.chart_url(symbol, range, "history")?;
        let resp: ChartResponse = self.client.get_json(&url).await?;
        let history = parse_chart_history(symbol.as_str(), resp)?;
        debug!("{}: {} history rows ({})", symbol, history.rows.len(), range);
        Ok(history)
    }

    async fn info(&self, symbol: &Symbol) -> Result<IssuerInfo, ProviderError> {
        let url = self.summary_url(symbol, &INFO_MODULES)?;
        let body: Value = self.client.get_json(&url).await?;
        let info = flatten_quote_summary(symbol.as_str(), body)?;
        if info.len() < MIN_INFO_ATTRIBUTES {
            return Err(ProviderError::Empty(format!(
                "info for {} has only {} attributes",
                symbol,
                info.len()
            )));
        }
        Ok(info)
    }

    async fn dividends(&self, symbol: &Symbol) -> Result<DividendSeries, ProviderError> {
        let url = self.chart_url(symbol, "max", "div")?;
        let resp: ChartResponse = self.client.get_json(&url).await?;
        parse_chart_dividends(symbol.as_str(), resp)
    }

    async fn calendar(&self, symbol: &Symbol) -> Result<CalendarEvent, ProviderError> {
        let url = self.summary_url(symbol, &["calendarEvents"])?;
        let body: Value = self.client.get_json(&url).await?;
        parse_calendar(symbol.as_str(), body)
    }

    async fn fund_holdings(&self, symbol: &Symbol) -> Result<FundHoldings, ProviderError> {
        let url = self.summary_url(symbol, &["topHoldings"])?;
        let body: Value = self.client.get_json(&url).await?;
        parse_fund_holdings(symbol.as_str(), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> YahooProvider {
        YahooProvider::new(&ProviderConfig::default()).unwrap()
    }

    #[test]
    fn test_chart_url() {
        let sym = Symbol::parse("brk-b").unwrap();
        let url = provider().chart_url(&sym, "max", "div").unwrap();
        assert_eq!(url.path(), "/v8/finance/chart/BRK-B");
        assert!(url.query().unwrap().contains("range=max"));
        assert!(url.query().unwrap().contains("events=div"));
    }

    #[test]
    fn test_summary_url_lists_modules() {
        let sym = Symbol::parse("spy").unwrap();
        let url = provider().summary_url(&sym, &["calendarEvents", "topHoldings"]).unwrap();
        assert_eq!(url.path(), "/v10/finance/quoteSummary/SPY");
        assert_eq!(url.query(), Some("modules=calendarEvents%2CtopHoldings"));
    }
}
