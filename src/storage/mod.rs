use crate::config::OutputConfig;
use crate::models::{FxRate, Symbol, TickerRecord, TickerSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ── Writer ────────────────────────────────────────────────────────────────────

/// Writes fetched records, the summary file and the failure log.
pub struct OutputWriter {
    dir: PathBuf,
    summary_file: String,
    error_log: PathBuf,
}

impl OutputWriter {
    /// Creates the output directory if it is missing.
    pub fn open(config: &OutputConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)
            .with_context(|| format!("Cannot create output directory {:?}", config.dir))?;
        Ok(Self {
            dir: config.dir.clone(),
            summary_file: config.summary_file.clone(),
            error_log: config.error_log.clone(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, symbol: &Symbol) -> PathBuf {
        self.dir.join(format!("{}.json", symbol))
    }

    /// `<dir>/<SYMBOL>.json` holding `{SYMBOL: record, metadata: {lastUpdatedTimestamp}}`.
    /// The timestamp is when the fetch started.
    pub fn write_record(&self, record: &TickerRecord) -> Result<PathBuf> {
        let path = self.record_path(&record.ticker_code);
        let body = serde_json::to_value(record)
            .with_context(|| format!("Cannot serialize {}", record.ticker_code))?;
        let doc = document(record.ticker_code.as_str(), body, record.fetched_at.and_utc());
        write_json(&path, &doc)?;
        debug!("{}: wrote {:?}", record.ticker_code, path);
        Ok(path)
    }

    /// `<dir>/<FROM><TO>=X.json` holding `{fxRate: {from, to, conversionRate}, metadata}`.
    pub fn write_fx_rate(&self, rate: &FxRate) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}=X.json", rate.pair));
        let body = serde_json::to_value(rate)
            .with_context(|| format!("Cannot serialize {}", rate.pair))?;
        let doc = document("fxRate", body, rate.fetched_at.and_utc());
        write_json(&path, &doc)?;
        debug!("{}: wrote {:?}", rate.pair, path);
        Ok(path)
    }

    /// All summaries in one JSON array, ordered by symbol.
    pub fn write_summary<'a, I>(&self, summaries: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = &'a TickerSummary>,
    {
        let rows: Vec<&TickerSummary> = summaries.into_iter().collect();
        let path = self.dir.join(&self.summary_file);
        write_json(&path, &rows)?;
        info!("Wrote {} summaries to {:?}", rows.len(), path);
        Ok(path)
    }

    /// One `KEY: message` line per failed symbol or pair. Truncates any previous
    /// log; nothing is written when there are no failures.
    pub fn write_error_log<K: fmt::Display>(&self, failed: &BTreeMap<K, String>) -> Result<Option<PathBuf>> {
        if failed.is_empty() {
            if self.error_log.exists() {
                fs::remove_file(&self.error_log)
                    .with_context(|| format!("Cannot remove stale log {:?}", self.error_log))?;
            }
            return Ok(None);
        }

        let mut file = fs::File::create(&self.error_log)
            .with_context(|| format!("Cannot create {:?}", self.error_log))?;
        for (symbol, msg) in failed {
            writeln!(file, "{}: {}", symbol, msg)
                .with_context(|| format!("Cannot write {:?}", self.error_log))?;
        }
        info!("Logged {} failures to {:?}", failed.len(), self.error_log);
        Ok(Some(self.error_log.clone()))
    }
}

fn document(key: &str, body: Value, fetched_at: DateTime<Utc>) -> Value {
    let mut doc = serde_json::Map::new();
    doc.insert(key.to_string(), body);
    doc.insert(
        "metadata".into(),
        json!({ "lastUpdatedTimestamp": fetched_at.to_rfc3339_opts(SecondsFormat::Secs, true) }),
    );
    Value::Object(doc)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("Cannot serialize {:?}", path))?;
    fs::write(path, text).with_context(|| format!("Cannot write {:?}", path))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
