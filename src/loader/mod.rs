//! Input loaders: symbol lists (a JSON array of strings or a one-column CSV)
//! and FX pair lists.

use crate::models::{FxPair, Symbol, SymbolError};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read symbol list {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path:?}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid CSV in {path:?}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path:?} must contain a JSON array of strings")]
    NotAnArray { path: PathBuf },

    #[error("entry {index} in {path:?} is not a string: {value}")]
    NotAString { path: PathBuf, index: usize, value: Value },

    #[error("entry {index} in {path:?}")]
    Symbol {
        path: PathBuf,
        index: usize,
        #[source]
        source: SymbolError,
    },

    #[error("pair {index} in {path:?} is missing '{field}'")]
    MissingField { path: PathBuf, index: usize, field: &'static str },

    #[error("pair {index} in {path:?} has invalid currency {code:?}")]
    InvalidCurrency { path: PathBuf, index: usize, code: String },
}

/// Read, normalize and de-duplicate a symbol list. First occurrence wins.
pub fn load_symbols(path: &Path) -> Result<Vec<Symbol>, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let raw = if is_json(path, &text) {
        parse_json(path, &text)?
    } else {
        parse_csv(path, &text)?
    };

    let mut seen = HashSet::new();
    let mut symbols = Vec::with_capacity(raw.len());
    for (index, entry) in raw.into_iter().enumerate() {
        if entry.trim().is_empty() {
            continue;
        }
        let symbol = Symbol::parse(&entry).map_err(|source| LoadError::Symbol {
            path: path.to_path_buf(),
            index,
            source,
        })?;
        if seen.insert(symbol.clone()) {
            symbols.push(symbol);
        } else {
            debug!("Duplicate symbol {} dropped", symbol);
        }
    }

    info!("Loaded {} symbols from {:?}", symbols.len(), path);
    Ok(symbols)
}

/// Read an FX pair list: `[{"from": .., "to": ..}, ..]` or `{"chunk": [..]}`.
/// Currency case is kept (`GBp` is not `GBP`). First occurrence of a pair wins.
pub fn load_fx_pairs(path: &Path) -> Result<Vec<FxPair>, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("chunk") {
            Some(Value::Array(items)) => items,
            _ => return Err(LoadError::NotAnArray { path: path.to_path_buf() }),
        },
        _ => return Err(LoadError::NotAnArray { path: path.to_path_buf() }),
    };

    let mut seen = HashSet::new();
    let mut pairs = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let currency = |field: &'static str| -> Result<String, LoadError> {
            let code = item.get(field).and_then(Value::as_str).unwrap_or_default().trim();
            if code.is_empty() {
                return Err(LoadError::MissingField { path: path.to_path_buf(), index, field });
            }
            if !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(LoadError::InvalidCurrency {
                    path: path.to_path_buf(),
                    index,
                    code: code.to_string(),
                });
            }
            Ok(code.to_string())
        };
        let pair = FxPair { from: currency("from")?, to: currency("to")? };
        if seen.insert(pair.clone()) {
            pairs.push(pair);
        } else {
            debug!("Duplicate pair {} dropped", pair);
        }
    }

    info!("Loaded {} FX pairs from {:?}", pairs.len(), path);
    Ok(pairs)
}

fn is_json(path: &Path, text: &str) -> bool {
    path.extension().map(|e| e.eq_ignore_ascii_case("json")).unwrap_or(false)
        || text.trim_start().starts_with('[')
}

fn parse_json(path: &Path, text: &str) -> Result<Vec<String>, LoadError> {
    let value: Value = serde_json::from_str(text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let Value::Array(items) = value else {
        return Err(LoadError::NotAnArray { path: path.to_path_buf() });
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::String(s) => Ok(s),
            value => Err(LoadError::NotAString {
                path: path.to_path_buf(),
                index,
                value,
            }),
        })
        .collect()
}

/// First column of every row; a leading `symbol`/`ticker` header is skipped.
fn parse_csv(path: &Path, text: &str) -> Result<Vec<String>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut out = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result.map_err(|source| LoadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let first = record.get(0).unwrap_or_default();
        if i == 0 && matches!(first.to_lowercase().as_str(), "symbol" | "ticker") {
            continue;
        }
        out.push(first.to_string());
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
