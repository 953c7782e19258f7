//! Reshape raw source JSON into the unified row set.
//!
//! The upstream payload is column-oriented:
//!
//! ```json
//! {
//!   "data": {
//!     "financials": {
//!       "quarterly": {"period_end_date": ["2024-03-31", ...], "revenue": [...], ...},
//!       "ttm": {"period_end_date": "TTM", "revenue": ..., ...}
//!     },
//!     "metadata": {"name": "...", "sector": "...", ...}
//!   }
//! }
//! ```
//!
//! Output is one row per quarterly period (`record_type='financials'`), at
//! most one metadata row (`period_end_date` null) and at most one TTM row
//! pinned to the latest quarterly date. Null-string normalization happens
//! during row construction, **before** any dtype decision, so the column
//! types stabilize; integer metrics land as Float64 and all-null columns as
//! Utf8 by construction; invariants of the write path, not a cleanup pass.

use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::*;
use serde_json::Value;
use sip_schemas::PipelineError;
use sip_table::KEY_COLUMNS;
use tracing::warn;

/// String values treated as missing, compared case-insensitively after trim.
const NULL_STRINGS: [&str; 5] = ["N/A", "NA", "NULL", "NONE", "-"];

/// Quarterly metric explicitly excluded from the unified table.
const EXCLUDED_METRICS: [&str; 1] = ["roic_5yr_avg"];

/// One normalized cell. Numbers are always carried as f64 so integer-typed
/// metrics can never produce an integer column.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Str(String),
    Num(f64),
    Bool(bool),
}

fn normalize_value(v: &Value) -> Cell {
    match v {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Bool(*b),
        Value::Number(n) => n.as_f64().map(Cell::Num).unwrap_or(Cell::Null),
        Value::String(s) => {
            let trimmed = s.trim();
            if NULL_STRINGS
                .iter()
                .any(|null| trimmed.eq_ignore_ascii_case(null))
            {
                Cell::Null
            } else {
                Cell::Str(s.clone())
            }
        }
        // Nested structures have no column representation.
        Value::Array(_) | Value::Object(_) => Cell::Null,
    }
}

type Record = BTreeMap<String, Cell>;

fn base_record(ticker: &str, record_type: &str, period_end_date: Option<&str>) -> Record {
    let mut rec = Record::new();
    rec.insert("ticker".to_string(), Cell::Str(ticker.to_string()));
    rec.insert("record_type".to_string(), Cell::Str(record_type.to_string()));
    rec.insert(
        "period_end_date".to_string(),
        period_end_date
            .map(|d| Cell::Str(d.to_string()))
            .unwrap_or(Cell::Null),
    );
    rec
}

fn quarterly_period_dates(data: &Value) -> Option<Vec<String>> {
    let periods = data
        .get("financials")?
        .get("quarterly")?
        .get("period_end_date")?
        .as_array()?;
    Some(
        periods
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}

/// Reshape one parsed payload into the unified frame for `ticker`.
pub fn reshape(payload: &Value, ticker: &str) -> Result<DataFrame, PipelineError> {
    let root = payload
        .as_object()
        .ok_or_else(|| PipelineError::InvalidDataFormat("data must be an object".to_string()))?;
    let data = root
        .get("data")
        .ok_or_else(|| PipelineError::InvalidDataFormat("missing 'data' key in JSON".to_string()))?;

    let mut records: Vec<Record> = Vec::new();

    // Financial time series: one row per quarterly period.
    if let Some(quarterly) = data
        .get("financials")
        .and_then(|f| f.get("quarterly"))
        .and_then(|q| q.as_object())
    {
        match quarterly_period_dates(data) {
            None => warn!(ticker, "no period_end_date found in quarterly data"),
            Some(periods) => {
                for (idx, period) in periods.iter().enumerate() {
                    let mut rec = base_record(ticker, "financials", Some(period.as_str()));
                    for (metric, values) in quarterly {
                        if metric == "period_end_date" || EXCLUDED_METRICS.contains(&metric.as_str())
                        {
                            continue;
                        }
                        // Metric arrays may be shorter than the period list.
                        let cell = values
                            .as_array()
                            .and_then(|arr| arr.get(idx))
                            .map(normalize_value)
                            .unwrap_or(Cell::Null);
                        rec.insert(metric.clone(), cell);
                    }
                    records.push(rec);
                }
            }
        }
    }

    // Metadata: a single row with no time dimension.
    if let Some(metadata) = data.get("metadata").and_then(|m| m.as_object()) {
        if !metadata.is_empty() {
            let mut rec = base_record(ticker, "metadata", None);
            for (field, value) in metadata {
                if field == "ticker" || field == "record_type" || field == "period_end_date" {
                    continue;
                }
                rec.insert(field.clone(), normalize_value(value));
            }
            records.push(rec);
        }
    }

    // TTM: pinned to the latest quarterly date; without quarterly periods
    // there is nothing meaningful to pin to, so the row is skipped.
    if let Some(ttm) = data
        .get("financials")
        .and_then(|f| f.get("ttm"))
        .and_then(|t| t.as_object())
    {
        if !ttm.is_empty() {
            let latest_period = quarterly_period_dates(data).and_then(|p| p.last().cloned());
            match latest_period {
                None => {
                    warn!(ticker, "no quarterly period_end_date found, cannot process TTM data")
                }
                Some(latest) => {
                    let mut rec = base_record(ticker, "ttm", Some(latest.as_str()));
                    for (metric, value) in ttm {
                        if metric == "period_end_date" {
                            // The upstream "TTM" placeholder was already
                            // replaced by the latest quarterly date.
                            continue;
                        }
                        rec.insert(metric.clone(), normalize_value(value));
                    }
                    records.push(rec);
                }
            }
        }
    }

    if records.is_empty() {
        return Err(PipelineError::InvalidDataFormat(
            "no valid financial, metadata, or TTM data found in JSON".to_string(),
        ));
    }

    build_frame(&records)
}

/// Assemble records into a superset-union frame with stabilized dtypes.
fn build_frame(records: &[Record]) -> Result<DataFrame, PipelineError> {
    let mut columns: Vec<String> = KEY_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut extra: BTreeSet<&str> = BTreeSet::new();
    for rec in records {
        for name in rec.keys() {
            if !KEY_COLUMNS.contains(&name.as_str()) {
                extra.insert(name);
            }
        }
    }
    columns.extend(extra.into_iter().map(|c| c.to_string()));

    let mut out: Vec<Column> = Vec::with_capacity(columns.len());
    for name in &columns {
        let cells: Vec<&Cell> = records
            .iter()
            .map(|rec| rec.get(name).unwrap_or(&Cell::Null))
            .collect();

        let is_key = KEY_COLUMNS.contains(&name.as_str());
        let has_str = cells.iter().any(|c| matches!(c, Cell::Str(_)));
        let has_num = cells.iter().any(|c| matches!(c, Cell::Num(_)));
        let has_bool = cells.iter().any(|c| matches!(c, Cell::Bool(_)));

        let col = if is_key || has_str || (!has_num && !has_bool) {
            // Key columns stay Utf8; all-null columns are forced to Utf8 so
            // later merges never see a Null-typed column.
            let vals: Vec<Option<String>> = cells
                .iter()
                .map(|c| match c {
                    Cell::Str(s) => Some(s.clone()),
                    Cell::Num(n) => Some(n.to_string()),
                    Cell::Bool(b) => Some(b.to_string()),
                    Cell::Null => None,
                })
                .collect();
            Column::new(name.as_str().into(), vals)
        } else if has_num {
            let vals: Vec<Option<f64>> = cells
                .iter()
                .map(|c| match c {
                    Cell::Num(n) => Some(*n),
                    _ => None,
                })
                .collect();
            Column::new(name.as_str().into(), vals)
        } else {
            let vals: Vec<Option<bool>> = cells
                .iter()
                .map(|c| match c {
                    Cell::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect();
            Column::new(name.as_str().into(), vals)
        };
        out.push(col);
    }

    DataFrame::new(out)
        .map_err(|e| PipelineError::InvalidDataFormat(format!("failed to build frame: {e}")))
}
