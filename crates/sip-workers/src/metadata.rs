//! Metadata projector: unified table → Stock row writeback.
//!
//! Reads the `record_type='metadata'` rows for one ticker and copies the
//! intersection with known Stock columns back onto the relational row,
//! under a row lock. Lock contention surfaces as the retryable
//! `DatabaseLockTimeout`, so the lane retries with backoff.

use std::sync::Arc;

use polars::prelude::*;
use sip_db::RunStore;
use sip_schemas::{normalize_ticker, PipelineError, StockMetadataPatch};
use sip_table::TableEngine;
use tracing::{info, warn};

/// Result object returned by a metadata projection execution.
#[derive(Debug, Clone)]
pub struct MetadataResult {
    pub ticker: String,
    pub updated: bool,
    pub skipped: bool,
    pub fields_updated: Vec<String>,
}

pub struct MetadataProjector {
    store: Arc<dyn RunStore>,
    table: Arc<dyn TableEngine>,
}

impl MetadataProjector {
    pub fn new(store: Arc<dyn RunStore>, table: Arc<dyn TableEngine>) -> Self {
        MetadataProjector { store, table }
    }

    pub async fn run(&self, ticker: &str) -> Result<MetadataResult, PipelineError> {
        let ticker = normalize_ticker(ticker);
        info!(ticker, "starting metadata projection");

        let stock = self
            .store
            .get_stock_by_ticker(&ticker)
            .await?
            .ok_or_else(|| PipelineError::StockNotFound(ticker.clone()))?;

        let rows = match self.table.read_metadata(&ticker).await {
            Ok(Some(df)) if df.height() > 0 => df,
            Ok(_) => {
                info!(ticker, "no metadata rows in unified table, skipping");
                return Ok(MetadataResult {
                    ticker,
                    updated: false,
                    skipped: true,
                    fields_updated: Vec::new(),
                });
            }
            Err(e) => return Err(e),
        };

        if rows.height() > 1 {
            warn!(
                ticker,
                count = rows.height(),
                "multiple metadata rows found, using first"
            );
        }

        let patch = patch_from_row(&rows)?;
        if patch.is_empty() {
            info!(ticker, "metadata row carries no known stock fields, skipping");
            return Ok(MetadataResult {
                ticker,
                updated: false,
                skipped: true,
                fields_updated: Vec::new(),
            });
        }

        let fields_updated = self.store.apply_stock_metadata(stock.id, &patch).await?;
        info!(ticker, ?fields_updated, "updated stock metadata");
        Ok(MetadataResult {
            ticker,
            updated: !fields_updated.is_empty(),
            skipped: false,
            fields_updated,
        })
    }
}

/// First-row string value of `column`, if present and non-null.
fn string_field(df: &DataFrame, column: &str) -> Option<String> {
    let col = df.column(column).ok()?;
    match col.get(0).ok()? {
        AnyValue::String(s) => Some(s.to_string()),
        AnyValue::StringOwned(s) => Some(s.to_string()),
        _ => None,
    }
}

/// Intersection of the metadata row with the known Stock columns; unknown
/// columns in the table are ignored.
fn patch_from_row(df: &DataFrame) -> Result<StockMetadataPatch, PipelineError> {
    Ok(StockMetadataPatch {
        name: string_field(df, "name"),
        sector: string_field(df, "sector"),
        subindustry: string_field(df, "subindustry"),
        industry: string_field(df, "industry"),
        morningstar_sector: string_field(df, "morningstar_sector"),
        morningstar_industry: string_field(df, "morningstar_industry"),
        country: string_field(df, "country"),
        description: string_field(df, "description"),
        exchange: string_field(df, "exchange"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_extracts_known_columns_and_ignores_unknown() {
        let df = DataFrame::new(vec![
            Column::new("ticker".into(), vec!["AAPL"]),
            Column::new("record_type".into(), vec!["metadata"]),
            Column::new("name".into(), vec![Some("Apple Inc.")]),
            Column::new("sector".into(), vec![Some("Technology")]),
            Column::new("exchange".into(), vec![Some("nasdaq")]),
            Column::new("share_count".into(), vec![Some(15.0_f64)]),
        ])
        .unwrap();

        let patch = patch_from_row(&df).unwrap();
        assert_eq!(patch.name.as_deref(), Some("Apple Inc."));
        assert_eq!(patch.sector.as_deref(), Some("Technology"));
        assert_eq!(patch.exchange.as_deref(), Some("nasdaq"));
        assert!(patch.country.is_none());
    }

    #[test]
    fn null_and_numeric_cells_are_not_projected() {
        let df = DataFrame::new(vec![
            Column::new("name".into(), vec![None::<&str>]),
            Column::new("sector".into(), vec![Some(1.5_f64)]),
        ])
        .unwrap();

        let patch = patch_from_row(&df).unwrap();
        assert!(patch.name.is_none());
        assert!(patch.sector.is_none());
        assert!(patch.is_empty());
    }
}
