//! Pure frame-level merge semantics for the unified table.
//!
//! Matching follows the null-safe composite-key predicate:
//! `target.ticker = source.ticker AND target.record_type =
//! source.record_type AND (target.period_end_date = source.period_end_date
//! OR both NULL)`. Matched target rows are dropped and replaced by their
//! source counterparts (update-all); unmatched source rows are appended
//! (insert-all). Schemas are superset-unioned with nulls.

use std::collections::HashSet;

use polars::functions::concat_df_diagonal;
use polars::prelude::*;
use sip_schemas::PipelineError;

use crate::KEY_COLUMNS;

// Sentinel standing in for a NULL period_end_date inside composite keys, so
// metadata rows (ticker, 'metadata', NULL) match each other.
const NULL_KEY: &str = "\u{0}";
const KEY_SEP: char = '\u{1}';

fn merge_err(context: &str, e: PolarsError) -> PipelineError {
    PipelineError::TableMerge(format!("{context}: {e}"))
}

fn key_column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a StringChunked, PipelineError> {
    df.column(name)
        .map_err(|e| merge_err("missing key column", e))?
        .str()
        .map_err(|e| merge_err("key column must be a string", e))
}

/// One composite key string per row of `df`.
pub fn composite_keys(df: &DataFrame) -> Result<Vec<String>, PipelineError> {
    let tickers = key_column(df, KEY_COLUMNS[0])?;
    let record_types = key_column(df, KEY_COLUMNS[1])?;
    let period_dates = key_column(df, KEY_COLUMNS[2])?;

    let mut keys = Vec::with_capacity(df.height());
    for ((ticker, record_type), period) in tickers
        .into_iter()
        .zip(record_types.into_iter())
        .zip(period_dates.into_iter())
    {
        let ticker = ticker.unwrap_or(NULL_KEY);
        let record_type = record_type.unwrap_or(NULL_KEY);
        let period = period.unwrap_or(NULL_KEY);
        keys.push(format!("{ticker}{KEY_SEP}{record_type}{KEY_SEP}{period}"));
    }
    Ok(keys)
}

/// Cast source columns that also exist in `target` to the target dtype, so
/// the diagonal concat never sees conflicting column types (e.g. a column
/// that arrived all-null as Utf8 while the table already holds Float64).
fn align_to_target(target: &DataFrame, mut source: DataFrame) -> Result<DataFrame, PipelineError> {
    let target_schema = target.schema();
    let source_names: Vec<String> = source
        .get_column_names()
        .iter()
        .map(|n| n.to_string())
        .collect();

    for name in source_names {
        let Some(target_dtype) = target_schema.get(name.as_str()) else {
            continue;
        };
        let source_dtype = source
            .column(name.as_str())
            .map_err(|e| merge_err("source column lookup", e))?
            .dtype()
            .clone();
        if &source_dtype == target_dtype {
            continue;
        }
        let cast = source
            .column(name.as_str())
            .map_err(|e| merge_err("source column lookup", e))?
            .cast(target_dtype)
            .map_err(|e| merge_err("source column cast", e))?;
        source
            .with_column(cast)
            .map_err(|e| merge_err("source column replace", e))?;
    }
    Ok(source)
}

/// Merge `source` into `target` with update-all / insert-all semantics.
pub fn merge_frames(target: &DataFrame, source: &DataFrame) -> Result<DataFrame, PipelineError> {
    let source_keys: HashSet<String> = composite_keys(source)?.into_iter().collect();
    let target_keys = composite_keys(target)?;

    let keep: BooleanChunked = target_keys
        .iter()
        .map(|k| !source_keys.contains(k))
        .collect();
    let kept = target
        .filter(&keep)
        .map_err(|e| merge_err("filter matched target rows", e))?;

    let aligned = align_to_target(&kept, source.clone())?;
    concat_df_diagonal(&[kept, aligned]).map_err(|e| merge_err("concat frames", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(rows: Vec<(&str, &str, Option<&str>, Option<f64>)>) -> DataFrame {
        let tickers: Vec<&str> = rows.iter().map(|r| r.0).collect();
        let record_types: Vec<&str> = rows.iter().map(|r| r.1).collect();
        let periods: Vec<Option<&str>> = rows.iter().map(|r| r.2).collect();
        let revenue: Vec<Option<f64>> = rows.iter().map(|r| r.3).collect();
        DataFrame::new(vec![
            Column::new("ticker".into(), tickers),
            Column::new("record_type".into(), record_types),
            Column::new("period_end_date".into(), periods),
            Column::new("revenue".into(), revenue),
        ])
        .unwrap()
    }

    #[test]
    fn unmatched_source_rows_are_inserted() {
        let target = frame(vec![("AAPL", "financials", Some("2024-03-31"), Some(1.0))]);
        let source = frame(vec![("AAPL", "financials", Some("2024-06-30"), Some(2.0))]);
        let merged = merge_frames(&target, &source).unwrap();
        assert_eq!(merged.height(), 2);
    }

    #[test]
    fn matched_rows_are_replaced_not_duplicated() {
        let target = frame(vec![
            ("AAPL", "financials", Some("2024-03-31"), Some(1.0)),
            ("AAPL", "financials", Some("2024-06-30"), Some(2.0)),
        ]);
        let source = frame(vec![("AAPL", "financials", Some("2024-06-30"), Some(99.0))]);
        let merged = merge_frames(&target, &source).unwrap();
        assert_eq!(merged.height(), 2);

        let keys = composite_keys(&merged).unwrap();
        let idx = keys
            .iter()
            .position(|k| k.contains("2024-06-30"))
            .unwrap();
        let revenue = merged.column("revenue").unwrap().f64().unwrap();
        assert_eq!(revenue.get(idx), Some(99.0));
    }

    #[test]
    fn null_period_end_dates_match_each_other() {
        let target = frame(vec![("AAPL", "metadata", None, None)]);
        let source = frame(vec![("AAPL", "metadata", None, None)]);
        let merged = merge_frames(&target, &source).unwrap();
        // The metadata row is replaced, not appended.
        assert_eq!(merged.height(), 1);
    }

    #[test]
    fn different_record_types_never_collide() {
        let target = frame(vec![("AAPL", "metadata", None, None)]);
        let source = frame(vec![("AAPL", "ttm", Some("2024-06-30"), Some(4.0))]);
        let merged = merge_frames(&target, &source).unwrap();
        assert_eq!(merged.height(), 2);
    }

    #[test]
    fn new_source_columns_union_with_nulls() {
        let target = frame(vec![("AAPL", "financials", Some("2024-03-31"), Some(1.0))]);
        let source = DataFrame::new(vec![
            Column::new("ticker".into(), vec!["MSFT"]),
            Column::new("record_type".into(), vec!["financials"]),
            Column::new("period_end_date".into(), vec![Some("2024-03-31")]),
            Column::new("eps".into(), vec![Some(3.5_f64)]),
        ])
        .unwrap();

        let merged = merge_frames(&target, &source).unwrap();
        assert_eq!(merged.height(), 2);
        assert!(merged.column("revenue").is_ok());
        assert!(merged.column("eps").is_ok());
        // The AAPL row has no eps; the MSFT row has no revenue.
        assert_eq!(merged.column("eps").unwrap().null_count(), 1);
        assert_eq!(merged.column("revenue").unwrap().null_count(), 1);
    }

    #[test]
    fn all_null_source_column_is_cast_to_target_dtype() {
        let target = frame(vec![("AAPL", "financials", Some("2024-03-31"), Some(1.0))]);
        // revenue arrives as an all-null Utf8 column (post null-normalization).
        let source = DataFrame::new(vec![
            Column::new("ticker".into(), vec!["AAPL"]),
            Column::new("record_type".into(), vec!["financials"]),
            Column::new("period_end_date".into(), vec![Some("2024-06-30")]),
            Column::new("revenue".into(), vec![None::<&str>]),
        ])
        .unwrap();

        let merged = merge_frames(&target, &source).unwrap();
        assert_eq!(merged.height(), 2);
        assert_eq!(
            merged.column("revenue").unwrap().dtype(),
            &DataType::Float64
        );
    }
}
