//! Query-parameter filter parsing for the list views.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sip_db::{RunFilter, StockFilter};
use sip_schemas::IngestionState;

use crate::pagination::PageParams;

/// Filters accepted by `GET /tickers`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StockListQuery {
    pub ticker: Option<String>,
    #[serde(rename = "ticker__icontains")]
    pub ticker_icontains: Option<String>,
    pub sector: Option<String>,
    #[serde(rename = "sector__icontains")]
    pub sector_icontains: Option<String>,
    pub exchange: Option<String>,
    pub country: Option<String>,
    pub cursor: Option<String>,
    pub page_size: Option<i64>,
}

impl StockListQuery {
    pub fn page_params(&self) -> PageParams {
        PageParams {
            cursor: self.cursor.clone(),
            page_size: self.page_size,
        }
    }

    pub fn to_filter(&self) -> StockFilter {
        StockFilter {
            ticker: self.ticker.clone(),
            ticker_contains: self.ticker_icontains.clone(),
            sector: self.sector.clone(),
            sector_contains: self.sector_icontains.clone(),
            exchange: self.exchange.clone(),
            country: self.country.clone(),
        }
    }
}

/// Filters accepted by the run list views.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunListQuery {
    pub ticker: Option<String>,
    #[serde(rename = "ticker__icontains")]
    pub ticker_icontains: Option<String>,
    pub state: Option<String>,
    pub requested_by: Option<String>,
    #[serde(rename = "requested_by__icontains")]
    pub requested_by_icontains: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub is_terminal: Option<bool>,
    pub is_in_progress: Option<bool>,
    pub cursor: Option<String>,
    pub page_size: Option<i64>,
}

/// Raised for `state` values outside the eight-value set (→ 400).
#[derive(Debug)]
pub struct InvalidStateFilter(pub String);

impl RunListQuery {
    pub fn page_params(&self) -> PageParams {
        PageParams {
            cursor: self.cursor.clone(),
            page_size: self.page_size,
        }
    }

    pub fn to_filter(&self) -> Result<RunFilter, InvalidStateFilter> {
        let state = match &self.state {
            Some(raw) => Some(
                IngestionState::parse(raw).map_err(|_| InvalidStateFilter(raw.clone()))?,
            ),
            None => None,
        };
        Ok(RunFilter {
            ticker: self.ticker.clone(),
            ticker_contains: self.ticker_icontains.clone(),
            state,
            requested_by: self.requested_by.clone(),
            requested_by_contains: self.requested_by_icontains.clone(),
            created_after: self.created_after,
            created_before: self.created_before,
            is_terminal: self.is_terminal,
            is_in_progress: self.is_in_progress,
        })
    }
}
