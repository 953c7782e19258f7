//! Opaque cursor pagination.
//!
//! Ordering is `-created_at` with the row id as tiebreak; the cursor is the
//! base64 of `<created_at rfc3339>|<id>` of the last row on the previous
//! page. Default page size 50, maximum 100.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sip_db::{Page, PageCursor};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    pub cursor: Option<String>,
    pub page_size: Option<i64>,
}

#[derive(Debug)]
pub struct CursorError;

pub fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{id}", created_at.to_rfc3339()))
}

pub fn decode_cursor(cursor: &str) -> Result<PageCursor, CursorError> {
    let raw = URL_SAFE_NO_PAD.decode(cursor).map_err(|_| CursorError)?;
    let raw = String::from_utf8(raw).map_err(|_| CursorError)?;
    let (ts, id) = raw.split_once('|').ok_or(CursorError)?;
    Ok(PageCursor {
        created_at: DateTime::parse_from_rfc3339(ts)
            .map_err(|_| CursorError)?
            .with_timezone(&Utc),
        id: Uuid::parse_str(id).map_err(|_| CursorError)?,
    })
}

impl PageParams {
    pub fn to_page(&self) -> Result<Page, CursorError> {
        let limit = self
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let before = match &self.cursor {
            Some(c) => Some(decode_cursor(c)?),
            None => None,
        };
        Ok(Page { limit, before })
    }
}

/// The `next` cursor for a page of rows, present only when the page is
/// full (a short page means the listing is exhausted).
pub fn next_cursor<T, F: Fn(&T) -> (DateTime<Utc>, Uuid)>(
    rows: &[T],
    limit: i64,
    key: F,
) -> Option<String> {
    if rows.len() < limit as usize {
        return None;
    }
    rows.last().map(|row| {
        let (created_at, id) = key(row);
        encode_cursor(created_at, id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let ts = Utc::now();
        let id = Uuid::new_v4();
        let decoded = decode_cursor(&encode_cursor(ts, id)).unwrap();
        assert_eq!(decoded.id, id);
        assert_eq!(decoded.created_at.timestamp_micros(), ts.timestamp_micros());
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert!(decode_cursor("not-base64!!").is_err());
        assert!(decode_cursor(&URL_SAFE_NO_PAD.encode("no-separator")).is_err());
    }

    #[test]
    fn page_size_is_clamped() {
        let page = PageParams {
            cursor: None,
            page_size: Some(1000),
        }
        .to_page()
        .unwrap();
        assert_eq!(page.limit, MAX_PAGE_SIZE);

        let page = PageParams::default().to_page().unwrap();
        assert_eq!(page.limit, DEFAULT_PAGE_SIZE);
    }
}
