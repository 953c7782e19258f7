//! PostgreSQL implementation of [`RunStore`].
//!
//! Conventions:
//! - every mutation runs in an explicit transaction;
//! - run mutations lock the row with `SELECT … FOR UPDATE`;
//! - the at-most-one-active-run invariant is enforced by the database
//!   (partial unique index `unique_active_run_per_stock`), not by
//!   application code; the conflict is mapped to `DuplicateActiveRun`;
//! - bulk counters use `SET c = c + $n` arithmetic;
//! - committed Stock/Exchange writes publish an [`EntityChanged`] event.

use async_trait::async_trait;
use sip_schemas::{
    state::{validate_failure_fields, validate_transition},
    BulkQueueRun, EntityChanged, IngestionRun, IngestionState, PipelineError, Stock,
    StockMetadataPatch,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{
    BulkCounter, Page, RunFilter, RunStore, StateUpdate, StockFilter,
};

#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
    events: Option<broadcast::Sender<EntityChanged>>,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        PgRunStore { pool, events: None }
    }

    /// Attach the entity-change bus; committed Stock/Exchange mutations are
    /// published on it for the cache-invalidation fabric.
    pub fn with_events(pool: PgPool, events: broadcast::Sender<EntityChanged>) -> Self {
        PgRunStore {
            pool,
            events: Some(events),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn publish(&self, event: EntityChanged) {
        if let Some(bus) = &self.events {
            // No subscribers is fine (e.g. caching disabled).
            let _ = bus.send(event);
        }
    }
}

/// Detect a Postgres unique constraint violation by name.
fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}

/// Map a sqlx error into the pipeline taxonomy. Lock-acquisition failures
/// (`55P03`, raised by `FOR UPDATE NOWAIT`) become the retryable
/// `DatabaseLockTimeout`; everything else is a plain database error.
fn db_err(context: &str, e: sqlx::Error) -> PipelineError {
    if let sqlx::Error::Database(ref d) = e {
        if d.code().as_deref() == Some("55P03") {
            return PipelineError::DatabaseLockTimeout(format!("{context}: {e}"));
        }
    }
    PipelineError::Database(format!("{context}: {e}"))
}

fn decode<T>(context: &str, r: Result<T, sqlx::Error>) -> Result<T, PipelineError> {
    r.map_err(|e| PipelineError::Database(format!("{context}: row decode failed: {e}")))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const STOCK_COLUMNS: &str = r#"
    s.id, s.ticker, s.name, s.sector, s.subindustry, s.industry,
    s.morningstar_sector, s.morningstar_industry, s.country, s.description,
    s.exchange_id, e.name as exchange_name, s.created_at, s.updated_at
"#;

fn stock_from_row(row: &PgRow) -> Result<Stock, PipelineError> {
    Ok(Stock {
        id: decode("stock", row.try_get("id"))?,
        ticker: decode("stock", row.try_get("ticker"))?,
        name: decode("stock", row.try_get("name"))?,
        sector: decode("stock", row.try_get("sector"))?,
        subindustry: decode("stock", row.try_get("subindustry"))?,
        industry: decode("stock", row.try_get("industry"))?,
        morningstar_sector: decode("stock", row.try_get("morningstar_sector"))?,
        morningstar_industry: decode("stock", row.try_get("morningstar_industry"))?,
        country: decode("stock", row.try_get("country"))?,
        description: decode("stock", row.try_get("description"))?,
        exchange_id: decode("stock", row.try_get("exchange_id"))?,
        exchange: decode("stock", row.try_get("exchange_name"))?,
        created_at: decode("stock", row.try_get("created_at"))?,
        updated_at: decode("stock", row.try_get("updated_at"))?,
    })
}

const RUN_COLUMNS: &str = r#"
    r.id, r.stock_id, s.ticker, r.bulk_queue_run_id, r.requested_by, r.request_id,
    r.state, r.created_at, r.updated_at,
    r.queued_for_fetch_at, r.fetching_started_at, r.fetching_finished_at,
    r.queued_for_transform_at, r.transform_started_at, r.transform_finished_at,
    r.done_at, r.failed_at,
    r.error_code, r.error_message, r.raw_data_uri, r.processed_data_uri
"#;

fn run_from_row(row: &PgRow) -> Result<IngestionRun, PipelineError> {
    let state: String = decode("run", row.try_get("state"))?;
    Ok(IngestionRun {
        id: decode("run", row.try_get("id"))?,
        stock_id: decode("run", row.try_get("stock_id"))?,
        ticker: decode("run", row.try_get("ticker"))?,
        bulk_queue_run_id: decode("run", row.try_get("bulk_queue_run_id"))?,
        requested_by: decode("run", row.try_get("requested_by"))?,
        request_id: decode("run", row.try_get("request_id"))?,
        state: IngestionState::parse(&state)?,
        created_at: decode("run", row.try_get("created_at"))?,
        updated_at: decode("run", row.try_get("updated_at"))?,
        queued_for_fetch_at: decode("run", row.try_get("queued_for_fetch_at"))?,
        fetching_started_at: decode("run", row.try_get("fetching_started_at"))?,
        fetching_finished_at: decode("run", row.try_get("fetching_finished_at"))?,
        queued_for_transform_at: decode("run", row.try_get("queued_for_transform_at"))?,
        transform_started_at: decode("run", row.try_get("transform_started_at"))?,
        transform_finished_at: decode("run", row.try_get("transform_finished_at"))?,
        done_at: decode("run", row.try_get("done_at"))?,
        failed_at: decode("run", row.try_get("failed_at"))?,
        error_code: decode("run", row.try_get("error_code"))?,
        error_message: decode("run", row.try_get("error_message"))?,
        raw_data_uri: decode("run", row.try_get("raw_data_uri"))?,
        processed_data_uri: decode("run", row.try_get("processed_data_uri"))?,
    })
}

fn bulk_from_row(row: &PgRow) -> Result<BulkQueueRun, PipelineError> {
    Ok(BulkQueueRun {
        id: decode("bulk", row.try_get("id"))?,
        requested_by: decode("bulk", row.try_get("requested_by"))?,
        total_stocks: decode("bulk", row.try_get("total_stocks"))?,
        queued_count: decode("bulk", row.try_get("queued_count"))?,
        skipped_count: decode("bulk", row.try_get("skipped_count"))?,
        error_count: decode("bulk", row.try_get("error_count"))?,
        created_at: decode("bulk", row.try_get("created_at"))?,
        started_at: decode("bulk", row.try_get("started_at"))?,
        completed_at: decode("bulk", row.try_get("completed_at"))?,
    })
}

// ---------------------------------------------------------------------------
// Internal queries
// ---------------------------------------------------------------------------

impl PgRunStore {
    async fn fetch_run_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        for_update: bool,
    ) -> Result<IngestionRun, PipelineError> {
        let lock = if for_update { "for update of r" } else { "" };
        let sql = format!(
            "select {RUN_COLUMNS} from ingestion_runs r join stocks s on s.id = r.stock_id \
             where r.id = $1 {lock}"
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| db_err("fetch run", e))?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(PipelineError::RunNotFound(run_id)),
        }
    }

    /// Get-or-create a stock row by normalized ticker. Returns the row plus
    /// whether it was created.
    ///
    /// `on conflict do nothing` plus a follow-up select, never `do update`:
    /// an update arm would take a row lock on the existing stock and hold it
    /// until commit, serializing concurrent queue calls for the same ticker.
    /// Leaving the row untouched lets both racers pass the fast-path check,
    /// so the partial unique index on active runs picks the loser.
    async fn get_or_create_stock_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        ticker: &str,
    ) -> Result<(Stock, bool), PipelineError> {
        let insert_sql = format!(
            "with inserted as (
                 insert into stocks (id, ticker)
                 values ($1, $2)
                 on conflict (ticker) do nothing
                 returning *
             )
             select {STOCK_COLUMNS}
             from inserted s left join exchanges e on e.id = s.exchange_id"
        );
        let row = sqlx::query(&insert_sql)
            .bind(Uuid::new_v4())
            .bind(ticker)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| db_err("insert stock", e))?;
        if let Some(row) = row {
            return Ok((stock_from_row(&row)?, true));
        }

        // Conflict path: the ticker already exists; read it without locking.
        let select_sql = format!(
            "select {STOCK_COLUMNS} from stocks s \
             left join exchanges e on e.id = s.exchange_id where s.ticker = $1"
        );
        let row = sqlx::query(&select_sql)
            .bind(ticker)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| db_err("select stock", e))?;
        Ok((stock_from_row(&row)?, false))
    }
}

// ---------------------------------------------------------------------------
// RunStore implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl RunStore for PgRunStore {
    async fn get_or_create_stock(&self, ticker: &str) -> Result<Stock, PipelineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin", e))?;
        let (stock, created) = Self::get_or_create_stock_in_tx(&mut tx, ticker).await?;
        tx.commit().await.map_err(|e| db_err("commit", e))?;
        if created {
            self.publish(EntityChanged::Stock);
        }
        Ok(stock)
    }

    async fn get_stock_by_ticker(&self, ticker: &str) -> Result<Option<Stock>, PipelineError> {
        let sql = format!(
            "select {STOCK_COLUMNS} from stocks s \
             left join exchanges e on e.id = s.exchange_id where s.ticker = $1"
        );
        let row = sqlx::query(&sql)
            .bind(ticker)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get stock by ticker", e))?;
        row.map(|r| stock_from_row(&r)).transpose()
    }

    async fn apply_stock_metadata(
        &self,
        stock_id: Uuid,
        patch: &StockMetadataPatch,
    ) -> Result<Vec<String>, PipelineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin", e))?;

        // NOWAIT so a held lock surfaces as 55P03 -> retryable, instead of
        // stalling the metadata lane behind a long-lived writer.
        let locked = sqlx::query("select id from stocks where id = $1 for update nowait")
            .bind(stock_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("lock stock row", e))?;
        if locked.is_none() {
            return Err(PipelineError::StockNotFound(stock_id.to_string()));
        }

        let mut fields_updated = Vec::new();
        let mut exchange_touched = false;

        if let Some(exchange_name) = patch.exchange.as_deref().filter(|v| !v.is_empty()) {
            let normalized = sip_schemas::normalize_ticker(exchange_name);
            let row = sqlx::query(
                "insert into exchanges (id, name) values ($1, $2)
                 on conflict (name) do update set updated_at = now()
                 returning id",
            )
            .bind(Uuid::new_v4())
            .bind(&normalized)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_err("upsert exchange", e))?;
            let exchange_id: Uuid = decode("exchange", row.try_get("id"))?;

            sqlx::query("update stocks set exchange_id = $1 where id = $2")
                .bind(exchange_id)
                .bind(stock_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("link exchange", e))?;
            fields_updated.push("exchange".to_string());
            exchange_touched = true;
        }

        let scalar_fields: [(&str, &Option<String>); 8] = [
            ("name", &patch.name),
            ("sector", &patch.sector),
            ("subindustry", &patch.subindustry),
            ("industry", &patch.industry),
            ("morningstar_sector", &patch.morningstar_sector),
            ("morningstar_industry", &patch.morningstar_industry),
            ("country", &patch.country),
            ("description", &patch.description),
        ];
        for (column, value) in scalar_fields {
            if let Some(v) = value {
                let sql = format!("update stocks set {column} = $1 where id = $2");
                sqlx::query(&sql)
                    .bind(v)
                    .bind(stock_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_err("update stock metadata", e))?;
                fields_updated.push(column.to_string());
            }
        }

        if !fields_updated.is_empty() {
            sqlx::query("update stocks set updated_at = now() where id = $1")
                .bind(stock_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("touch stock", e))?;
        }

        tx.commit().await.map_err(|e| db_err("commit", e))?;

        if exchange_touched {
            self.publish(EntityChanged::Exchange);
        }
        if !fields_updated.is_empty() {
            self.publish(EntityChanged::Stock);
        }
        Ok(fields_updated)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<IngestionRun, PipelineError> {
        let sql = format!(
            "select {RUN_COLUMNS} from ingestion_runs r \
             join stocks s on s.id = r.stock_id where r.id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get run", e))?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(PipelineError::RunNotFound(run_id)),
        }
    }

    async fn latest_run_for_stock(
        &self,
        stock_id: Uuid,
    ) -> Result<Option<IngestionRun>, PipelineError> {
        let sql = format!(
            "select {RUN_COLUMNS} from ingestion_runs r \
             join stocks s on s.id = r.stock_id \
             where r.stock_id = $1 \
             order by r.created_at desc, r.id desc limit 1"
        );
        let row = sqlx::query(&sql)
            .bind(stock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("latest run for stock", e))?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    async fn active_runs(&self) -> Result<Vec<IngestionRun>, PipelineError> {
        let sql = format!(
            "select {RUN_COLUMNS} from ingestion_runs r \
             join stocks s on s.id = r.stock_id \
             where r.state not in ('DONE', 'FAILED') \
             order by r.created_at desc, r.id desc"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("active runs", e))?;
        rows.iter().map(run_from_row).collect()
    }

    async fn latest_done_run(
        &self,
        stock_id: Uuid,
    ) -> Result<Option<IngestionRun>, PipelineError> {
        let sql = format!(
            "select {RUN_COLUMNS} from ingestion_runs r \
             join stocks s on s.id = r.stock_id \
             where r.stock_id = $1 and r.state = 'DONE' \
             order by r.created_at desc, r.id desc limit 1"
        );
        let row = sqlx::query(&sql)
            .bind(stock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("latest done run", e))?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    async fn queue_for_fetch(
        &self,
        ticker: &str,
        requested_by: Option<&str>,
        request_id: &str,
    ) -> Result<(IngestionRun, bool), PipelineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin", e))?;

        let (stock, stock_created) = Self::get_or_create_stock_in_tx(&mut tx, ticker).await?;

        let latest_sql = format!(
            "select {RUN_COLUMNS} from ingestion_runs r \
             join stocks s on s.id = r.stock_id \
             where r.stock_id = $1 \
             order by r.created_at desc, r.id desc limit 1"
        );
        let latest = sqlx::query(&latest_sql)
            .bind(stock.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("latest run", e))?
            .map(|r| run_from_row(&r))
            .transpose()?;

        if let Some(run) = latest {
            if run.is_in_progress() {
                tx.commit().await.map_err(|e| db_err("commit", e))?;
                // The idempotent fast-path touched nothing, so there is
                // nothing to invalidate.
                info!(ticker, run_id = %run.id, state = %run.state, "active run exists, returning it");
                return Ok((run, false));
            }
        }

        let insert_sql = format!(
            "with inserted as (
                 insert into ingestion_runs
                     (id, stock_id, requested_by, request_id, state, queued_for_fetch_at)
                 values ($1, $2, $3, $4, 'QUEUED_FOR_FETCH', now())
                 returning *
             )
             select {RUN_COLUMNS}
             from inserted r join stocks s on s.id = r.stock_id"
        );
        let res = sqlx::query(&insert_sql)
            .bind(Uuid::new_v4())
            .bind(stock.id)
            .bind(requested_by)
            .bind(request_id)
            .fetch_one(&mut *tx)
            .await;

        let row = match res {
            Ok(row) => row,
            Err(e) => {
                if is_unique_constraint_violation(&e, "unique_active_run_per_stock") {
                    return Err(PipelineError::DuplicateActiveRun(ticker.to_string()));
                }
                return Err(db_err("insert run", e));
            }
        };
        let run = run_from_row(&row)?;

        tx.commit().await.map_err(|e| db_err("commit", e))?;
        if stock_created {
            self.publish(EntityChanged::Stock);
        }
        info!(ticker, run_id = %run.id, request_id, "created new ingestion run");
        Ok((run, true))
    }

    async fn update_run_state(
        &self,
        run_id: Uuid,
        new_state: IngestionState,
        update: StateUpdate,
    ) -> Result<IngestionRun, PipelineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin", e))?;

        let run = Self::fetch_run_in_tx(&mut tx, run_id, true).await?;

        if let Err(e) = validate_transition(run.state, new_state) {
            warn!(run_id = %run_id, from = %run.state, to = %new_state, "invalid state transition");
            return Err(e);
        }
        validate_failure_fields(
            new_state,
            update.error_code.as_deref(),
            update.error_message.as_deref(),
        )?;

        // The phase-timestamp column name comes from the static transition
        // table, never from caller input.
        let ts_col = new_state.timestamp_column();
        let sql = format!(
            "update ingestion_runs set
                 state = $1,
                 updated_at = now(),
                 {ts_col} = coalesce({ts_col}, now()),
                 error_code = coalesce($2, error_code),
                 error_message = coalesce($3, error_message),
                 raw_data_uri = coalesce($4, raw_data_uri),
                 processed_data_uri = coalesce($5, processed_data_uri)
             where id = $6"
        );
        sqlx::query(&sql)
            .bind(new_state.as_str())
            .bind(update.error_code.as_deref())
            .bind(update.error_message.as_deref())
            .bind(update.raw_data_uri.as_deref())
            .bind(update.processed_data_uri.as_deref())
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("update run state", e))?;

        let updated = Self::fetch_run_in_tx(&mut tx, run_id, false).await?;
        tx.commit().await.map_err(|e| db_err("commit", e))?;

        info!(run_id = %run_id, from = %run.state, to = %new_state, "updated run state");
        Ok(updated)
    }

    async fn create_bulk_run(
        &self,
        requested_by: Option<&str>,
    ) -> Result<BulkQueueRun, PipelineError> {
        let row = sqlx::query(
            "insert into bulk_queue_runs (id, requested_by) values ($1, $2) returning *",
        )
        .bind(Uuid::new_v4())
        .bind(requested_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("create bulk run", e))?;
        bulk_from_row(&row)
    }

    async fn get_bulk_run(&self, id: Uuid) -> Result<BulkQueueRun, PipelineError> {
        let row = sqlx::query("select * from bulk_queue_runs where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get bulk run", e))?;
        match row {
            Some(row) => bulk_from_row(&row),
            None => Err(PipelineError::BulkRunNotFound(id)),
        }
    }

    async fn bulk_mark_started(&self, id: Uuid) -> Result<(), PipelineError> {
        sqlx::query("update bulk_queue_runs set started_at = now() where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("bulk mark started", e))?;
        Ok(())
    }

    async fn bulk_set_total(&self, id: Uuid, total: i64) -> Result<(), PipelineError> {
        sqlx::query("update bulk_queue_runs set total_stocks = $1 where id = $2")
            .bind(total)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("bulk set total", e))?;
        Ok(())
    }

    async fn bulk_adjust_counter(
        &self,
        id: Uuid,
        counter: BulkCounter,
        delta: i64,
    ) -> Result<(), PipelineError> {
        let col = counter.column();
        let sql = format!("update bulk_queue_runs set {col} = {col} + $1 where id = $2");
        sqlx::query(&sql)
            .bind(delta)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("bulk adjust counter", e))?;
        Ok(())
    }

    async fn bulk_mark_completed(&self, id: Uuid) -> Result<(), PipelineError> {
        sqlx::query("update bulk_queue_runs set completed_at = now() where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("bulk mark completed", e))?;
        Ok(())
    }

    async fn link_run_to_bulk(&self, run_id: Uuid, bulk_id: Uuid) -> Result<(), PipelineError> {
        sqlx::query(
            "update ingestion_runs set bulk_queue_run_id = $1, updated_at = now()
             where id = $2 and (bulk_queue_run_id is distinct from $1)",
        )
        .bind(bulk_id)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("link run to bulk", e))?;
        Ok(())
    }

    async fn bulk_state_counts(
        &self,
        bulk_id: Uuid,
    ) -> Result<Vec<(IngestionState, i64)>, PipelineError> {
        let rows = sqlx::query(
            "select state, count(*)::bigint as n from ingestion_runs
             where bulk_queue_run_id = $1 group by state order by state",
        )
        .bind(bulk_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("bulk state counts", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = decode("bulk counts", row.try_get("state"))?;
            let n: i64 = decode("bulk counts", row.try_get("n"))?;
            out.push((IngestionState::parse(&state)?, n));
        }
        Ok(out)
    }

    async fn list_tickers(&self, exchange: Option<&str>) -> Result<Vec<String>, PipelineError> {
        let rows = match exchange {
            Some(name) => sqlx::query(
                "select s.ticker from stocks s
                 join exchanges e on e.id = s.exchange_id
                 where e.name = $1 order by s.ticker asc",
            )
            .bind(name)
            .fetch_all(&self.pool)
            .await,
            None => {
                sqlx::query("select ticker from stocks order by ticker asc")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| db_err("list tickers", e))?;

        rows.iter()
            .map(|r| decode("ticker", r.try_get("ticker")))
            .collect()
    }

    async fn list_stocks(
        &self,
        filter: &StockFilter,
        page: &Page,
    ) -> Result<Vec<Stock>, PipelineError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "select {STOCK_COLUMNS} from stocks s \
             left join exchanges e on e.id = s.exchange_id where true"
        ));
        if let Some(v) = &filter.ticker {
            qb.push(" and s.ticker ilike ").push_bind(v.clone());
        }
        if let Some(v) = &filter.ticker_contains {
            qb.push(" and s.ticker ilike ")
                .push_bind(format!("%{v}%"));
        }
        if let Some(v) = &filter.sector {
            qb.push(" and s.sector ilike ").push_bind(v.clone());
        }
        if let Some(v) = &filter.sector_contains {
            qb.push(" and s.sector ilike ")
                .push_bind(format!("%{v}%"));
        }
        if let Some(v) = &filter.exchange {
            qb.push(" and e.name ilike ").push_bind(v.clone());
        }
        if let Some(v) = &filter.country {
            qb.push(" and s.country ilike ").push_bind(v.clone());
        }
        if let Some(c) = &page.before {
            qb.push(" and (s.created_at, s.id) < (")
                .push_bind(c.created_at)
                .push(", ")
                .push_bind(c.id)
                .push(")");
        }
        qb.push(" order by s.created_at desc, s.id desc limit ")
            .push_bind(page.limit);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list stocks", e))?;
        rows.iter().map(stock_from_row).collect()
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: &Page,
    ) -> Result<Vec<IngestionRun>, PipelineError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "select {RUN_COLUMNS} from ingestion_runs r \
             join stocks s on s.id = r.stock_id where true"
        ));
        if let Some(v) = &filter.ticker {
            qb.push(" and s.ticker ilike ").push_bind(v.clone());
        }
        if let Some(v) = &filter.ticker_contains {
            qb.push(" and s.ticker ilike ")
                .push_bind(format!("%{v}%"));
        }
        if let Some(state) = filter.state {
            qb.push(" and r.state = ").push_bind(state.as_str());
        }
        if let Some(v) = &filter.requested_by {
            qb.push(" and r.requested_by ilike ").push_bind(v.clone());
        }
        if let Some(v) = &filter.requested_by_contains {
            qb.push(" and r.requested_by ilike ")
                .push_bind(format!("%{v}%"));
        }
        if let Some(v) = filter.created_after {
            qb.push(" and r.created_at >= ").push_bind(v);
        }
        if let Some(v) = filter.created_before {
            qb.push(" and r.created_at <= ").push_bind(v);
        }
        if let Some(terminal) = filter.is_terminal {
            if terminal {
                qb.push(" and r.state in ('DONE', 'FAILED')");
            } else {
                qb.push(" and r.state not in ('DONE', 'FAILED')");
            }
        }
        if let Some(in_progress) = filter.is_in_progress {
            if in_progress {
                qb.push(" and r.state not in ('DONE', 'FAILED')");
            } else {
                qb.push(" and r.state in ('DONE', 'FAILED')");
            }
        }
        if let Some(c) = &page.before {
            qb.push(" and (r.created_at, r.id) < (")
                .push_bind(c.created_at)
                .push(", ")
                .push_bind(c.id)
                .push(")");
        }
        qb.push(" order by r.created_at desc, r.id desc limit ")
            .push_bind(page.limit);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list runs", e))?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_bulk_runs(&self, page: &Page) -> Result<Vec<BulkQueueRun>, PipelineError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("select * from bulk_queue_runs where true");
        if let Some(c) = &page.before {
            qb.push(" and (created_at, id) < (")
                .push_bind(c.created_at)
                .push(", ")
                .push_bind(c.id)
                .push(")");
        }
        qb.push(" order by created_at desc, id desc limit ")
            .push_bind(page.limit);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list bulk runs", e))?;
        rows.iter().map(bulk_from_row).collect()
    }
}
