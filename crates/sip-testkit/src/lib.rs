//! In-memory test doubles for the pipeline seams.
//!
//! [`MemoryRunStore`] is a full `RunStore` over a mutex'd state table,
//! enforcing the same transition legality and active-run uniqueness as the
//! PostgreSQL implementation. [`CapturingQueue`] and [`CapturingNotifier`]
//! record what the pipeline would have enqueued/sent so tests assert on it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sip_db::{BulkCounter, Page, RunFilter, RunStore, StateUpdate, StockFilter};
use sip_schemas::state::{validate_failure_fields, validate_transition};
use sip_schemas::{
    BulkQueueRun, EntityChanged, Exchange, IngestionRun, IngestionState, PipelineError, Stock,
    StockMetadataPatch,
};
use sip_workers::notify::{Notifier, RunNotification};
use sip_workers::{Queue, Task};
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    stocks: Vec<Stock>,
    exchanges: Vec<Exchange>,
    runs: Vec<IngestionRun>,
    bulks: Vec<BulkQueueRun>,
}

pub struct MemoryRunStore {
    inner: Mutex<Inner>,
    events: Option<broadcast::Sender<EntityChanged>>,
    /// Remaining `apply_stock_metadata` calls that fail with a lock
    /// timeout. Lets tests exercise the retryable path.
    lock_timeouts: AtomicU32,
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRunStore {
    pub fn new() -> Self {
        MemoryRunStore {
            inner: Mutex::new(Inner::default()),
            events: None,
            lock_timeouts: AtomicU32::new(0),
        }
    }

    pub fn with_events(events: broadcast::Sender<EntityChanged>) -> Self {
        MemoryRunStore {
            inner: Mutex::new(Inner::default()),
            events: Some(events),
            lock_timeouts: AtomicU32::new(0),
        }
    }

    /// Make the next `n` metadata writebacks fail with a lock timeout.
    pub fn fail_next_locks(&self, n: u32) {
        self.lock_timeouts.store(n, Ordering::SeqCst);
    }

    fn publish(&self, event: EntityChanged) {
        if let Some(bus) = &self.events {
            let _ = bus.send(event);
        }
    }

    fn blank_stock(ticker: &str) -> Stock {
        let now = Utc::now();
        Stock {
            id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            name: None,
            sector: None,
            subindustry: None,
            industry: None,
            morningstar_sector: None,
            morningstar_industry: None,
            country: None,
            description: None,
            exchange_id: None,
            exchange: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn blank_run(stock: &Stock, requested_by: Option<&str>, request_id: &str) -> IngestionRun {
        let now = Utc::now();
        IngestionRun {
            id: Uuid::new_v4(),
            stock_id: stock.id,
            ticker: stock.ticker.clone(),
            bulk_queue_run_id: None,
            requested_by: requested_by.map(|s| s.to_string()),
            request_id: Some(request_id.to_string()),
            state: IngestionState::QueuedForFetch,
            created_at: now,
            updated_at: now,
            queued_for_fetch_at: Some(now),
            fetching_started_at: None,
            fetching_finished_at: None,
            queued_for_transform_at: None,
            transform_started_at: None,
            transform_finished_at: None,
            done_at: None,
            failed_at: None,
            error_code: None,
            error_message: None,
            raw_data_uri: None,
            processed_data_uri: None,
        }
    }

    /// Seed a stock row directly (no event).
    pub fn seed_stock(&self, ticker: &str) -> Stock {
        let stock = Self::blank_stock(ticker);
        self.inner.lock().unwrap().stocks.push(stock.clone());
        stock
    }

    /// Seed a run in an arbitrary state, backdated by `age_secs` so
    /// ordering by `created_at` is deterministic in tests.
    pub fn seed_run(&self, stock: &Stock, state: IngestionState, age_secs: i64) -> IngestionRun {
        let mut run = Self::blank_run(stock, None, "seeded");
        run.state = state;
        run.created_at = Utc::now() - Duration::seconds(age_secs);
        run.updated_at = run.created_at;
        if state == IngestionState::Failed {
            run.error_code = Some("SEEDED".to_string());
            run.error_message = Some("seeded failure".to_string());
            run.failed_at = Some(run.created_at);
        }
        if state == IngestionState::Done {
            run.done_at = Some(run.created_at);
        }
        self.inner.lock().unwrap().runs.push(run.clone());
        run
    }

    /// Overwrite a seeded run's raw data URI.
    pub fn set_raw_uri(&self, run_id: Uuid, uri: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.runs.iter_mut().find(|r| r.id == run_id) {
            run.raw_data_uri = Some(uri.to_string());
        }
    }

    pub fn all_runs(&self) -> Vec<IngestionRun> {
        self.inner.lock().unwrap().runs.clone()
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.inner.lock().unwrap().exchanges.clone()
    }
}

fn latest_for(runs: &[IngestionRun], stock_id: Uuid) -> Option<IngestionRun> {
    runs.iter()
        .filter(|r| r.stock_id == stock_id)
        .max_by_key(|r| (r.created_at, r.id))
        .cloned()
}

fn sort_desc<T, F: Fn(&T) -> (chrono::DateTime<Utc>, Uuid)>(items: &mut [T], key: F) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn apply_page<T: Clone, F: Fn(&T) -> (chrono::DateTime<Utc>, Uuid)>(
    mut items: Vec<T>,
    page: &Page,
    key: F,
) -> Vec<T> {
    sort_desc(&mut items, &key);
    items
        .into_iter()
        .filter(|item| match &page.before {
            Some(c) => key(item) < (c.created_at, c.id),
            None => true,
        })
        .take(page.limit.max(0) as usize)
        .collect()
}

fn ieq(value: &Option<String>, filter: &Option<String>) -> bool {
    match filter {
        None => true,
        Some(f) => value
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case(f)),
    }
}

fn icontains(value: &Option<String>, filter: &Option<String>) -> bool {
    match filter {
        None => true,
        Some(f) => value
            .as_deref()
            .is_some_and(|v| v.to_lowercase().contains(&f.to_lowercase())),
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn get_or_create_stock(&self, ticker: &str) -> Result<Stock, PipelineError> {
        let (stock, created) = {
            let mut inner = self.inner.lock().unwrap();
            match inner.stocks.iter().find(|s| s.ticker == ticker) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let stock = Self::blank_stock(ticker);
                    inner.stocks.push(stock.clone());
                    (stock, true)
                }
            }
        };
        if created {
            self.publish(EntityChanged::Stock);
        }
        Ok(stock)
    }

    async fn get_stock_by_ticker(&self, ticker: &str) -> Result<Option<Stock>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.stocks.iter().find(|s| s.ticker == ticker).cloned())
    }

    async fn apply_stock_metadata(
        &self,
        stock_id: Uuid,
        patch: &StockMetadataPatch,
    ) -> Result<Vec<String>, PipelineError> {
        if self
            .lock_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::DatabaseLockTimeout(
                "could not obtain lock on stock row".to_string(),
            ));
        }

        let mut fields = Vec::new();
        let mut exchange_touched = false;
        {
            let mut inner = self.inner.lock().unwrap();

            let exchange_link = if let Some(name) = patch.exchange.as_deref().filter(|v| !v.is_empty()) {
                let normalized = sip_schemas::normalize_ticker(name);
                let id = match inner.exchanges.iter().find(|e| e.name == normalized) {
                    Some(e) => e.id,
                    None => {
                        let now = Utc::now();
                        let exchange = Exchange {
                            id: Uuid::new_v4(),
                            name: normalized.clone(),
                            created_at: now,
                            updated_at: now,
                        };
                        let id = exchange.id;
                        inner.exchanges.push(exchange);
                        id
                    }
                };
                Some((id, normalized))
            } else {
                None
            };

            let stock = inner
                .stocks
                .iter_mut()
                .find(|s| s.id == stock_id)
                .ok_or_else(|| PipelineError::StockNotFound(stock_id.to_string()))?;

            if let Some((id, name)) = exchange_link {
                stock.exchange_id = Some(id);
                stock.exchange = Some(name);
                fields.push("exchange".to_string());
                exchange_touched = true;
            }

            let targets: [(&str, &Option<String>, &mut Option<String>); 8] = [
                ("name", &patch.name, &mut stock.name),
                ("sector", &patch.sector, &mut stock.sector),
                ("subindustry", &patch.subindustry, &mut stock.subindustry),
                ("industry", &patch.industry, &mut stock.industry),
                (
                    "morningstar_sector",
                    &patch.morningstar_sector,
                    &mut stock.morningstar_sector,
                ),
                (
                    "morningstar_industry",
                    &patch.morningstar_industry,
                    &mut stock.morningstar_industry,
                ),
                ("country", &patch.country, &mut stock.country),
                ("description", &patch.description, &mut stock.description),
            ];
            for (name, source, target) in targets {
                if let Some(v) = source {
                    *target = Some(v.clone());
                    fields.push(name.to_string());
                }
            }
            if !fields.is_empty() {
                stock.updated_at = Utc::now();
            }
        }

        if exchange_touched {
            self.publish(EntityChanged::Exchange);
        }
        if !fields.is_empty() {
            self.publish(EntityChanged::Stock);
        }
        Ok(fields)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<IngestionRun, PipelineError> {
        let inner = self.inner.lock().unwrap();
        inner
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    async fn latest_run_for_stock(
        &self,
        stock_id: Uuid,
    ) -> Result<Option<IngestionRun>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        Ok(latest_for(&inner.runs, stock_id))
    }

    async fn active_runs(&self) -> Result<Vec<IngestionRun>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.state.is_active())
            .cloned()
            .collect())
    }

    async fn latest_done_run(
        &self,
        stock_id: Uuid,
    ) -> Result<Option<IngestionRun>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.stock_id == stock_id && r.state == IngestionState::Done)
            .max_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn queue_for_fetch(
        &self,
        ticker: &str,
        requested_by: Option<&str>,
        request_id: &str,
    ) -> Result<(IngestionRun, bool), PipelineError> {
        let (result, stock_created) = {
            let mut inner = self.inner.lock().unwrap();
            let (stock, stock_created) = match inner.stocks.iter().find(|s| s.ticker == ticker) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let stock = Self::blank_stock(ticker);
                    inner.stocks.push(stock.clone());
                    (stock, true)
                }
            };

            let result = if let Some(latest) = latest_for(&inner.runs, stock.id) {
                if latest.is_in_progress() {
                    Ok((latest, false))
                } else if inner
                    .runs
                    .iter()
                    .any(|r| r.stock_id == stock.id && r.state.is_active())
                {
                    // Mirrors the partial-unique constraint: the latest run
                    // is terminal but an older active run still exists.
                    Err(PipelineError::DuplicateActiveRun(ticker.to_string()))
                } else {
                    let run = Self::blank_run(&stock, requested_by, request_id);
                    inner.runs.push(run.clone());
                    Ok((run, true))
                }
            } else {
                let run = Self::blank_run(&stock, requested_by, request_id);
                inner.runs.push(run.clone());
                Ok((run, true))
            };
            (result, stock_created)
        };
        // Only a freshly created stock row dirties the list views; the
        // idempotent fast-path touches nothing.
        if stock_created && result.is_ok() {
            self.publish(EntityChanged::Stock);
        }
        result
    }

    async fn update_run_state(
        &self,
        run_id: Uuid,
        new_state: IngestionState,
        update: StateUpdate,
    ) -> Result<IngestionRun, PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(PipelineError::RunNotFound(run_id))?;

        validate_transition(run.state, new_state)?;
        validate_failure_fields(
            new_state,
            update.error_code.as_deref(),
            update.error_message.as_deref(),
        )?;

        let now = Utc::now();
        run.state = new_state;
        run.updated_at = now;

        // First entry wins on retry.
        let slot = match new_state {
            IngestionState::QueuedForFetch => &mut run.queued_for_fetch_at,
            IngestionState::Fetching => &mut run.fetching_started_at,
            IngestionState::Fetched => &mut run.fetching_finished_at,
            IngestionState::QueuedForTransform => &mut run.queued_for_transform_at,
            IngestionState::TransformRunning => &mut run.transform_started_at,
            IngestionState::TransformFinished => &mut run.transform_finished_at,
            IngestionState::Done => &mut run.done_at,
            IngestionState::Failed => &mut run.failed_at,
        };
        slot.get_or_insert(now);

        if let Some(code) = update.error_code {
            run.error_code = Some(code);
        }
        if let Some(msg) = update.error_message {
            run.error_message = Some(msg);
        }
        if let Some(uri) = update.raw_data_uri {
            run.raw_data_uri = Some(uri);
        }
        if let Some(uri) = update.processed_data_uri {
            run.processed_data_uri = Some(uri);
        }
        Ok(run.clone())
    }

    async fn create_bulk_run(
        &self,
        requested_by: Option<&str>,
    ) -> Result<BulkQueueRun, PipelineError> {
        let bulk = BulkQueueRun {
            id: Uuid::new_v4(),
            requested_by: requested_by.map(|s| s.to_string()),
            total_stocks: 0,
            queued_count: 0,
            skipped_count: 0,
            error_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.inner.lock().unwrap().bulks.push(bulk.clone());
        Ok(bulk)
    }

    async fn get_bulk_run(&self, id: Uuid) -> Result<BulkQueueRun, PipelineError> {
        let inner = self.inner.lock().unwrap();
        inner
            .bulks
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(PipelineError::BulkRunNotFound(id))
    }

    async fn bulk_mark_started(&self, id: Uuid) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(b) = inner.bulks.iter_mut().find(|b| b.id == id) {
            b.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn bulk_set_total(&self, id: Uuid, total: i64) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(b) = inner.bulks.iter_mut().find(|b| b.id == id) {
            b.total_stocks = total;
        }
        Ok(())
    }

    async fn bulk_adjust_counter(
        &self,
        id: Uuid,
        counter: BulkCounter,
        delta: i64,
    ) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(b) = inner.bulks.iter_mut().find(|b| b.id == id) {
            match counter {
                BulkCounter::Queued => b.queued_count += delta,
                BulkCounter::Skipped => b.skipped_count += delta,
                BulkCounter::Error => b.error_count += delta,
            }
        }
        Ok(())
    }

    async fn bulk_mark_completed(&self, id: Uuid) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(b) = inner.bulks.iter_mut().find(|b| b.id == id) {
            b.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn link_run_to_bulk(&self, run_id: Uuid, bulk_id: Uuid) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.runs.iter_mut().find(|r| r.id == run_id) {
            if run.bulk_queue_run_id != Some(bulk_id) {
                run.bulk_queue_run_id = Some(bulk_id);
                run.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn bulk_state_counts(
        &self,
        bulk_id: Uuid,
    ) -> Result<Vec<(IngestionState, i64)>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        let mut counts: Vec<(IngestionState, i64)> = Vec::new();
        for run in inner.runs.iter().filter(|r| r.bulk_queue_run_id == Some(bulk_id)) {
            match counts.iter_mut().find(|(s, _)| *s == run.state) {
                Some((_, n)) => *n += 1,
                None => counts.push((run.state, 1)),
            }
        }
        Ok(counts)
    }

    async fn list_tickers(&self, exchange: Option<&str>) -> Result<Vec<String>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        let mut tickers: Vec<String> = inner
            .stocks
            .iter()
            .filter(|s| match exchange {
                Some(name) => s.exchange.as_deref() == Some(name),
                None => true,
            })
            .map(|s| s.ticker.clone())
            .collect();
        tickers.sort();
        Ok(tickers)
    }

    async fn list_stocks(
        &self,
        filter: &StockFilter,
        page: &Page,
    ) -> Result<Vec<Stock>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        let matches: Vec<Stock> = inner
            .stocks
            .iter()
            .filter(|s| {
                ieq(&Some(s.ticker.clone()), &filter.ticker)
                    && icontains(&Some(s.ticker.clone()), &filter.ticker_contains)
                    && ieq(&s.sector, &filter.sector)
                    && icontains(&s.sector, &filter.sector_contains)
                    && ieq(&s.exchange, &filter.exchange)
                    && ieq(&s.country, &filter.country)
            })
            .cloned()
            .collect();
        Ok(apply_page(matches, page, |s| (s.created_at, s.id)))
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: &Page,
    ) -> Result<Vec<IngestionRun>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        let matches: Vec<IngestionRun> = inner
            .runs
            .iter()
            .filter(|r| {
                ieq(&Some(r.ticker.clone()), &filter.ticker)
                    && icontains(&Some(r.ticker.clone()), &filter.ticker_contains)
                    && filter.state.map_or(true, |s| r.state == s)
                    && ieq(&r.requested_by, &filter.requested_by)
                    && icontains(&r.requested_by, &filter.requested_by_contains)
                    && filter.created_after.map_or(true, |t| r.created_at >= t)
                    && filter.created_before.map_or(true, |t| r.created_at <= t)
                    && filter.is_terminal.map_or(true, |t| r.is_terminal() == t)
                    && filter
                        .is_in_progress
                        .map_or(true, |p| r.is_in_progress() == p)
            })
            .cloned()
            .collect();
        Ok(apply_page(matches, page, |r| (r.created_at, r.id)))
    }

    async fn list_bulk_runs(&self, page: &Page) -> Result<Vec<BulkQueueRun>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        Ok(apply_page(inner.bulks.clone(), page, |b| {
            (b.created_at, b.id)
        }))
    }
}

// ---------------------------------------------------------------------------
// CapturingQueue
// ---------------------------------------------------------------------------

/// Records enqueued tasks; optionally fails the next N enqueues to test the
/// broker-error paths.
#[derive(Default)]
pub struct CapturingQueue {
    tasks: Mutex<Vec<Task>>,
    fail_enqueues: AtomicU32,
}

impl CapturingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_enqueues(&self, n: u32) {
        self.fail_enqueues.store(n, Ordering::SeqCst);
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.kind() == kind)
            .count()
    }
}

#[async_trait]
impl Queue for CapturingQueue {
    async fn enqueue(&self, task: Task) -> Result<(), PipelineError> {
        if self
            .fail_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::Broker("enqueue rejected by test".to_string()));
        }
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CapturingNotifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CapturingNotifier {
    sent: Mutex<Vec<RunNotification>>,
    fail_all: AtomicBool,
}

impl CapturingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<RunNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn notify(&self, note: &RunNotification) -> Result<(), PipelineError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(PipelineError::Unexpected("notifier down".to_string()));
        }
        self.sent.lock().unwrap().push(note.clone());
        Ok(())
    }
}
