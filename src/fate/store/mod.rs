//! Durable transaction records.
//!
//! [`RecordStore`] is the primitive external store: single-record reads,
//! inserts, compare-and-set writes and ordered scans. [`FateStore`] builds
//! the transaction contract on top of it (reservation, stack mutation,
//! status transitions) with optimistic CAS retry loops, so it works over
//! any backend that offers atomic single-record updates.

pub mod file;
pub mod memory;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use super::id::{FateId, FateIdGenerator, RandomIdGenerator};
use super::lock::LockEntry;
use super::record::{Reservation, TxRecord, TxSummary};
use super::status::TxStatus;
use super::step::StoredStep;
use crate::config::FateConfig;
use crate::error::{FateError, Result};

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;

const CAS_ATTEMPTS: usize = 32;
const CREATE_ATTEMPTS: usize = 8;
const SCAN_PAGE: usize = 256;

/// Result of a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    Success,
    NotFound,
    VersionConflict { actual: u64 },
}

impl CasResult {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Primitive record storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stores a new record. Returns false if the id is taken.
    async fn insert(&self, record: &TxRecord) -> Result<bool>;

    async fn get(&self, id: &FateId) -> Result<Option<TxRecord>>;

    /// Replaces the stored record if its version equals `expected_version`.
    async fn compare_and_set(&self, expected_version: u64, record: &TxRecord) -> Result<CasResult>;

    /// Deletes the record if its version equals `expected_version`.
    async fn remove(&self, id: &FateId, expected_version: u64) -> Result<CasResult>;

    /// Up to `limit` records with ids strictly greater than `after`, in id
    /// order.
    async fn scan(&self, after: Option<FateId>, limit: usize) -> Result<Vec<TxRecord>>;
}

/// Process-local map of ids a worker asked not to retry yet.
#[derive(Debug)]
struct Deferrals {
    until: HashMap<FateId, Instant>,
    max: usize,
}

impl Deferrals {
    fn defer(&mut self, id: FateId, delay: Duration) {
        if delay.is_zero() {
            self.until.remove(&id);
            return;
        }
        self.until.insert(id, Instant::now() + delay);
        if self.until.len() > self.max {
            warn!(
                deferred = self.until.len(),
                max = self.max,
                "too many deferred transactions, making all of them eligible again"
            );
            self.until.clear();
        }
    }

    fn is_deferred(&mut self, id: &FateId, now: Instant) -> bool {
        match self.until.get(id) {
            Some(until) if *until > now => true,
            Some(_) => {
                self.until.remove(id);
                false
            }
            None => false,
        }
    }
}

/// The transaction store.
pub struct FateStore {
    records: Arc<dyn RecordStore>,
    ids: Arc<dyn FateIdGenerator>,
    lease: ChronoDuration,
    deferrals: Mutex<Deferrals>,
}

impl FateStore {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            ids: Arc::new(RandomIdGenerator),
            lease: ChronoDuration::seconds(60),
            deferrals: Mutex::new(Deferrals {
                until: HashMap::new(),
                max: 10_000,
            }),
        }
    }

    /// A store using the lease and deferral limits from `config`.
    pub fn configured(records: Arc<dyn RecordStore>, config: &FateConfig) -> Self {
        Self::new(records)
            .with_lease(config.lease_duration())
            .with_max_deferred(config.max_deferred)
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn FateIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = ChronoDuration::from_std(lease).unwrap_or(ChronoDuration::seconds(60));
        self
    }

    pub fn with_max_deferred(self, max: usize) -> Self {
        self.deferrals_mut().max = max;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease.to_std().unwrap_or(Duration::from_secs(60))
    }

    /// Allocates an id and stores a NEW record with an empty stack.
    pub async fn create(&self) -> Result<FateId> {
        for _ in 0..CREATE_ATTEMPTS {
            let id = self.ids.next_id();
            if self.records.insert(&TxRecord::new(id, Utc::now())).await? {
                debug!(fate_id = %id, "created transaction");
                return Ok(id);
            }
            warn!(fate_id = %id, "generated id already in use");
        }
        Err(FateError::StoreUnavailable(
            "could not allocate an unused transaction id".to_string(),
        ))
    }

    pub async fn read(&self, id: FateId) -> Result<Option<TxRecord>> {
        self.records.get(&id).await
    }

    pub async fn status(&self, id: FateId) -> Result<TxStatus> {
        Ok(self
            .records
            .get(&id)
            .await?
            .map_or(TxStatus::Unknown, |record| record.status))
    }

    /// Claims exclusive execution rights. `None` means another live
    /// reservation holds the record or it is terminal.
    pub async fn try_reserve(&self, id: FateId, holder: &str) -> Result<Option<Reservation>> {
        let lease = self.lease;
        self.update(id, |record, now| Ok(record.reserve(holder, lease, now)))
            .await
    }

    pub async fn renew(&self, id: FateId, reservation: &Reservation) -> Result<Option<Reservation>> {
        let lease = self.lease;
        self.update(id, |record, now| Ok(record.renew(reservation, lease, now)))
            .await
    }

    /// Releases the reservation. The scheduler will not hand `id` out again
    /// until `deferral` has elapsed.
    pub async fn unreserve(&self, id: FateId, reservation: &Reservation, deferral: Duration) -> Result<()> {
        self.update(id, |record, now| record.unreserve(reservation, now))
            .await?;
        self.deferrals_mut().defer(id, deferral);
        Ok(())
    }

    pub async fn push(&self, id: FateId, reservation: &Reservation, step: StoredStep) -> Result<()> {
        self.update(id, |record, now| record.push(reservation, step.clone(), now))
            .await
    }

    pub async fn pop(&self, id: FateId, reservation: &Reservation) -> Result<StoredStep> {
        self.update(id, |record, now| record.pop(reservation, now))
            .await
    }

    pub async fn set_status(&self, id: FateId, reservation: &Reservation, status: TxStatus) -> Result<()> {
        self.update(id, |record, now| record.set_status(reservation, status, now))
            .await
    }

    /// Moves a NEW record to SUBMITTED with its first step, operation name
    /// and lock entries in a single write.
    pub async fn seed(&self, id: FateId, step: StoredStep, op_name: &str, locks: Vec<LockEntry>) -> Result<()> {
        self.update(id, |record, now| {
            record.seed(step.clone(), op_name, locks.clone(), now)
        })
        .await
    }

    /// Marks the operation SUCCESSFUL and drops its stack and lock entries
    /// in a single write.
    pub async fn complete(&self, id: FateId, reservation: &Reservation) -> Result<()> {
        self.update(id, |record, now| record.complete(reservation, now))
            .await
    }

    /// Ends an unwind: FAILED with no lock entries, in a single write.
    pub async fn finish_failed(&self, id: FateId, reservation: &Reservation) -> Result<()> {
        self.update(id, |record, now| record.finish_failed(reservation, now))
            .await
    }

    pub async fn mark_failed(
        &self,
        id: FateId,
        reservation: &Reservation,
        reason: &str,
        discard_top: bool,
    ) -> Result<()> {
        self.update(id, |record, now| {
            record.mark_failed(reservation, reason, discard_top, now)
        })
        .await
    }

    pub async fn set_locks(&self, id: FateId, reservation: &Reservation, locks: Vec<LockEntry>) -> Result<()> {
        self.update(id, |record, now| record.set_locks(reservation, locks.clone(), now))
            .await
    }

    pub async fn record_undo_failure(
        &self,
        id: FateId,
        reservation: &Reservation,
        step: &str,
        error: &str,
    ) -> Result<()> {
        self.update(id, |record, now| {
            record.record_undo_failure(reservation, step, error, now)
        })
        .await
    }

    /// Cancels a transaction that has not started. A NEW record is deleted
    /// outright; an unclaimed SUBMITTED record is moved to
    /// FAILED_IN_PROGRESS so the scheduler unwinds it and releases its
    /// queued locks. Returns the status the record had.
    pub async fn cancel(&self, id: FateId) -> Result<TxStatus> {
        for _ in 0..CAS_ATTEMPTS {
            let record = self.records.get(&id).await?.ok_or(FateError::NotFound(id))?;
            let result = match record.status {
                TxStatus::New => self.records.remove(&id, record.version).await?,
                _ => {
                    let mut next = record.clone();
                    next.cancel(Utc::now())?;
                    next.version = record.version + 1;
                    self.records.compare_and_set(record.version, &next).await?
                }
            };
            match result {
                CasResult::Success => return Ok(record.status),
                CasResult::NotFound => return Err(FateError::NotFound(id)),
                CasResult::VersionConflict { .. } => tokio::task::yield_now().await,
            }
        }
        Err(FateError::VersionConflict(id))
    }

    /// Removes a SUCCESSFUL, FAILED or NEW record.
    pub async fn delete(&self, id: FateId) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let record = self.records.get(&id).await?.ok_or(FateError::NotFound(id))?;
            if !(record.status.is_terminal() || record.status == TxStatus::New) {
                return Err(FateError::NotDeletable {
                    id,
                    status: record.status,
                });
            }
            match self.records.remove(&id, record.version).await? {
                CasResult::Success => {
                    self.deferrals_mut().until.remove(&id);
                    return Ok(());
                }
                CasResult::NotFound => return Err(FateError::NotFound(id)),
                CasResult::VersionConflict { .. } => tokio::task::yield_now().await,
            }
        }
        Err(FateError::VersionConflict(id))
    }

    /// Lazy, restartable walk over every record in id order.
    pub fn list(&self) -> ListCursor<'_> {
        ListCursor {
            store: self,
            after: None,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn list_all(&self) -> Result<Vec<TxRecord>> {
        let mut cursor = self.list();
        let mut all = Vec::new();
        while let Some(record) = cursor.next().await? {
            all.push(record);
        }
        Ok(all)
    }

    pub async fn summaries(&self) -> Result<Vec<TxSummary>> {
        let now = Utc::now();
        Ok(self
            .list_all()
            .await?
            .iter()
            .map(|record| record.summary(now))
            .collect())
    }

    /// Ids a worker may pick up now: non-terminal past NEW, not held by a
    /// live reservation, not deferred. Ordered by id.
    pub async fn runnable(&self) -> Result<Vec<FateId>> {
        let records = self.list_all().await?;
        let now = Utc::now();
        let instant = Instant::now();
        let mut deferrals = self.deferrals_mut();
        Ok(records
            .into_iter()
            .filter(|record| record.status.is_runnable() && !record.is_reserved(now))
            .filter(|record| !deferrals.is_deferred(&record.id, instant))
            .map(|record| record.id)
            .collect())
    }

    async fn update<T, F>(&self, id: FateId, mut apply: F) -> Result<T>
    where
        F: FnMut(&mut TxRecord, DateTime<Utc>) -> Result<T> + Send,
        T: Send,
    {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.records.get(&id).await?.ok_or(FateError::NotFound(id))?;
            let mut next = current.clone();
            let out = apply(&mut next, Utc::now())?;
            if next == current {
                return Ok(out);
            }
            next.version = current.version + 1;
            match self.records.compare_and_set(current.version, &next).await? {
                CasResult::Success => return Ok(out),
                CasResult::NotFound => return Err(FateError::NotFound(id)),
                CasResult::VersionConflict { actual } => {
                    debug!(fate_id = %id, expected = current.version, actual, "cas conflict, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
        Err(FateError::VersionConflict(id))
    }

    fn deferrals_mut(&self) -> std::sync::MutexGuard<'_, Deferrals> {
        self.deferrals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pages through the store on demand. Start a new cursor to restart.
pub struct ListCursor<'a> {
    store: &'a FateStore,
    after: Option<FateId>,
    page: VecDeque<TxRecord>,
    exhausted: bool,
}

impl ListCursor<'_> {
    pub async fn next(&mut self) -> Result<Option<TxRecord>> {
        if self.page.is_empty() && !self.exhausted {
            let page = self.store.records.scan(self.after, SCAN_PAGE).await?;
            self.exhausted = page.len() < SCAN_PAGE;
            self.page.extend(page);
        }
        let next = self.page.pop_front();
        if let Some(record) = &next {
            self.after = Some(record.id);
        }
        Ok(next)
    }
}
