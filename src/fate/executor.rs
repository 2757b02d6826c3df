//! The scheduler: a pool of workers that drives transactions to a terminal
//! status.
//!
//! Each worker repeatedly picks a runnable transaction, reserves it, runs one
//! step of it, persists the outcome and releases the reservation. Running a
//! single step per reservation bounds how long one operation can hold a
//! worker. Everything a step changes is written to the store before the next
//! step runs, so after a crash a new worker resumes from the persisted stack.
//!
//! Lock requests of an operation are queued when it is seeded, all at once,
//! so arrival order is the same on every resource. That total order is what
//! keeps conflicting operations FIFO and free of deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::id::FateId;
use super::lock::{LockManager, LockOutcome, LockState};
use super::record::{Reservation, TxRecord, TxSummary};
use super::status::TxStatus;
use super::step::{BoxStep, Step, StepContext, StepRegistry};
use super::store::FateStore;
use crate::config::{DeferralExhaustion, FateConfig};
use crate::error::{FateError, Result};

/// Per-transaction counters kept by this process only.
#[derive(Debug, Default, Clone, Copy)]
struct Attempts {
    not_ready: u32,
    lock_waits: u32,
}

enum LockProgress {
    Granted,
    Waiting,
    Denied(String),
}

/// Aborts the lease renewal task when the step it covers ends, including
/// when the worker itself is aborted. `lost` flips to true once the lease
/// can no longer be renewed.
struct Heartbeat {
    task: JoinHandle<()>,
    lost: watch::Receiver<bool>,
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Inner<E> {
    store: Arc<FateStore>,
    registry: Arc<StepRegistry<E>>,
    env: Arc<E>,
    config: FateConfig,
    locks: Mutex<LockManager>,
    attempts: Mutex<HashMap<FateId, Attempts>>,
    wakeup: Notify,
    shutdown: watch::Receiver<bool>,
}

/// Fault-tolerant executor over a [`FateStore`].
pub struct Fate<E: Send + Sync + 'static> {
    inner: Arc<Inner<E>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    instance: String,
}

impl<E: Send + Sync + 'static> Fate<E> {
    /// Builds an executor and reconstructs the lock table from the locks
    /// persisted in every unfinished transaction. Workers start with
    /// [`Fate::start`].
    pub async fn new(
        config: FateConfig,
        store: Arc<FateStore>,
        registry: StepRegistry<E>,
        env: Arc<E>,
    ) -> Result<Self> {
        config.validate()?;

        let persisted: Vec<_> = store
            .list_all()
            .await?
            .into_iter()
            .filter(|record| !record.status.is_terminal())
            .flat_map(|record| {
                let id = record.id;
                record.locks.into_iter().map(move |entry| (id, entry))
            })
            .collect();
        debug!(entries = persisted.len(), "rebuilt lock table");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let instance = Uuid::new_v4().simple().to_string()[..8].to_string();

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry: Arc::new(registry),
                env,
                config,
                locks: Mutex::new(LockManager::rebuild(persisted)),
                attempts: Mutex::new(HashMap::new()),
                wakeup: Notify::new(),
                shutdown: shutdown_rx,
            }),
            shutdown: shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            instance,
        })
    }

    /// Spawns the worker pool, plus the retention cleaner when configured.
    pub fn start(&self) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return;
        }
        for n in 0..self.inner.config.workers {
            let name = format!("{}-worker-{n}", self.instance);
            tasks.push(tokio::spawn(Arc::clone(&self.inner).worker_loop(name)));
        }
        if let Some(retention) = self.inner.config.retention() {
            tasks.push(tokio::spawn(Arc::clone(&self.inner).cleaner_loop(retention)));
        }
        info!(
            instance = %self.instance,
            workers = self.inner.config.workers,
            "fate executor started"
        );
    }

    pub fn store(&self) -> &Arc<FateStore> {
        &self.inner.store
    }

    /// Allocates a NEW transaction.
    pub async fn create(&self) -> Result<FateId> {
        self.inner.store.create().await
    }

    /// Pushes the initial step of a NEW transaction, queues the locks it
    /// declares and moves it to SUBMITTED. The record changes in one write,
    /// so a failed seed leaves it NEW with an empty stack.
    pub async fn seed(&self, id: FateId, step: BoxStep<E>) -> Result<()> {
        let inner = &self.inner;
        let stored = inner.registry.encode(step.as_ref())?;
        let record = inner.store.read(id).await?.ok_or(FateError::NotFound(id))?;
        if record.status != TxStatus::New {
            return Err(FateError::InvalidTransition {
                id,
                from: record.status,
                to: TxStatus::Submitted,
            });
        }

        let entries = {
            let mut locks = lock(&inner.locks);
            for request in step.locks() {
                if locks.try_lock(&request.resource, request.lock_type, id) == LockOutcome::Denied {
                    locks.unlock_all(id);
                    return Err(FateError::LockDenied {
                        id,
                        resource: request.resource.to_string(),
                    });
                }
            }
            locks.entries_for(id)
        };

        if let Err(e) = inner.store.seed(id, stored, step.name(), entries).await {
            // A concurrent seed of the same id may have won; its locks stay.
            let seeded_elsewhere = matches!(
                inner.store.status(id).await,
                Ok(status) if status != TxStatus::New && status != TxStatus::Unknown
            );
            if !seeded_elsewhere {
                lock(&inner.locks).unlock_all(id);
            }
            return Err(e);
        }
        debug!(fate_id = %id, op = step.name(), "seeded transaction");
        inner.wakeup.notify_waiters();
        Ok(())
    }

    pub async fn submit(&self, step: BoxStep<E>) -> Result<FateId> {
        let id = self.create().await?;
        self.seed(id, step).await?;
        Ok(id)
    }

    pub async fn status(&self, id: FateId) -> Result<TxStatus> {
        self.inner.store.status(id).await
    }

    /// Cancels a transaction that has not started executing. See
    /// [`FateStore::cancel`].
    pub async fn cancel(&self, id: FateId) -> Result<TxStatus> {
        let prior = self.inner.store.cancel(id).await?;
        if prior == TxStatus::New {
            lock(&self.inner.locks).unlock_all(id);
        }
        info!(fate_id = %id, %prior, "cancelled transaction");
        self.inner.wakeup.notify_waiters();
        Ok(prior)
    }

    pub async fn delete(&self, id: FateId) -> Result<()> {
        self.inner.store.delete(id).await?;
        lock(&self.inner.attempts).remove(&id);
        Ok(())
    }

    /// Polls until the transaction is SUCCESSFUL or FAILED. Returns UNKNOWN
    /// if the record disappears.
    pub async fn wait_for_completion(&self, id: FateId) -> Result<TxStatus> {
        let interval = self
            .inner
            .config
            .poll_interval()
            .clamp(Duration::from_millis(5), Duration::from_secs(1));
        loop {
            let status = self.inner.store.status(id).await?;
            if status.is_terminal() || status == TxStatus::Unknown {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn summaries(&self) -> Result<Vec<TxSummary>> {
        self.inner.store.summaries().await
    }

    pub fn lock_table(&self) -> Vec<LockState> {
        lock(&self.inner.locks).snapshot()
    }

    /// Asks workers to stop after their current step and waits up to
    /// `grace` for them. Workers still running after that are aborted; their
    /// reservations lapse when the lease expires.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        self.inner.wakeup.notify_waiters();

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        let deadline = tokio::time::Instant::now() + grace;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
        info!(instance = %self.instance, "fate executor stopped");
    }
}

impl<E: Send + Sync + 'static> Drop for Fate<E> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl<E: Send + Sync + 'static> Inner<E> {
    async fn worker_loop(self: Arc<Self>, worker: String) {
        let mut shutdown = self.shutdown.clone();
        debug!(%worker, "worker started");
        while !*shutdown.borrow() {
            let ran = match self.run_once(&worker).await {
                Ok(ran) => ran,
                Err(e) if e.is_fatal() => {
                    error!(%worker, error = %e, "invariant violated");
                    false
                }
                Err(e) => {
                    debug!(%worker, error = %e, "worker iteration failed");
                    false
                }
            };
            if !ran {
                tokio::select! {
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        debug!(%worker, "worker stopped");
    }

    /// Runs one step of the first runnable transaction this worker manages
    /// to reserve. Returns false when there was nothing to do.
    async fn run_once(&self, worker: &str) -> Result<bool> {
        for id in self.store.runnable().await? {
            let reservation = match self.store.try_reserve(id, worker).await {
                Ok(Some(reservation)) => reservation,
                Ok(None) | Err(FateError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            self.execute(id, reservation).await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn execute(&self, id: FateId, reservation: Reservation) {
        let mut heartbeat = self.spawn_heartbeat(id, reservation.clone());
        let lost = async {
            if heartbeat.lost.wait_for(|lost| *lost).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        // Dropping the step future stops a step whose lease went to another
        // worker, so the same step never runs twice at once.
        let outcome = tokio::select! {
            outcome = self.step_transaction(id, &reservation) => outcome,
            () = lost => Err(FateError::ReservationLost(id)),
        };
        let deferral = match outcome {
            Ok(deferral) => deferral,
            Err(FateError::ReservationLost(_)) => {
                warn!(fate_id = %id, "reservation lost, step abandoned");
                self.wakeup.notify_waiters();
                return;
            }
            Err(e) if e.is_fatal() => {
                error!(fate_id = %id, error = %e, "invariant violated, leaving record untouched");
                Duration::from_millis(self.config.lock_retry_max_ms)
            }
            Err(e) => {
                warn!(fate_id = %id, error = %e, "step attempt did not complete, will retry");
                Duration::from_millis(self.config.lock_retry_max_ms)
            }
        };
        drop(heartbeat);

        if let Err(e) = self.store.unreserve(id, &reservation, deferral).await {
            warn!(fate_id = %id, error = %e, "failed to release reservation");
        }
        self.wakeup.notify_waiters();
    }

    fn spawn_heartbeat(&self, id: FateId, reservation: Reservation) -> Heartbeat {
        let store = Arc::clone(&self.store);
        let interval = self.config.heartbeat_interval();
        let (lost_tx, lost) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut reservation = reservation;
            loop {
                tokio::time::sleep(interval).await;
                match store.renew(id, &reservation).await {
                    Ok(Some(renewed)) => reservation = renewed,
                    Ok(None) => {
                        warn!(fate_id = %id, "reservation lost while a step was running");
                        let _ = lost_tx.send(true);
                        break;
                    }
                    Err(e) if !reservation.is_live(chrono::Utc::now()) => {
                        warn!(fate_id = %id, error = %e, "lease expired before it could be renewed");
                        let _ = lost_tx.send(true);
                        break;
                    }
                    Err(e) => warn!(fate_id = %id, error = %e, "failed to renew reservation"),
                }
            }
        });
        Heartbeat { task, lost }
    }

    /// Advances the transaction by one step and returns how long it should
    /// be deferred afterwards.
    async fn step_transaction(&self, id: FateId, reservation: &Reservation) -> Result<Duration> {
        let record = self.store.read(id).await?.ok_or(FateError::NotFound(id))?;
        match record.status {
            TxStatus::Submitted | TxStatus::InProgress => self.run_forward(&record, reservation).await,
            TxStatus::FailedInProgress => {
                self.unwind(id, reservation).await?;
                Ok(Duration::ZERO)
            }
            _ => Ok(Duration::ZERO),
        }
    }

    async fn run_forward(&self, record: &TxRecord, reservation: &Reservation) -> Result<Duration> {
        let id = record.id;

        match self.acquire_locks(record, reservation).await? {
            LockProgress::Granted => {}
            LockProgress::Waiting => {
                let waits = self.bump(id, |a| {
                    a.lock_waits += 1;
                    a.lock_waits
                });
                let delay = self.config.lock_retry().delay_for_attempt(waits);
                debug!(fate_id = %id, ?delay, "waiting for locks");
                return Ok(delay);
            }
            LockProgress::Denied(resource) => {
                let reason = format!("lock request on `{resource}` denied");
                self.fail(id, reservation, &reason, true).await?;
                self.unwind(id, reservation).await?;
                return Ok(Duration::ZERO);
            }
        }

        let Some(stored) = record.top() else {
            // Nothing left to run.
            self.complete(id, reservation).await?;
            return Ok(Duration::ZERO);
        };
        let step = self.registry.decode(stored)?;
        let span = info_span!("fate_step", fate_id = %id, step = step.name());
        let ctx = self.context(span.clone());

        let delay = match step.is_ready(id, &ctx).instrument(span.clone()).await {
            Ok(delay) => delay,
            Err(e) => {
                let reason = format!("{} readiness check failed: {e:#}", step.name());
                self.fail(id, reservation, &reason, !step.undo_after_failure()).await?;
                self.unwind(id, reservation).await?;
                return Ok(Duration::ZERO);
            }
        };
        if !delay.is_zero() {
            let deferrals = self.bump(id, |a| {
                a.not_ready += 1;
                a.not_ready
            });
            if deferrals <= self.config.max_deferrals {
                debug!(fate_id = %id, step = step.name(), ?delay, deferrals, "step not ready");
                return Ok(delay);
            }
            match self.config.on_deferrals_exhausted {
                DeferralExhaustion::Execute => {
                    warn!(fate_id = %id, step = step.name(), deferrals, "step still not ready, running it anyway");
                }
                DeferralExhaustion::Fail => {
                    let reason = format!("{} not ready after {deferrals} deferrals", step.name());
                    self.fail(id, reservation, &reason, true).await?;
                    self.unwind(id, reservation).await?;
                    return Ok(Duration::ZERO);
                }
            }
        }

        if record.status == TxStatus::Submitted {
            self.store
                .set_status(id, reservation, TxStatus::InProgress)
                .await?;
        }

        match step.call(id, &ctx).instrument(span).await {
            Ok(Some(next)) => {
                self.forget(id);
                match self.registry.encode(next.as_ref()) {
                    Ok(encoded) => {
                        debug!(fate_id = %id, from = step.name(), to = next.name(), "pushing step");
                        self.store.push(id, reservation, encoded).await?;
                    }
                    Err(e) => {
                        // The current step did finish, so it stays for undo.
                        let reason = format!("{} returned an unpersistable step: {e}", step.name());
                        self.fail(id, reservation, &reason, false).await?;
                        self.unwind(id, reservation).await?;
                    }
                }
            }
            Ok(None) => self.complete(id, reservation).await?,
            Err(e) => {
                let reason = format!("{} failed: {e:#}", step.name());
                self.fail(id, reservation, &reason, !step.undo_after_failure()).await?;
                self.unwind(id, reservation).await?;
            }
        }
        Ok(Duration::ZERO)
    }

    /// Checks every lock the transaction queued at seed time. Entries the
    /// table no longer knows are queued again and the record is updated.
    async fn acquire_locks(&self, record: &TxRecord, reservation: &Reservation) -> Result<LockProgress> {
        let id = record.id;
        let (progress, entries) = {
            let mut locks = lock(&self.locks);
            let mut progress = LockProgress::Granted;
            for entry in &record.locks {
                match locks.try_lock(&entry.resource, entry.lock_type, id) {
                    LockOutcome::Granted => {}
                    LockOutcome::Queued => progress = LockProgress::Waiting,
                    LockOutcome::Denied => {
                        progress = LockProgress::Denied(entry.resource.to_string());
                        break;
                    }
                }
            }
            (progress, locks.entries_for(id))
        };
        if !record.locks.is_empty() && entries != record.locks {
            self.store.set_locks(id, reservation, entries).await?;
        }
        Ok(progress)
    }

    /// Writes SUCCESSFUL with an empty stack in one write, then frees the
    /// in-memory locks.
    async fn complete(&self, id: FateId, reservation: &Reservation) -> Result<()> {
        self.store.complete(id, reservation).await?;
        self.release_locks(id);
        self.forget(id);
        info!(fate_id = %id, "transaction succeeded");
        Ok(())
    }

    async fn fail(&self, id: FateId, reservation: &Reservation, reason: &str, discard_top: bool) -> Result<()> {
        warn!(fate_id = %id, %reason, "transaction failed, unwinding");
        self.store
            .mark_failed(id, reservation, reason, discard_top)
            .await
    }

    /// Undoes the remaining stack top to bottom. An undo that fails is
    /// recorded on the transaction and the unwind carries on.
    async fn unwind(&self, id: FateId, reservation: &Reservation) -> Result<()> {
        loop {
            let record = self.store.read(id).await?.ok_or(FateError::NotFound(id))?;
            let Some(stored) = record.top().cloned() else {
                break;
            };
            let span = info_span!("fate_step", fate_id = %id, step = %stored.name);
            let undone = match self.registry.decode(&stored) {
                Ok(step) => {
                    let ctx = self.context(span.clone());
                    step.undo(id, &ctx)
                        .instrument(span)
                        .await
                        .map_err(|e| format!("{e:#}"))
                }
                Err(e) => Err(e.to_string()),
            };
            if let Err(error) = undone {
                warn!(fate_id = %id, step = %stored.name, %error, "undo failed, continuing unwind");
                self.store
                    .record_undo_failure(id, reservation, &stored.name, &error)
                    .await?;
            }
            self.store.pop(id, reservation).await?;
        }

        self.store.finish_failed(id, reservation).await?;
        self.release_locks(id);
        self.forget(id);
        info!(fate_id = %id, "transaction failed");
        Ok(())
    }

    fn release_locks(&self, id: FateId) {
        lock(&self.locks).unlock_all(id);
        self.wakeup.notify_waiters();
    }

    fn context(&self, span: tracing::Span) -> StepContext<E> {
        StepContext::new(Arc::clone(&self.env), span, self.shutdown.clone())
    }

    fn bump(&self, id: FateId, f: impl FnOnce(&mut Attempts) -> u32) -> u32 {
        f(lock(&self.attempts).entry(id).or_default())
    }

    fn forget(&self, id: FateId) {
        lock(&self.attempts).remove(&id);
    }

    async fn cleaner_loop(self: Arc<Self>, retention: Duration) {
        let mut shutdown = self.shutdown.clone();
        let period = (retention / 10).max(Duration::from_millis(10));
        while !*shutdown.borrow() {
            if let Err(e) = self.clean_finished(retention).await {
                warn!(error = %e, "retention cleanup failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Deletes terminal transactions untouched for longer than `retention`.
    async fn clean_finished(&self, retention: Duration) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| chrono::Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let mut removed = 0;
        for record in self.store.list_all().await? {
            if record.status.is_terminal() && record.last_updated < cutoff {
                match self.store.delete(record.id).await {
                    Ok(()) => removed += 1,
                    Err(FateError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        if removed > 0 {
            debug!(removed, "removed finished transactions past retention");
        }
        Ok(removed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::bail;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    use super::*;
    use crate::fate::lock::LockRequest;
    use crate::fate::step::StepOutcome;
    use crate::fate::store::{CasResult, FileRecordStore, MemoryRecordStore, RecordStore};

    #[derive(Default)]
    struct TestEnv {
        log: Mutex<Vec<String>>,
        active: Mutex<HashMap<FateId, usize>>,
        max_active: AtomicUsize,
        calls: Mutex<HashMap<FateId, usize>>,
        block_once: AtomicBool,
    }

    impl TestEnv {
        fn record(&self, event: impl Into<String>) {
            self.log.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    /// Step `n` of an operation `len` steps long. Fails in `call` at
    /// `fail_at` and in `undo` at `undo_fails_at`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Chain {
        op: String,
        n: u32,
        len: u32,
        fail_at: Option<u32>,
        undo_fails_at: Option<u32>,
        resource: Option<String>,
        #[serde(default)]
        undo_own_failure: bool,
    }

    impl Chain {
        fn new(op: &str, len: u32) -> Self {
            Self {
                op: op.to_string(),
                n: 1,
                len,
                fail_at: None,
                undo_fails_at: None,
                resource: None,
                undo_own_failure: false,
            }
        }

        fn failing_at(mut self, n: u32) -> Self {
            self.fail_at = Some(n);
            self
        }

        fn undo_failing_at(mut self, n: u32) -> Self {
            self.undo_fails_at = Some(n);
            self
        }

        fn writing(mut self, resource: &str) -> Self {
            self.resource = Some(resource.to_string());
            self
        }

        fn undoing_own_failure(mut self) -> Self {
            self.undo_own_failure = true;
            self
        }
    }

    #[async_trait]
    impl Step<TestEnv> for Chain {
        fn name(&self) -> &'static str {
            "chain"
        }

        fn to_json(&self) -> serde_json::Result<Value> {
            serde_json::to_value(self)
        }

        fn locks(&self) -> Vec<LockRequest> {
            self.resource.iter().map(LockRequest::write).collect()
        }

        fn undo_after_failure(&self) -> bool {
            self.undo_own_failure
        }

        async fn call(&self, _id: FateId, ctx: &StepContext<TestEnv>) -> StepOutcome<TestEnv> {
            ctx.env().record(format!("call {}.{}", self.op, self.n));
            tokio::time::sleep(Duration::from_millis(1)).await;
            if self.fail_at == Some(self.n) {
                bail!("{} step {} exploded", self.op, self.n);
            }
            if self.n == self.len {
                return Ok(None);
            }
            Ok(Some(Box::new(Chain {
                n: self.n + 1,
                ..self.clone()
            })))
        }

        async fn undo(&self, _id: FateId, ctx: &StepContext<TestEnv>) -> anyhow::Result<()> {
            ctx.env().record(format!("undo {}.{}", self.op, self.n));
            if self.undo_fails_at == Some(self.n) {
                bail!("could not restore {}", self.n);
            }
            Ok(())
        }
    }

    /// Tracks how many workers run the same transaction at once.
    #[derive(Debug, Serialize, Deserialize)]
    struct Counter {
        remaining: u32,
    }

    #[async_trait]
    impl Step<TestEnv> for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn to_json(&self) -> serde_json::Result<Value> {
            serde_json::to_value(self)
        }

        async fn call(&self, id: FateId, ctx: &StepContext<TestEnv>) -> StepOutcome<TestEnv> {
            let env = ctx.env();
            let concurrent = {
                let mut active = env.active.lock().unwrap();
                let count = active.entry(id).or_default();
                *count += 1;
                *count
            };
            env.max_active.fetch_max(concurrent, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            *env.active.lock().unwrap().get_mut(&id).unwrap() -= 1;
            *env.calls.lock().unwrap().entry(id).or_default() += 1;

            if self.remaining == 0 {
                Ok(None)
            } else {
                Ok(Some(Box::new(Counter {
                    remaining: self.remaining - 1,
                })))
            }
        }

        async fn undo(&self, _id: FateId, _ctx: &StepContext<TestEnv>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Second stage hangs forever on its first run, standing in for a worker
    /// that dies mid-step.
    #[derive(Debug, Serialize, Deserialize)]
    struct Hang {
        stage: u32,
    }

    #[async_trait]
    impl Step<TestEnv> for Hang {
        fn name(&self) -> &'static str {
            "hang"
        }

        fn to_json(&self) -> serde_json::Result<Value> {
            serde_json::to_value(self)
        }

        async fn call(&self, _id: FateId, ctx: &StepContext<TestEnv>) -> StepOutcome<TestEnv> {
            ctx.env().record(format!("hang.{}", self.stage));
            if self.stage == 1 {
                return Ok(Some(Box::new(Hang { stage: 2 })));
            }
            if ctx.env().block_once.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(None)
        }

        async fn undo(&self, _id: FateId, ctx: &StepContext<TestEnv>) -> anyhow::Result<()> {
            ctx.env().record(format!("undo hang.{}", self.stage));
            Ok(())
        }
    }

    /// Never ready.
    #[derive(Debug, Serialize, Deserialize)]
    struct Lazy;

    #[async_trait]
    impl Step<TestEnv> for Lazy {
        fn name(&self) -> &'static str {
            "lazy"
        }

        fn to_json(&self) -> serde_json::Result<Value> {
            serde_json::to_value(self)
        }

        async fn is_ready(&self, _id: FateId, _ctx: &StepContext<TestEnv>) -> anyhow::Result<Duration> {
            Ok(Duration::from_millis(2))
        }

        async fn call(&self, _id: FateId, ctx: &StepContext<TestEnv>) -> StepOutcome<TestEnv> {
            ctx.env().record("lazy ran");
            Ok(None)
        }

        async fn undo(&self, _id: FateId, ctx: &StepContext<TestEnv>) -> anyhow::Result<()> {
            ctx.env().record("undo lazy");
            Ok(())
        }
    }

    /// Runs until its future is dropped.
    #[derive(Debug, Serialize, Deserialize)]
    struct Stall;

    struct NoteOnDrop<'a>(&'a TestEnv);

    impl Drop for NoteOnDrop<'_> {
        fn drop(&mut self) {
            self.0.record("stall dropped");
        }
    }

    #[async_trait]
    impl Step<TestEnv> for Stall {
        fn name(&self) -> &'static str {
            "stall"
        }

        fn to_json(&self) -> serde_json::Result<Value> {
            serde_json::to_value(self)
        }

        async fn call(&self, _id: FateId, ctx: &StepContext<TestEnv>) -> StepOutcome<TestEnv> {
            let _note = NoteOnDrop(ctx.env());
            ctx.env().record("stall started");
            std::future::pending::<()>().await;
            Ok(None)
        }

        async fn undo(&self, _id: FateId, _ctx: &StepContext<TestEnv>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    type WritePredicate = Box<dyn Fn(&TxRecord) -> bool + Send>;

    /// Memory store whose first write matching a predicate fails with
    /// `StoreUnavailable`. Later writes go through.
    struct FlakyStore {
        records: MemoryRecordStore,
        fail_on: Mutex<Option<WritePredicate>>,
    }

    impl FlakyStore {
        fn failing_once(predicate: impl Fn(&TxRecord) -> bool + Send + 'static) -> Self {
            Self {
                records: MemoryRecordStore::new(),
                fail_on: Mutex::new(Some(Box::new(predicate))),
            }
        }

        fn tripped(&self) -> bool {
            self.fail_on.lock().unwrap().is_none()
        }
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn insert(&self, record: &TxRecord) -> Result<bool> {
            self.records.insert(record).await
        }

        async fn get(&self, id: &FateId) -> Result<Option<TxRecord>> {
            self.records.get(id).await
        }

        async fn compare_and_set(&self, expected_version: u64, record: &TxRecord) -> Result<CasResult> {
            let fail = {
                let mut fail_on = self.fail_on.lock().unwrap();
                let matched = fail_on.as_ref().is_some_and(|predicate| predicate(record));
                if matched {
                    fail_on.take();
                }
                matched
            };
            if fail {
                return Err(FateError::StoreUnavailable("injected write failure".into()));
            }
            self.records.compare_and_set(expected_version, record).await
        }

        async fn remove(&self, id: &FateId, expected_version: u64) -> Result<CasResult> {
            self.records.remove(id, expected_version).await
        }

        async fn scan(&self, after: Option<FateId>, limit: usize) -> Result<Vec<TxRecord>> {
            self.records.scan(after, limit).await
        }
    }

    fn registry() -> StepRegistry<TestEnv> {
        let mut registry = StepRegistry::new();
        registry
            .register_serde::<Chain>("chain")
            .register_serde::<Counter>("counter")
            .register_serde::<Hang>("hang")
            .register_serde::<Lazy>("lazy")
            .register_serde::<Stall>("stall");
        registry
    }

    fn config(workers: usize) -> FateConfig {
        FateConfig {
            workers,
            lease_duration_ms: 2_000,
            heartbeat_interval_ms: 500,
            poll_interval_ms: 5,
            lock_retry_base_ms: 2,
            lock_retry_max_ms: 20,
            ..FateConfig::default()
        }
    }

    fn memory_store(config: &FateConfig) -> Arc<FateStore> {
        Arc::new(FateStore::configured(
            Arc::new(MemoryRecordStore::new()),
            config,
        ))
    }

    async fn started(config: FateConfig, env: &Arc<TestEnv>) -> Fate<TestEnv> {
        let store = memory_store(&config);
        let fate = Fate::new(config, store, registry(), Arc::clone(env))
            .await
            .unwrap();
        fate.start();
        fate
    }

    async fn finish(fate: &Fate<TestEnv>, id: FateId) -> TxStatus {
        tokio::time::timeout(Duration::from_secs(10), fate.wait_for_completion(id))
            .await
            .expect("transaction did not finish in time")
            .unwrap()
    }

    fn strings(events: &[&str]) -> Vec<String> {
        events.iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test]
    async fn successful_chain_runs_every_step_once() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(2), &env).await;

        let id = fate
            .submit(Box::new(Chain::new("create", 3).writing("t1")))
            .await
            .unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Successful);

        assert_eq!(
            env.events(),
            strings(&["call create.1", "call create.2", "call create.3"])
        );
        let record = fate.store().read(id).await.unwrap().unwrap();
        assert!(record.stack.is_empty());
        assert!(record.locks.is_empty());
        assert_eq!(record.op_name.as_deref(), Some("chain"));
        assert!(fate.lock_table().is_empty());
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failing_second_step_undoes_the_first() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(2), &env).await;

        let id = fate
            .submit(Box::new(Chain::new("op", 2).failing_at(2)))
            .await
            .unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Failed);

        assert_eq!(env.events(), strings(&["call op.1", "call op.2", "undo op.1"]));
        let record = fate.store().read(id).await.unwrap().unwrap();
        assert!(record.stack.is_empty());
        assert!(record.failure.unwrap().contains("op step 2 exploded"));
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn undo_runs_in_strict_reverse_order_and_skips_the_failed_step() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(4), &env).await;

        let id = fate
            .submit(Box::new(Chain::new("k", 6).failing_at(4)))
            .await
            .unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Failed);

        assert_eq!(
            env.events(),
            strings(&[
                "call k.1", "call k.2", "call k.3", "call k.4", "undo k.3", "undo k.2", "undo k.1",
            ])
        );
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_undo_is_recorded_and_unwind_continues() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(1), &env).await;

        let id = fate
            .submit(Box::new(Chain::new("u", 3).failing_at(3).undo_failing_at(2)))
            .await
            .unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Failed);

        assert_eq!(
            env.events(),
            strings(&["call u.1", "call u.2", "call u.3", "undo u.2", "undo u.1"])
        );
        let record = fate.store().read(id).await.unwrap().unwrap();
        assert_eq!(record.undo_failures.len(), 1);
        assert_eq!(record.undo_failures[0].step, "chain");
        assert!(record.undo_failures[0].error.contains("could not restore 2"));
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn conflicting_writers_run_in_submission_order() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(16), &env).await;

        let first = fate
            .submit(Box::new(Chain::new("o1", 3).writing("t1")))
            .await
            .unwrap();
        let second = fate
            .submit(Box::new(Chain::new("o2", 3).writing("t1")))
            .await
            .unwrap();
        assert_eq!(finish(&fate, first).await, TxStatus::Successful);
        assert_eq!(finish(&fate, second).await, TxStatus::Successful);

        assert_eq!(
            env.events(),
            strings(&[
                "call o1.1", "call o1.2", "call o1.3", "call o2.1", "call o2.2", "call o2.3",
            ])
        );
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn disjoint_resources_both_complete() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(4), &env).await;

        let a = fate
            .submit(Box::new(Chain::new("a", 3).writing("t1")))
            .await
            .unwrap();
        let b = fate
            .submit(Box::new(Chain::new("b", 3).writing("t2")))
            .await
            .unwrap();
        assert_eq!(finish(&fate, a).await, TxStatus::Successful);
        assert_eq!(finish(&fate, b).await, TxStatus::Successful);
        assert_eq!(env.events().len(), 6);
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn no_transaction_is_ever_run_by_two_workers_at_once() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(8), &env).await;

        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(fate.submit(Box::new(Counter { remaining: 4 })).await.unwrap());
        }
        for id in &ids {
            assert_eq!(finish(&fate, *id).await, TxStatus::Successful);
        }

        assert_eq!(env.max_active.load(Ordering::SeqCst), 1);
        let calls = env.calls.lock().unwrap().clone();
        for id in &ids {
            assert_eq!(calls[id], 5, "{id} ran a step more than once");
        }
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn killed_worker_is_resumed_from_the_persisted_stack() {
        let env = Arc::new(TestEnv::default());
        env.block_once.store(true, Ordering::SeqCst);
        let config = FateConfig {
            lease_duration_ms: 300,
            heartbeat_interval_ms: 100,
            ..config(2)
        };
        let store = memory_store(&config);

        let crashed = Fate::new(config.clone(), Arc::clone(&store), registry(), Arc::clone(&env))
            .await
            .unwrap();
        crashed.start();
        let id = crashed
            .submit(Box::new(Hang { stage: 1 }))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !env.events().contains(&"hang.2".to_string()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        crashed.shutdown(Duration::ZERO).await;
        assert_eq!(store.status(id).await.unwrap(), TxStatus::InProgress);

        let recovered = Fate::new(config, Arc::clone(&store), registry(), Arc::clone(&env))
            .await
            .unwrap();
        recovered.start();
        assert_eq!(finish(&recovered, id).await, TxStatus::Successful);

        // Stage 1 finished before the crash and is not repeated.
        assert_eq!(env.events(), strings(&["hang.1", "hang.2", "hang.2"]));
        recovered.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unready_step_fails_once_deferrals_run_out() {
        let env = Arc::new(TestEnv::default());
        let config = FateConfig {
            max_deferrals: 2,
            on_deferrals_exhausted: DeferralExhaustion::Fail,
            ..config(1)
        };
        let fate = started(config, &env).await;

        let id = fate.submit(Box::new(Lazy)).await.unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Failed);
        // Never called, so never undone.
        assert!(env.events().is_empty());
        let failure = fate.store().read(id).await.unwrap().unwrap().failure.unwrap();
        assert!(failure.contains("not ready after 3 deferrals"));
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unready_step_is_forced_once_deferrals_run_out() {
        let env = Arc::new(TestEnv::default());
        let config = FateConfig {
            max_deferrals: 2,
            on_deferrals_exhausted: DeferralExhaustion::Execute,
            ..config(1)
        };
        let fate = started(config, &env).await;

        let id = fate.submit(Box::new(Lazy)).await.unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Successful);
        assert_eq!(env.events(), strings(&["lazy ran"]));
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cancelled_submission_fails_without_running_and_frees_its_locks() {
        let env = Arc::new(TestEnv::default());
        let config = config(2);
        let fate = Fate::new(config.clone(), memory_store(&config), registry(), Arc::clone(&env))
            .await
            .unwrap();

        let cancelled = fate
            .submit(Box::new(Chain::new("c", 2).writing("t1")))
            .await
            .unwrap();
        let waiting = fate
            .submit(Box::new(Chain::new("w", 1).writing("t1")))
            .await
            .unwrap();
        assert_eq!(fate.cancel(cancelled).await.unwrap(), TxStatus::Submitted);

        fate.start();
        assert_eq!(finish(&fate, cancelled).await, TxStatus::Failed);
        assert_eq!(finish(&fate, waiting).await, TxStatus::Successful);
        assert_eq!(env.events(), strings(&["call w.1"]));
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cancelled_new_transaction_is_gone() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(1), &env).await;
        let id = fate.create().await.unwrap();
        assert_eq!(fate.cancel(id).await.unwrap(), TxStatus::New);
        assert_eq!(fate.status(id).await.unwrap(), TxStatus::Unknown);
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn seeding_twice_is_rejected() {
        let env = Arc::new(TestEnv::default());
        let config = config(1);
        let fate = Fate::new(config.clone(), memory_store(&config), registry(), env)
            .await
            .unwrap();
        let id = fate.create().await.unwrap();
        fate.seed(id, Box::new(Chain::new("s", 1))).await.unwrap();
        assert!(matches!(
            fate.seed(id, Box::new(Chain::new("s", 1))).await,
            Err(FateError::InvalidTransition {
                from: TxStatus::Submitted,
                ..
            })
        ));
        let record = fate.store().read(id).await.unwrap().unwrap();
        assert_eq!(record.stack.len(), 1);
        assert!(record.reservation.is_none());
    }

    #[tokio::test]
    async fn unregistered_steps_cannot_be_submitted() {
        let env = Arc::new(TestEnv::default());
        let config = config(1);
        let fate = Fate::new(config.clone(), memory_store(&config), StepRegistry::new(), env)
            .await
            .unwrap();
        assert!(matches!(
            fate.submit(Box::new(Chain::new("x", 1))).await,
            Err(FateError::UnknownStep(name)) if name == "chain"
        ));
    }

    #[tokio::test]
    async fn lock_table_is_rebuilt_from_records() {
        let env = Arc::new(TestEnv::default());
        let config = config(1);
        let store = memory_store(&config);

        let before = Fate::new(config.clone(), Arc::clone(&store), registry(), Arc::clone(&env))
            .await
            .unwrap();
        let first = before
            .submit(Box::new(Chain::new("o1", 1).writing("t1")))
            .await
            .unwrap();
        let second = before
            .submit(Box::new(Chain::new("o2", 1).writing("t1")))
            .await
            .unwrap();
        let snapshot = before.lock_table();
        drop(before);

        let after = Fate::new(config, store, registry(), env).await.unwrap();
        assert_eq!(after.lock_table(), snapshot);
        let granted: Vec<_> = after
            .lock_table()
            .into_iter()
            .filter(|s| s.granted)
            .map(|s| s.holder)
            .collect();
        assert_eq!(granted, vec![first]);
        assert!(after.lock_table().iter().any(|s| s.holder == second && !s.granted));
    }

    #[tokio::test]
    async fn retention_cleaner_removes_finished_transactions() {
        let env = Arc::new(TestEnv::default());
        let config = FateConfig {
            retention_ms: Some(200),
            ..config(1)
        };
        let fate = started(config, &env).await;

        let id = fate.submit(Box::new(Chain::new("r", 1))).await.unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Successful);
        tokio::time::timeout(Duration::from_secs(5), async {
            while fate.status(id).await.unwrap() != TxStatus::Unknown {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("record was not cleaned up");
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn file_backed_executor_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(TestEnv::default());
        let config = config(2);
        let store = Arc::new(FateStore::configured(
            Arc::new(FileRecordStore::open(dir.path()).unwrap()),
            &config,
        ));
        let fate = Fate::new(config, store, registry(), Arc::clone(&env))
            .await
            .unwrap();
        fate.start();

        let ok = fate
            .submit(Box::new(Chain::new("f", 2).writing("t1")))
            .await
            .unwrap();
        let bad = fate
            .submit(Box::new(Chain::new("g", 2).failing_at(2).writing("t1")))
            .await
            .unwrap();
        assert_eq!(finish(&fate, ok).await, TxStatus::Successful);
        assert_eq!(finish(&fate, bad).await, TxStatus::Failed);
        assert_eq!(
            env.events(),
            strings(&["call f.1", "call f.2", "call g.1", "call g.2", "undo g.1"])
        );
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn summaries_expose_status_and_age() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(1), &env).await;
        let id = fate.submit(Box::new(Chain::new("s", 1))).await.unwrap();
        finish(&fate, id).await;

        let summaries = fate.summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, id);
        assert_eq!(summaries[0].status, TxStatus::Successful);
        assert!(summaries[0].age_ms >= 0);
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failing_step_that_opts_in_is_undone_first() {
        let env = Arc::new(TestEnv::default());
        let fate = started(config(2), &env).await;

        let id = fate
            .submit(Box::new(Chain::new("i", 3).failing_at(3).undoing_own_failure()))
            .await
            .unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Failed);

        assert_eq!(
            env.events(),
            strings(&["call i.1", "call i.2", "call i.3", "undo i.3", "undo i.2", "undo i.1"])
        );
        let record = fate.store().read(id).await.unwrap().unwrap();
        assert!(record.stack.is_empty());
        assert!(record.undo_failures.is_empty());
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unknown_step_waits_for_an_executor_that_knows_it() {
        let env = Arc::new(TestEnv::default());
        let config = config(1);
        let store = memory_store(&config);

        let seeding = Fate::new(config.clone(), Arc::clone(&store), registry(), Arc::clone(&env))
            .await
            .unwrap();
        let id = seeding.submit(Box::new(Chain::new("late", 1))).await.unwrap();
        drop(seeding);

        let mut outdated_registry = StepRegistry::new();
        outdated_registry.register_serde::<Lazy>("lazy");
        let outdated = Fate::new(config.clone(), Arc::clone(&store), outdated_registry, Arc::clone(&env))
            .await
            .unwrap();
        outdated.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.status(id).await.unwrap(), TxStatus::Submitted);
        assert_eq!(store.read(id).await.unwrap().unwrap().stack.len(), 1);
        outdated.shutdown(Duration::from_secs(1)).await;

        let upgraded = Fate::new(config, store, registry(), Arc::clone(&env))
            .await
            .unwrap();
        upgraded.start();
        assert_eq!(finish(&upgraded, id).await, TxStatus::Successful);
        assert_eq!(env.events(), strings(&["call late.1"]));
        upgraded.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_completion_write_reruns_only_the_last_step() {
        let env = Arc::new(TestEnv::default());
        let config = config(1);
        let records = Arc::new(FlakyStore::failing_once(|record| {
            record.status == TxStatus::Successful
        }));
        let store = Arc::new(FateStore::configured(records.clone(), &config));
        let fate = Fate::new(config, store, registry(), Arc::clone(&env))
            .await
            .unwrap();
        fate.start();

        let id = fate
            .submit(Box::new(Chain::new("x", 2).writing("t1")))
            .await
            .unwrap();
        assert_eq!(finish(&fate, id).await, TxStatus::Successful);
        assert!(records.tripped());

        // Only the step that was on top when the write failed runs again.
        assert_eq!(env.events(), strings(&["call x.1", "call x.2", "call x.2"]));
        let record = fate.store().read(id).await.unwrap().unwrap();
        assert!(record.stack.is_empty());
        assert!(record.locks.is_empty());
        assert!(fate.lock_table().is_empty());
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_seed_leaves_a_clean_record_that_can_be_seeded_again() {
        let env = Arc::new(TestEnv::default());
        let config = config(1);
        let records = Arc::new(FlakyStore::failing_once(|record| {
            record.status == TxStatus::Submitted
        }));
        let store = Arc::new(FateStore::configured(records.clone(), &config));
        let fate = Fate::new(config, store, registry(), Arc::clone(&env))
            .await
            .unwrap();

        let id = fate.create().await.unwrap();
        let err = fate
            .seed(id, Box::new(Chain::new("s", 1).writing("t1")))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        let record = fate.store().read(id).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::New);
        assert!(record.stack.is_empty());
        assert!(record.locks.is_empty());
        assert!(fate.lock_table().is_empty());

        fate.seed(id, Box::new(Chain::new("s", 1).writing("t1")))
            .await
            .unwrap();
        let record = fate.store().read(id).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Submitted);
        assert_eq!(record.stack.len(), 1);
        assert_eq!(record.locks.len(), 1);

        fate.start();
        assert_eq!(finish(&fate, id).await, TxStatus::Successful);
        assert_eq!(env.events(), strings(&["call s.1"]));
        fate.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn step_is_stopped_when_its_reservation_is_taken() {
        let env = Arc::new(TestEnv::default());
        let config = FateConfig {
            lease_duration_ms: 300,
            heartbeat_interval_ms: 100,
            ..config(1)
        };
        let records = Arc::new(MemoryRecordStore::new());
        let store = Arc::new(FateStore::configured(records.clone(), &config));
        let fate = Fate::new(config, Arc::clone(&store), registry(), Arc::clone(&env))
            .await
            .unwrap();
        fate.start();

        let id = fate.submit(Box::new(Stall)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !env.events().contains(&"stall started".to_string()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Another executor claims the record behind the worker's back.
        loop {
            let current = records.get(&id).await.unwrap().unwrap();
            let mut next = current.clone();
            next.version += 1;
            next.reservation = Some(Reservation {
                holder: "intruder".into(),
                token: Uuid::new_v4(),
                expires_at: chrono::Utc::now() + chrono::Duration::seconds(60),
            });
            if records.compare_and_set(current.version, &next).await.unwrap() == CasResult::Success {
                break;
            }
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while !env.events().contains(&"stall dropped".to_string()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("step kept running after its lease was lost");

        let record = store.read(id).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::InProgress);
        assert_eq!(record.reservation.unwrap().holder, "intruder");
        assert_eq!(env.events(), strings(&["stall started", "stall dropped"]));
        fate.shutdown(Duration::from_secs(1)).await;
    }
}
