use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id::FateId;
use super::lock::LockEntry;
use super::status::TxStatus;
use super::step::StoredStep;
use crate::error::{FateError, Result};

/// Leased right to execute a transaction's next step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Worker that owns the lease, for observability only.
    pub holder: String,
    /// Identifies this particular claim; compared on every mutation.
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// An undo that raised an error during unwind. Kept for manual remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoFailure {
    pub step: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Durable state of one transaction.
///
/// All mutations go through the methods below so that every store backend
/// enforces the same rules: only the live reservation holder mutates the
/// stack or status, terminal records never change, and status moves only
/// along [`TxStatus::can_transition_to`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub id: FateId,
    /// Incremented by the store on every successful write.
    pub version: u64,
    pub status: TxStatus,
    /// Bottom first; the last element runs next.
    pub stack: Vec<StoredStep>,
    pub reservation: Option<Reservation>,
    #[serde(default)]
    pub locks: Vec<LockEntry>,
    #[serde(default)]
    pub op_name: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub undo_failures: Vec<UndoFailure>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl TxRecord {
    pub fn new(id: FateId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            version: 0,
            status: TxStatus::New,
            stack: Vec::new(),
            reservation: None,
            locks: Vec::new(),
            op_name: None,
            failure: None,
            undo_failures: Vec::new(),
            created_at: now,
            last_updated: now,
        }
    }

    pub fn top(&self) -> Option<&StoredStep> {
        self.stack.last()
    }

    pub fn is_reserved(&self, now: DateTime<Utc>) -> bool {
        self.reservation.as_ref().is_some_and(|r| r.is_live(now))
    }

    /// Claims the record unless a live reservation exists. An expired lease
    /// belongs to a dead worker and is taken over.
    pub fn reserve(
        &mut self,
        holder: &str,
        lease: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Option<Reservation> {
        if self.status.is_terminal() || self.is_reserved(now) {
            return None;
        }
        let reservation = Reservation {
            holder: holder.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + lease,
        };
        self.reservation = Some(reservation.clone());
        self.last_updated = now;
        Some(reservation)
    }

    /// Extends the lease. Returns the new reservation, or `None` if the
    /// claim was lost.
    pub fn renew(
        &mut self,
        reservation: &Reservation,
        lease: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Option<Reservation> {
        let current = self.reservation.as_mut()?;
        if current.token != reservation.token {
            return None;
        }
        current.expires_at = now + lease;
        Some(current.clone())
    }

    pub fn unreserve(&mut self, reservation: &Reservation, now: DateTime<Utc>) -> Result<()> {
        self.check_holder(reservation)?;
        self.reservation = None;
        self.last_updated = now;
        Ok(())
    }

    pub fn push(&mut self, reservation: &Reservation, step: StoredStep, now: DateTime<Utc>) -> Result<()> {
        self.check_mutable(reservation)?;
        self.stack.push(step);
        self.last_updated = now;
        Ok(())
    }

    pub fn pop(&mut self, reservation: &Reservation, now: DateTime<Utc>) -> Result<StoredStep> {
        self.check_mutable(reservation)?;
        let step = self
            .stack
            .pop()
            .ok_or_else(|| FateError::invariant(self.id, "pop on an empty stack"))?;
        self.last_updated = now;
        Ok(step)
    }

    pub fn set_status(&mut self, reservation: &Reservation, status: TxStatus, now: DateTime<Utc>) -> Result<()> {
        self.check_holder(reservation)?;
        self.transition(status)?;
        self.last_updated = now;
        Ok(())
    }

    /// Moves a NEW record to SUBMITTED in one write, together with its
    /// initial step, operation name and queued lock entries.
    pub fn seed(
        &mut self,
        step: StoredStep,
        op_name: &str,
        locks: Vec<LockEntry>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_reserved(now) {
            return Err(FateError::invariant(self.id, "seeded while reserved"));
        }
        self.transition(TxStatus::Submitted)?;
        if !self.stack.is_empty() {
            return Err(FateError::invariant(self.id, "seeded with a non-empty stack"));
        }
        self.stack.push(step);
        self.op_name = Some(op_name.to_string());
        self.locks = locks;
        self.last_updated = now;
        Ok(())
    }

    /// Finishes the operation successfully in one write: the stack and the
    /// lock entries are cleared and the status becomes SUCCESSFUL.
    pub fn complete(&mut self, reservation: &Reservation, now: DateTime<Utc>) -> Result<()> {
        self.check_holder(reservation)?;
        if self.status == TxStatus::Submitted {
            self.transition(TxStatus::InProgress)?;
        }
        self.transition(TxStatus::Successful)?;
        self.stack.clear();
        self.locks.clear();
        self.last_updated = now;
        Ok(())
    }

    /// Ends an unwind: FAILED_IN_PROGRESS with an empty stack becomes FAILED
    /// and the lock entries are dropped in the same write.
    pub fn finish_failed(&mut self, reservation: &Reservation, now: DateTime<Utc>) -> Result<()> {
        self.check_holder(reservation)?;
        if !self.stack.is_empty() {
            return Err(FateError::invariant(self.id, "unwind finished with steps left"));
        }
        self.transition(TxStatus::Failed)?;
        self.locks.clear();
        self.last_updated = now;
        Ok(())
    }

    /// Enters FAILED_IN_PROGRESS in one write, recording why. With
    /// `discard_top` the failing step leaves the stack without being undone.
    pub fn mark_failed(
        &mut self,
        reservation: &Reservation,
        reason: &str,
        discard_top: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_holder(reservation)?;
        self.transition(TxStatus::FailedInProgress)?;
        if discard_top {
            self.stack.pop();
        }
        self.failure = Some(reason.to_string());
        self.last_updated = now;
        Ok(())
    }

    pub fn set_locks(&mut self, reservation: &Reservation, locks: Vec<LockEntry>, now: DateTime<Utc>) -> Result<()> {
        self.check_holder(reservation)?;
        self.locks = locks;
        self.last_updated = now;
        Ok(())
    }

    pub fn record_undo_failure(&mut self, reservation: &Reservation, step: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.check_mutable(reservation)?;
        self.undo_failures.push(UndoFailure {
            step: step.to_string(),
            error: error.to_string(),
            at: now,
        });
        self.last_updated = now;
        Ok(())
    }

    /// Cancels a transaction no worker has claimed. SUBMITTED records move
    /// to FAILED_IN_PROGRESS and their never-run step is discarded.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TxStatus::Submitted || self.is_reserved(now) {
            return Err(FateError::NotCancellable {
                id: self.id,
                status: self.status,
            });
        }
        self.transition(TxStatus::FailedInProgress)?;
        self.stack.clear();
        self.failure = Some("cancelled".to_string());
        self.reservation = None;
        self.last_updated = now;
        Ok(())
    }

    pub fn summary(&self, now: DateTime<Utc>) -> TxSummary {
        TxSummary {
            id: self.id,
            status: self.status,
            op_name: self.op_name.clone(),
            top_step: self.top().map(|s| s.name.clone()),
            stack_depth: self.stack.len(),
            reserved_by: self
                .reservation
                .as_ref()
                .filter(|r| r.is_live(now))
                .map(|r| r.holder.clone()),
            locks: self.locks.clone(),
            failure: self.failure.clone(),
            undo_failures: self.undo_failures.clone(),
            created_at: self.created_at,
            last_updated: self.last_updated,
            age_ms: (now - self.created_at).num_milliseconds(),
        }
    }

    fn transition(&mut self, next: TxStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FateError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    fn check_holder(&self, reservation: &Reservation) -> Result<()> {
        match &self.reservation {
            Some(current) if current.token == reservation.token => Ok(()),
            Some(current) => Err(FateError::invariant(
                self.id,
                format!("reserved by {}, not {}", current.holder, reservation.holder),
            )),
            None => Err(FateError::invariant(
                self.id,
                format!("{} does not hold a reservation", reservation.holder),
            )),
        }
    }

    fn check_mutable(&self, reservation: &Reservation) -> Result<()> {
        self.check_holder(reservation)?;
        if self.status.is_terminal() {
            return Err(FateError::invariant(
                self.id,
                format!("stack of a {} transaction is frozen", self.status),
            ));
        }
        Ok(())
    }
}

/// Observability view of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxSummary {
    pub id: FateId,
    pub status: TxStatus,
    pub op_name: Option<String>,
    pub top_step: Option<String>,
    pub stack_depth: usize,
    pub reserved_by: Option<String>,
    pub locks: Vec<LockEntry>,
    pub failure: Option<String>,
    pub undo_failures: Vec<UndoFailure>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub age_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fate::lock::{LockType, ResourceId};
    use serde_json::json;

    fn step(name: &str) -> StoredStep {
        StoredStep {
            name: name.into(),
            version: 1,
            data: json!(null),
        }
    }

    fn lease() -> ChronoDuration {
        ChronoDuration::seconds(30)
    }

    fn reserved(status: TxStatus) -> (TxRecord, Reservation) {
        let now = Utc::now();
        let mut record = TxRecord::new(FateId::from_u128(1), now);
        record.status = status;
        let reservation = record.reserve("worker-1", lease(), now).unwrap();
        (record, reservation)
    }

    #[test]
    fn new_record_defaults() {
        let record = TxRecord::new(FateId::from_u128(1), Utc::now());
        assert_eq!(record.status, TxStatus::New);
        assert!(record.stack.is_empty());
        assert!(record.reservation.is_none());
        assert_eq!(record.version, 0);
    }

    #[test]
    fn only_one_live_reservation() {
        let (mut record, _) = reserved(TxStatus::Submitted);
        assert!(record.reserve("worker-2", lease(), Utc::now()).is_none());
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let now = Utc::now();
        let mut record = TxRecord::new(FateId::from_u128(1), now);
        record.status = TxStatus::InProgress;
        let stale = record
            .reserve("dead", ChronoDuration::milliseconds(10), now)
            .unwrap();

        let later = now + ChronoDuration::seconds(1);
        let fresh = record.reserve("alive", lease(), later).unwrap();
        assert_ne!(stale.token, fresh.token);

        // The dead worker can no longer touch the record.
        assert!(matches!(
            record.push(&stale, step("a"), later),
            Err(FateError::InvariantViolation { .. })
        ));
        assert!(record.renew(&stale, lease(), later).is_none());
        assert!(record.renew(&fresh, lease(), later).is_some());
    }

    #[test]
    fn push_and_pop_require_the_holder() {
        let (mut record, reservation) = reserved(TxStatus::InProgress);
        let now = Utc::now();
        record.push(&reservation, step("a"), now).unwrap();
        record.push(&reservation, step("b"), now).unwrap();
        assert_eq!(record.top().unwrap().name, "b");
        assert_eq!(record.pop(&reservation, now).unwrap().name, "b");

        record.unreserve(&reservation, now).unwrap();
        assert!(matches!(
            record.pop(&reservation, now),
            Err(FateError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn pop_on_empty_stack_is_an_invariant_violation() {
        let (mut record, reservation) = reserved(TxStatus::InProgress);
        assert!(record.pop(&reservation, Utc::now()).unwrap_err().is_fatal());
    }

    #[test]
    fn terminal_records_are_frozen() {
        let (mut record, reservation) = reserved(TxStatus::InProgress);
        let now = Utc::now();
        record.set_status(&reservation, TxStatus::Successful, now).unwrap();

        assert!(record.push(&reservation, step("a"), now).is_err());
        assert!(record.pop(&reservation, now).is_err());
        assert!(matches!(
            record.set_status(&reservation, TxStatus::InProgress, now),
            Err(FateError::InvalidTransition { .. })
        ));
        assert!(record.reserve("worker-2", lease(), now + lease() * 2).is_none());
    }

    #[test]
    fn mark_failed_discards_the_failing_step() {
        let (mut record, reservation) = reserved(TxStatus::InProgress);
        let now = Utc::now();
        record.push(&reservation, step("a"), now).unwrap();
        record.push(&reservation, step("b"), now).unwrap();

        record.mark_failed(&reservation, "boom", true, now).unwrap();
        assert_eq!(record.status, TxStatus::FailedInProgress);
        assert_eq!(record.failure.as_deref(), Some("boom"));
        assert_eq!(record.stack, vec![step("a")]);
    }

    #[test]
    fn mark_failed_can_keep_the_failing_step() {
        let (mut record, reservation) = reserved(TxStatus::InProgress);
        let now = Utc::now();
        record.push(&reservation, step("a"), now).unwrap();
        record.mark_failed(&reservation, "boom", false, now).unwrap();
        assert_eq!(record.stack.len(), 1);
    }

    #[test]
    fn seed_writes_step_name_and_locks_together() {
        let now = Utc::now();
        let mut record = TxRecord::new(FateId::from_u128(1), now);
        let entry = LockEntry {
            resource: ResourceId::new("t1"),
            lock_type: LockType::Write,
            seq: 7,
        };
        record.seed(step("a"), "create", vec![entry.clone()], now).unwrap();
        assert_eq!(record.status, TxStatus::Submitted);
        assert_eq!(record.stack, vec![step("a")]);
        assert_eq!(record.op_name.as_deref(), Some("create"));
        assert_eq!(record.locks, vec![entry]);

        assert!(matches!(
            record.seed(step("b"), "again", Vec::new(), now),
            Err(FateError::InvalidTransition { from: TxStatus::Submitted, .. })
        ));
    }

    #[test]
    fn seed_refuses_a_reserved_record() {
        let (mut record, _) = reserved(TxStatus::New);
        assert!(record.seed(step("a"), "x", Vec::new(), Utc::now()).unwrap_err().is_fatal());
        assert_eq!(record.status, TxStatus::New);
    }

    #[test]
    fn complete_clears_stack_and_locks() {
        let (mut record, reservation) = reserved(TxStatus::Submitted);
        let now = Utc::now();
        record.push(&reservation, step("a"), now).unwrap();
        record.push(&reservation, step("b"), now).unwrap();
        record.locks.push(LockEntry {
            resource: ResourceId::new("t1"),
            lock_type: LockType::Read,
            seq: 1,
        });

        record.complete(&reservation, now).unwrap();
        assert_eq!(record.status, TxStatus::Successful);
        assert!(record.stack.is_empty());
        assert!(record.locks.is_empty());
        assert!(record.complete(&reservation, now).is_err());
    }

    #[test]
    fn finish_failed_needs_an_empty_stack() {
        let (mut record, reservation) = reserved(TxStatus::InProgress);
        let now = Utc::now();
        record.push(&reservation, step("a"), now).unwrap();
        record.mark_failed(&reservation, "boom", false, now).unwrap();

        assert!(record.finish_failed(&reservation, now).unwrap_err().is_fatal());
        record.pop(&reservation, now).unwrap();
        record.finish_failed(&reservation, now).unwrap();
        assert_eq!(record.status, TxStatus::Failed);
    }

    #[test]
    fn cancel_only_unclaimed_submitted() {
        let now = Utc::now();
        let mut record = TxRecord::new(FateId::from_u128(1), now);
        assert!(matches!(
            record.cancel(now),
            Err(FateError::NotCancellable { status: TxStatus::New, .. })
        ));

        record.status = TxStatus::Submitted;
        record.stack.push(step("a"));
        let reservation = record.reserve("w", lease(), now).unwrap();
        assert!(record.cancel(now).is_err());

        record.unreserve(&reservation, now).unwrap();
        record.cancel(now).unwrap();
        assert_eq!(record.status, TxStatus::FailedInProgress);
        assert!(record.stack.is_empty());
    }

    #[test]
    fn summary_reports_age_and_holder() {
        let (mut record, reservation) = reserved(TxStatus::InProgress);
        let now = record.created_at + ChronoDuration::seconds(5);
        record.push(&reservation, step("compact"), now).unwrap();
        let summary = record.summary(now);
        assert_eq!(summary.age_ms, 5000);
        assert_eq!(summary.reserved_by.as_deref(), Some("worker-1"));
        assert_eq!(summary.top_step.as_deref(), Some("compact"));
        assert_eq!(summary.stack_depth, 1);
    }

    #[test]
    fn record_serialization_roundtrip() {
        let (record, _) = reserved(TxStatus::Submitted);
        let json = serde_json::to_string(&record).unwrap();
        let back: TxRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
