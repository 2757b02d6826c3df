//! Shared/exclusive reservations on named resources with a FIFO queue per
//! resource.
//!
//! Each resource keeps one queue of entries in arrival order. Granted
//! entries always form a prefix of the queue: a WRITE entry is granted only
//! at the head, and a READ entry is granted when no WRITE precedes it. The
//! table lives in memory; every entry is also persisted in its holder's
//! transaction record so [`LockManager::rebuild`] can restore it after a
//! restart.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::id::FateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Read,
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "READ"),
            LockType::Write => write!(f, "WRITE"),
        }
    }
}

/// Opaque resource key such as a table or namespace id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A lock an operation declares it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource: ResourceId,
    pub lock_type: LockType,
}

impl LockRequest {
    pub fn read(resource: impl Into<String>) -> Self {
        Self {
            resource: ResourceId::new(resource),
            lock_type: LockType::Read,
        }
    }

    pub fn write(resource: impl Into<String>) -> Self {
        Self {
            resource: ResourceId::new(resource),
            lock_type: LockType::Write,
        }
    }
}

/// A queued or granted request as persisted in the holder's record.
/// `seq` is the arrival order across all resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub resource: ResourceId,
    pub lock_type: LockType,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Queued,
    /// The request was malformed: an empty resource id, or a READ holder
    /// asking for WRITE without releasing first.
    Denied,
}

#[derive(Debug, Clone)]
struct Waiter {
    holder: FateId,
    lock_type: LockType,
    seq: u64,
    granted: bool,
}

/// Snapshot row for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    pub resource: ResourceId,
    pub holder: FateId,
    pub lock_type: LockType,
    pub seq: u64,
    pub granted: bool,
}

#[derive(Debug, Default)]
pub struct LockManager {
    queues: BTreeMap<ResourceId, VecDeque<Waiter>>,
    next_seq: u64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores the table from persisted entries. Entries are re-queued in
    /// their original arrival order, which grants the same holders again.
    pub fn rebuild(entries: impl IntoIterator<Item = (FateId, LockEntry)>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);

        let mut manager = Self::new();
        for (holder, entry) in entries {
            manager.next_seq = manager.next_seq.max(entry.seq + 1);
            manager
                .queues
                .entry(entry.resource)
                .or_default()
                .push_back(Waiter {
                    holder,
                    lock_type: entry.lock_type,
                    seq: entry.seq,
                    granted: false,
                });
        }
        let resources: Vec<_> = manager.queues.keys().cloned().collect();
        for resource in resources {
            manager.promote(&resource);
        }
        manager
    }

    /// Requests `lock_type` on `resource` for `holder`.
    ///
    /// Repeating a request already in the queue does not queue it again; it
    /// reports whether that earlier request has been granted yet.
    pub fn try_lock(&mut self, resource: &ResourceId, lock_type: LockType, holder: FateId) -> LockOutcome {
        if resource.as_str().trim().is_empty() {
            return LockOutcome::Denied;
        }

        if let Some(existing) = self.find(resource, holder) {
            return match (existing.lock_type, lock_type) {
                (LockType::Read, LockType::Write) => LockOutcome::Denied,
                _ if existing.granted => LockOutcome::Granted,
                _ => LockOutcome::Queued,
            };
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queues
            .entry(resource.clone())
            .or_default()
            .push_back(Waiter {
                holder,
                lock_type,
                seq,
                granted: false,
            });
        self.promote(resource);

        match self.find(resource, holder) {
            Some(waiter) if waiter.granted => LockOutcome::Granted,
            _ => LockOutcome::Queued,
        }
    }

    /// Removes `holder`'s entry on `resource`, granted or queued, and
    /// promotes the next compatible waiters. Returns false if there was none.
    pub fn unlock(&mut self, resource: &ResourceId, holder: FateId) -> bool {
        let Some(queue) = self.queues.get_mut(resource) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|waiter| waiter.holder != holder);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.queues.remove(resource);
        } else {
            self.promote(resource);
        }
        removed
    }

    /// Drops every entry of `holder`.
    pub fn unlock_all(&mut self, holder: FateId) {
        let resources: Vec<_> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.iter().any(|w| w.holder == holder))
            .map(|(resource, _)| resource.clone())
            .collect();
        for resource in resources {
            self.unlock(&resource, holder);
        }
    }

    /// The entries of `holder`, in the form persisted in its record.
    pub fn entries_for(&self, holder: FateId) -> Vec<LockEntry> {
        let mut entries: Vec<_> = self
            .queues
            .iter()
            .flat_map(|(resource, queue)| {
                queue
                    .iter()
                    .filter(move |w| w.holder == holder)
                    .map(move |w| LockEntry {
                        resource: resource.clone(),
                        lock_type: w.lock_type,
                        seq: w.seq,
                    })
            })
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    pub fn is_granted(&self, resource: &ResourceId, holder: FateId) -> bool {
        self.find(resource, holder).is_some_and(|w| w.granted)
    }

    pub fn snapshot(&self) -> Vec<LockState> {
        self.queues
            .iter()
            .flat_map(|(resource, queue)| {
                queue.iter().map(move |w| LockState {
                    resource: resource.clone(),
                    holder: w.holder,
                    lock_type: w.lock_type,
                    seq: w.seq,
                    granted: w.granted,
                })
            })
            .collect()
    }

    fn find(&self, resource: &ResourceId, holder: FateId) -> Option<&Waiter> {
        self.queues
            .get(resource)?
            .iter()
            .find(|w| w.holder == holder)
    }

    fn promote(&mut self, resource: &ResourceId) {
        let Some(queue) = self.queues.get_mut(resource) else {
            return;
        };
        for (index, waiter) in queue.iter_mut().enumerate() {
            match waiter.lock_type {
                LockType::Write => {
                    if index == 0 {
                        waiter.granted = true;
                    }
                    break;
                }
                LockType::Read => waiter.granted = true,
            }
        }
    }
}
