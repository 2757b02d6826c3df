use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PREFIX: &str = "FATE:";

/// Identifier of one tracked operation.
///
/// Ids order by their underlying UUID. Ids produced by [`RandomIdGenerator`]
/// are UUIDv7, so they also order by creation time and carry that timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FateId(Uuid);

impl FateId {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Creation time embedded in the id, if it was generated time-ordered.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

impl fmt::Display for FateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid fate id `{0}`")]
pub struct ParseFateIdError(String);

impl FromStr for FateId {
    type Err = ParseFateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| ParseFateIdError(s.to_string()))
    }
}

impl From<FateId> for String {
    fn from(id: FateId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for FateId {
    type Error = ParseFateIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Source of new transaction ids.
pub trait FateIdGenerator: Send + Sync {
    fn next_id(&self) -> FateId;
}

/// Time-ordered random ids for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl FateIdGenerator for RandomIdGenerator {
    fn next_id(&self) -> FateId {
        FateId(Uuid::now_v7())
    }
}

/// Deterministic ids: the high 64 bits are the seed, the low 64 bits count up
/// from zero. Two generators with the same seed produce the same sequence.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    seed: u64,
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            counter: AtomicU64::new(0),
        }
    }
}

impl FateIdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> FateId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        FateId::from_u128(((self.seed as u128) << 64) | n as u128)
    }
}

/// Hands out a caller-supplied sequence of ids, then falls back to a
/// sequential generator. Lets a test force which transaction sorts first.
#[derive(Debug)]
pub struct ScriptedIdGenerator {
    script: Mutex<VecDeque<FateId>>,
    fallback: SequentialIdGenerator,
}

impl ScriptedIdGenerator {
    pub fn new(ids: impl IntoIterator<Item = FateId>, fallback_seed: u64) -> Self {
        Self {
            script: Mutex::new(ids.into_iter().collect()),
            fallback: SequentialIdGenerator::new(fallback_seed),
        }
    }
}

impl FateIdGenerator for ScriptedIdGenerator {
    fn next_id(&self) -> FateId {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| self.fallback.next_id())
    }
}
