//! In-memory record store.
//!
//! Suitable for tests and embedded single-process use. Nothing survives the
//! process.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{CasResult, RecordStore};
use crate::error::{FateError, Result};
use crate::fate::id::FateId;
use crate::fate::record::TxRecord;

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<FateId, TxRecord>>,
}

fn poison_err<T>(_: PoisonError<T>) -> FateError {
    FateError::StoreUnavailable("record lock poisoned".to_string())
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map_or(0, |records| records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &TxRecord) -> Result<bool> {
        let mut records = self.records.write().map_err(poison_err)?;
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id, record.clone());
        Ok(true)
    }

    async fn get(&self, id: &FateId) -> Result<Option<TxRecord>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records.get(id).cloned())
    }

    async fn compare_and_set(&self, expected_version: u64, record: &TxRecord) -> Result<CasResult> {
        let mut records = self.records.write().map_err(poison_err)?;
        let Some(current) = records.get_mut(&record.id) else {
            return Ok(CasResult::NotFound);
        };
        if current.version != expected_version {
            return Ok(CasResult::VersionConflict {
                actual: current.version,
            });
        }
        *current = record.clone();
        Ok(CasResult::Success)
    }

    async fn remove(&self, id: &FateId, expected_version: u64) -> Result<CasResult> {
        let mut records = self.records.write().map_err(poison_err)?;
        match records.get(id) {
            None => Ok(CasResult::NotFound),
            Some(current) if current.version != expected_version => Ok(CasResult::VersionConflict {
                actual: current.version,
            }),
            Some(_) => {
                records.remove(id);
                Ok(CasResult::Success)
            }
        }
    }

    async fn scan(&self, after: Option<FateId>, limit: usize) -> Result<Vec<TxRecord>> {
        let records = self.records.read().map_err(poison_err)?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(records
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }
}
