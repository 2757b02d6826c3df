//! Directory-backed record store: one JSON document per transaction.
//!
//! Every write goes to a temp file in the same directory and is renamed
//! over the target, so a crash leaves either the old or the new record and
//! never a torn one. Compare-and-set is serialised by an in-process mutex;
//! a directory must not be shared by two live processes. The work runs on
//! tokio's blocking pool so it never stalls the workers.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use super::{CasResult, RecordStore};
use crate::error::{FateError, Result};
use crate::fate::id::FateId;
use crate::fate::record::TxRecord;

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileRecordStore {
    dir: Arc<RecordDir>,
}

#[derive(Debug)]
struct RecordDir {
    path: PathBuf,
    write_lock: Mutex<()>,
}

fn poison_err<T>(_: PoisonError<T>) -> FateError {
    FateError::StoreUnavailable("store write lock poisoned".to_string())
}

impl FileRecordStore {
    /// Opens the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let path = dir.into();
        fs::create_dir_all(&path)?;
        Ok(Self {
            dir: Arc::new(RecordDir {
                path,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir.path
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&RecordDir) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let dir = Arc::clone(&self.dir);
        tokio::task::spawn_blocking(move || op(&dir))
            .await
            .map_err(|e| FateError::StoreUnavailable(format!("store task failed: {e}")))?
    }
}

impl RecordDir {
    fn path_for(&self, id: &FateId) -> PathBuf {
        self.path.join(format!("{}.{EXTENSION}", id.uuid()))
    }

    fn load(&self, id: &FateId) -> Result<Option<TxRecord>> {
        match fs::read(self.path_for(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, record: &TxRecord) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.path)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(&record.id))
            .map_err(|e| FateError::Io(e.error))?;
        Ok(())
    }

    fn ids(&self) -> Result<Vec<FateId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            // Temp files and anything foreign are skipped.
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<FateId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Runs `write` under the write lock if the stored version matches.
    fn checked<F>(&self, id: &FateId, expected_version: u64, write: F) -> Result<CasResult>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        let _guard = self.write_lock.lock().map_err(poison_err)?;
        let Some(current) = self.load(id)? else {
            return Ok(CasResult::NotFound);
        };
        if current.version != expected_version {
            return Ok(CasResult::VersionConflict {
                actual: current.version,
            });
        }
        write(self)?;
        Ok(CasResult::Success)
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn insert(&self, record: &TxRecord) -> Result<bool> {
        let record = record.clone();
        self.blocking(move |dir| {
            let _guard = dir.write_lock.lock().map_err(poison_err)?;
            if dir.path_for(&record.id).exists() {
                return Ok(false);
            }
            dir.write(&record)?;
            Ok(true)
        })
        .await
    }

    async fn get(&self, id: &FateId) -> Result<Option<TxRecord>> {
        let id = *id;
        self.blocking(move |dir| dir.load(&id)).await
    }

    async fn compare_and_set(&self, expected_version: u64, record: &TxRecord) -> Result<CasResult> {
        let record = record.clone();
        self.blocking(move |dir| {
            dir.checked(&record.id, expected_version, |dir| dir.write(&record))
        })
        .await
    }

    async fn remove(&self, id: &FateId, expected_version: u64) -> Result<CasResult> {
        let id = *id;
        self.blocking(move |dir| {
            dir.checked(&id, expected_version, |dir| {
                fs::remove_file(dir.path_for(&id))?;
                Ok(())
            })
        })
        .await
    }

    async fn scan(&self, after: Option<FateId>, limit: usize) -> Result<Vec<TxRecord>> {
        self.blocking(move |dir| {
            let mut records = Vec::new();
            for id in dir.ids()?.into_iter().filter(|id| after.is_none_or(|a| *id > a)) {
                if records.len() == limit {
                    break;
                }
                // Deleted between listing and reading.
                if let Some(record) = dir.load(&id)? {
                    records.push(record);
                }
            }
            Ok(records)
        })
        .await
    }
}
