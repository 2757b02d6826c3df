//! Built-in demonstration: a small table catalog managed through FATE.
//!
//! Two operations contend for the write lock on the same table. The first
//! creates it; the second tries to rename it onto a name that is already
//! taken, fails on its last step and has its earlier step undone.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::FateConfig;
use crate::fate::{
    Fate, FateId, FateStore, FileRecordStore, LockRequest, Step, StepContext, StepOutcome,
    StepRegistry, TxStatus, TxSummary,
};

/// The catalog the demo operations mutate: table name to table id.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: Mutex<BTreeMap<String, String>>,
    offline: Mutex<Vec<String>>,
}

impl Catalog {
    pub fn tables(&self) -> BTreeMap<String, String> {
        self.guard().clone()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_offline(&self, table: &str, offline: bool) {
        let mut list = self.offline.lock().unwrap_or_else(|p| p.into_inner());
        list.retain(|t| t != table);
        if offline {
            list.push(table.to_string());
        }
    }

    pub fn offline(&self) -> Vec<String> {
        self.offline.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Creates the catalog entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTable {
    pub name: String,
    pub table_id: String,
}

#[async_trait]
impl Step<Catalog> for CreateTable {
    fn name(&self) -> &'static str {
        "create_table"
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn locks(&self) -> Vec<LockRequest> {
        vec![LockRequest::read("namespace:default"), LockRequest::write(&self.name)]
    }

    async fn call(&self, _id: FateId, ctx: &StepContext<Catalog>) -> StepOutcome<Catalog> {
        let mut tables = ctx.env().guard();
        match tables.get(&self.name) {
            Some(existing) if *existing == self.table_id => {}
            Some(_) => bail!("table `{}` already exists", self.name),
            None => {
                tables.insert(self.name.clone(), self.table_id.clone());
            }
        }
        info!(table = %self.name, "table created");
        Ok(None)
    }

    async fn undo(&self, _id: FateId, ctx: &StepContext<Catalog>) -> anyhow::Result<()> {
        let mut tables = ctx.env().guard();
        if tables.get(&self.name) == Some(&self.table_id) {
            tables.remove(&self.name);
        }
        Ok(())
    }
}

/// First step of a rename: takes the table offline.
#[derive(Debug, Serialize, Deserialize)]
pub struct TakeOffline {
    pub from: String,
    pub to: String,
}

#[async_trait]
impl Step<Catalog> for TakeOffline {
    fn name(&self) -> &'static str {
        "take_offline"
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn locks(&self) -> Vec<LockRequest> {
        vec![LockRequest::write(&self.from), LockRequest::write(&self.to)]
    }

    async fn is_ready(&self, _id: FateId, ctx: &StepContext<Catalog>) -> anyhow::Result<Duration> {
        // Wait for the table to show up in the catalog.
        if ctx.env().guard().contains_key(&self.from) {
            Ok(Duration::ZERO)
        } else {
            Ok(Duration::from_millis(20))
        }
    }

    async fn call(&self, _id: FateId, ctx: &StepContext<Catalog>) -> StepOutcome<Catalog> {
        ctx.env().set_offline(&self.from, true);
        Ok(Some(Box::new(RenameEntry {
            from: self.from.clone(),
            to: self.to.clone(),
        })))
    }

    async fn undo(&self, _id: FateId, ctx: &StepContext<Catalog>) -> anyhow::Result<()> {
        ctx.env().set_offline(&self.from, false);
        Ok(())
    }
}

/// Second step of a rename: moves the catalog entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct RenameEntry {
    pub from: String,
    pub to: String,
}

#[async_trait]
impl Step<Catalog> for RenameEntry {
    fn name(&self) -> &'static str {
        "rename_entry"
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    async fn call(&self, _id: FateId, ctx: &StepContext<Catalog>) -> StepOutcome<Catalog> {
        let mut tables = ctx.env().guard();
        if tables.contains_key(&self.to) {
            bail!("cannot rename `{}`: `{}` already exists", self.from, self.to);
        }
        let table_id = tables
            .remove(&self.from)
            .with_context(|| format!("table `{}` disappeared", self.from))?;
        tables.insert(self.to.clone(), table_id);
        drop(tables);
        ctx.env().set_offline(&self.from, false);
        Ok(None)
    }

    async fn undo(&self, _id: FateId, ctx: &StepContext<Catalog>) -> anyhow::Result<()> {
        let mut tables = ctx.env().guard();
        if let Some(table_id) = tables.remove(&self.to) {
            tables.insert(self.from.clone(), table_id);
        }
        Ok(())
    }
}

pub fn registry() -> StepRegistry<Catalog> {
    let mut registry = StepRegistry::new();
    registry
        .register_serde::<CreateTable>("create_table")
        .register_serde::<TakeOffline>("take_offline")
        .register_serde::<RenameEntry>("rename_entry");
    registry
}

/// Outcome of a demo run.
#[derive(Debug)]
pub struct DemoReport {
    pub summaries: Vec<TxSummary>,
    pub tables: BTreeMap<String, String>,
    pub offline: Vec<String>,
}

/// Runs the demo against a file store under `dir`.
///
/// The catalog starts with table `archive`. `create_table(orders)` and
/// `rename(orders -> archive)` are submitted back to back, so the rename
/// waits for the create and then fails.
pub async fn run(config: FateConfig, dir: &Path) -> anyhow::Result<DemoReport> {
    let catalog = Arc::new(Catalog::default());
    catalog
        .guard()
        .insert("archive".to_string(), "t-0001".to_string());

    let store = Arc::new(FateStore::configured(
        Arc::new(FileRecordStore::open(dir)?),
        &config,
    ));
    let fate = Fate::new(config, store, registry(), Arc::clone(&catalog)).await?;
    fate.start();

    let create = fate
        .submit(Box::new(CreateTable {
            name: "orders".into(),
            table_id: "t-0002".into(),
        }))
        .await?;
    let rename = fate
        .submit(Box::new(TakeOffline {
            from: "orders".into(),
            to: "archive".into(),
        }))
        .await?;
    info!(%create, %rename, "demo operations submitted");

    for id in [create, rename] {
        let status = tokio::time::timeout(Duration::from_secs(30), fate.wait_for_completion(id))
            .await
            .with_context(|| format!("{id} did not finish"))??;
        info!(fate_id = %id, %status, "demo operation finished");
    }
    let summaries = fate.summaries().await?;
    fate.shutdown(Duration::from_secs(5)).await;

    Ok(DemoReport {
        summaries,
        tables: catalog.tables(),
        offline: catalog.offline(),
    })
}

impl DemoReport {
    pub fn status_of(&self, op_name: &str) -> TxStatus {
        self.summaries
            .iter()
            .find(|s| s.op_name.as_deref() == Some(op_name))
            .map_or(TxStatus::Unknown, |s| s.status)
    }
}
