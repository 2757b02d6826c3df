use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fate::cli::{Cli, Command};
use fate::config::FateConfig;
use fate::fate::{FateId, FateStore, FileRecordStore, LockManager, TxStatus};
use fate::{demo, ui};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = FateConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.store_dir {
        config.store_dir = dir;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: FateConfig) -> Result<()> {
    match command {
        Command::Demo => return run_demo(config).await,
        Command::List { status } => {
            let store = open_store(&config)?;
            let summaries: Vec<_> = store
                .summaries()
                .await?
                .into_iter()
                .filter(|s| status.is_none_or(|wanted| s.status == wanted))
                .collect();
            ui::print_summaries(&summaries);
        }
        Command::Show { id, json } => {
            let store = open_store(&config)?;
            let record = store
                .read(id)
                .await?
                .with_context(|| format!("no transaction {id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                ui::print_summary(&record.summary(chrono::Utc::now()));
            }
        }
        Command::Locks => {
            let store = open_store(&config)?;
            let entries = store
                .list_all()
                .await?
                .into_iter()
                .filter(|record| !record.status.is_terminal())
                .flat_map(|record| {
                    let id = record.id;
                    record.locks.into_iter().map(move |entry| (id, entry))
                })
                .collect::<Vec<_>>();
            ui::print_lock_table(&LockManager::rebuild(entries).snapshot());
        }
        Command::Cancel { id } => {
            let store = open_store(&config)?;
            let prior = store.cancel(id).await?;
            let outcome = if prior == TxStatus::New {
                "deleted"
            } else {
                "will be unwound"
            };
            println!("{} {id} ({prior}) {outcome}", Style::new().yellow().apply_to("cancelled"));
        }
        Command::Delete { id } => {
            open_store(&config)?.delete(id).await?;
            println!("{} {id}", Style::new().red().apply_to("deleted"));
        }
        Command::Wait { id } => {
            let store = open_store(&config)?;
            let status = wait(&store, id, config.poll_interval()).await?;
            if status != TxStatus::Successful {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn open_store(config: &FateConfig) -> Result<FateStore> {
    let records = FileRecordStore::open(&config.store_dir)
        .with_context(|| format!("cannot open store at {}", config.store_dir.display()))?;
    Ok(FateStore::configured(Arc::new(records), config))
}

async fn wait(store: &FateStore, id: FateId, interval: Duration) -> Result<TxStatus> {
    let progress = ui::WaitProgress::start(id);
    loop {
        let status = store.status(id).await?;
        if status.is_terminal() || status == TxStatus::Unknown {
            progress.finish(id, status);
            return Ok(status);
        }
        progress.update(id, status);
        tokio::time::sleep(interval).await;
    }
}

async fn run_demo(config: FateConfig) -> Result<()> {
    let dir = tempfile::tempdir()?;
    println!(
        "{} scratch store at {}",
        Style::new().cyan().bold().apply_to("demo"),
        dir.path().display()
    );
    let report = demo::run(config, dir.path()).await?;

    ui::print_summaries(&report.summaries);
    for summary in &report.summaries {
        if summary.failure.is_some() {
            println!();
            ui::print_summary(summary);
        }
    }
    println!();
    for (name, table_id) in &report.tables {
        println!("  table {name} -> {table_id}");
    }
    Ok(())
}
