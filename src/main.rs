use std::{collections::BTreeMap, path::Path};

use anyhow::{bail, Context};
use clap::Parser;
use inquire::error::InquireResult;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod documents;
mod eid;
mod entities;
mod lock;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::{AppFactory, AppLocal, AppPaths};
use documents::{Collection, Document, DocumentStore};
use lock::FileLock;

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run `f` against an app with a live queue, then wait for every scheduled
/// job to finish.
fn with_queue<T>(
    app: &AppLocal,
    f: impl FnOnce(&AppLocal) -> Result<T, app::AppError>,
) -> anyhow::Result<T> {
    app.run_queue();
    let result = f(app);

    app.shutdown();
    app.wait_task_queue_finish();

    let dump = app.task_queue();
    let failed = dump
        .queue
        .iter()
        .filter(|td| matches!(td.status, app::task_runner::Status::Error(_)))
        .count();
    if failed > 0 {
        log::warn!("{failed} of {} refresh tasks failed", dump.queue.len());
    }

    Ok(result?)
}

fn import(paths: &AppPaths, collection: &str, file: &Path) -> anyhow::Result<usize> {
    let collection: Collection = collection.parse()?;

    let data = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let docs: BTreeMap<String, Document> = serde_json::from_slice(&data)
        .with_context(|| format!("{} is not an object of documents", file.display()))?;

    let store = AppFactory::open_documents(paths)?;
    for (id, doc) in &docs {
        store.set(collection, id, doc.clone())?;
    }

    Ok(docs.len())
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();
    let paths = AppFactory::get_paths()?;

    match args.command {
        cli::Command::Daemon {} => {
            let _lock = FileLock::try_acquire(&paths.base_path)?;
            let app = AppFactory::create_local_app(&paths)?;
            app.run_queue();
            web::start_daemon(app)
        }

        cli::Command::Refresh { kind, id } => {
            let _lock = FileLock::try_acquire(&paths.base_path)?;
            let app = AppFactory::create_local_app(&paths)?;
            with_queue(&app, |app| app.refresh_one(kind, &id))?;
            println!("refreshed {kind} {id}");
            Ok(())
        }

        cli::Command::RefreshAll { yes } => {
            let _lock = FileLock::try_acquire(&paths.base_path)?;
            let app = AppFactory::create_local_app(&paths)?;

            if !yes {
                match inquire::prompt_confirmation(
                    "This recomputes every profile and item embedding. Continue?",
                ) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            let counts = with_queue(&app, |app| app.refresh_all())?;
            print_json(&counts)
        }

        cli::Command::Batch { since, limit } => {
            let _lock = FileLock::try_acquire(&paths.base_path)?;
            let app = AppFactory::create_local_app(&paths)?;
            let counts = with_queue(&app, |app| app.batch_process(since.as_deref(), limit))?;
            print_json(&counts)
        }

        cli::Command::RefreshStale { kind } => {
            let _lock = FileLock::try_acquire(&paths.base_path)?;
            let app = AppFactory::create_local_app(&paths)?;
            let scheduled = with_queue(&app, |app| app.schedule_stale(kind))?;
            println!("{scheduled} stale {kind} embeddings refreshed");
            Ok(())
        }

        cli::Command::Recommend { profile_id, limit } => {
            let app = AppFactory::create_local_app(&paths)?;
            print_json(&app.recommend_for_profile(&profile_id, limit)?)
        }

        cli::Command::Search { text, limit } => {
            let app = AppFactory::create_local_app(&paths)?;
            print_json(&app.recommend_for_text(&text, limit)?)
        }

        cli::Command::Similar { profile_id, limit } => {
            let app = AppFactory::create_local_app(&paths)?;
            print_json(&app.similar_profiles(&profile_id, limit)?)
        }

        cli::Command::Analyze { text } => {
            let app = AppFactory::create_local_app(&paths)?;
            print_json(&app.analyze_text(&text)?)
        }

        cli::Command::Import { collection, file } => {
            let _lock = FileLock::try_acquire(&paths.base_path)?;
            let count = import(&paths, &collection, &file)?;
            println!("{count} documents imported into {collection}");
            Ok(())
        }
    }
}
